//! 记录存储抽象层
//!
//! 定义编排核心需要的持久化接口，支持内存和 SQLite 两种实现。
//! 会话锁字段只能经由 `try_acquire_lock` / `renew_lock` / `release_lock` / `clear_expired_locks`
//! 这组原子 CAS 原语修改；`update_session` 永远不会触碰锁字段。

pub mod memory;
pub mod sqlite;
pub mod types;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use types::*;

/// 存储层错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    /// 乐观并发版本不匹配
    #[error("Version conflict on {0}")]
    VersionConflict(String),

    #[error("Duplicate record: {0}")]
    Duplicate(String),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// 持久化接口
#[async_trait]
pub trait RecordStore: Send + Sync {
    // ----- 门户会话 -----

    async fn insert_session(&self, session: &PortalSession) -> StoreResult<()>;

    async fn get_session(&self, session_id: &str) -> StoreResult<Option<PortalSession>>;

    /// 某 (organization, payer) 下的全部会话，按创建时间倒序
    async fn find_sessions(
        &self,
        organization_id: &str,
        payer_id: &str,
    ) -> StoreResult<Vec<PortalSession>>;

    async fn sessions_with_status(&self, status: SessionStatus) -> StoreResult<Vec<PortalSession>>;

    /// 版本号匹配时写入非锁字段并递增版本；不匹配返回 VersionConflict
    async fn update_session(&self, session: &mut PortalSession) -> StoreResult<()>;

    // ----- 会话锁（CAS 原语） -----

    /// 仅当无锁或锁已过期时写入新锁
    async fn try_acquire_lock(&self, lock: &SessionLock, now_ms: i64) -> StoreResult<bool>;

    /// 仅当令牌匹配且锁未过期时延长到期时间
    async fn renew_lock(
        &self,
        session_id: &str,
        token: &str,
        expires_at: i64,
        now_ms: i64,
    ) -> StoreResult<bool>;

    /// 仅当令牌匹配时清除锁字段
    async fn release_lock(&self, session_id: &str, token: &str) -> StoreResult<bool>;

    /// 清除所有已过期的锁（不论持有者）
    async fn clear_expired_locks(&self, now_ms: i64) -> StoreResult<usize>;

    // ----- OTP 尝试 -----

    async fn insert_otp_attempt(&self, attempt: &OtpAttempt) -> StoreResult<()>;

    async fn get_otp_attempt(&self, attempt_id: &str) -> StoreResult<Option<OtpAttempt>>;

    async fn update_otp_attempt(&self, attempt: &OtpAttempt) -> StoreResult<()>;

    /// 按创建时间倒序
    async fn list_otp_attempts(&self, filter: &OtpFilter) -> StoreResult<Vec<OtpAttempt>>;

    // ----- 工作流执行记录 -----

    async fn insert_run(&self, run: &WorkflowRun) -> StoreResult<()>;

    async fn get_run(&self, run_id: &str) -> StoreResult<Option<WorkflowRun>>;

    async fn update_run(&self, run: &WorkflowRun) -> StoreResult<()>;

    /// 某个事前授权的全部执行记录，按创建时间倒序
    async fn runs_for_reference(&self, reference_id: &str) -> StoreResult<Vec<WorkflowRun>>;

    // ----- 人工介入工单 -----

    async fn insert_ticket(&self, ticket: &InterventionTicket) -> StoreResult<()>;

    async fn get_ticket(&self, ticket_id: &str) -> StoreResult<Option<InterventionTicket>>;

    async fn update_ticket(&self, ticket: &InterventionTicket) -> StoreResult<()>;

    async fn list_tickets(&self, filter: &TicketFilter) -> StoreResult<Vec<InterventionTicket>>;

    // ----- 失败任务 -----

    async fn insert_failed_job(&self, job: &FailedJobRecord) -> StoreResult<()>;

    async fn get_failed_job(&self, job_id: &str) -> StoreResult<Option<FailedJobRecord>>;

    async fn update_failed_job(&self, job: &FailedJobRecord) -> StoreResult<()>;

    async fn delete_failed_job(&self, job_id: &str) -> StoreResult<bool>;

    /// 状态为 from 时原子地改为 to；已被他人改过返回 false
    async fn claim_failed_job(
        &self,
        job_id: &str,
        from: FailedJobStatus,
        to: FailedJobStatus,
        now_ms: i64,
    ) -> StoreResult<bool>;

    /// 状态为 scheduled 且 next_retry_at <= now 的任务，按到期时间升序
    async fn due_failed_jobs(&self, now_ms: i64) -> StoreResult<Vec<FailedJobRecord>>;
}

/// 创建记录存储
///
/// backend 为 "sqlite" 且提供了路径时使用 SQLite；打开失败或其它取值回退为内存存储
pub fn create_record_store(backend: &str, db_path: Option<&Path>) -> Arc<dyn RecordStore> {
    if backend == "sqlite" {
        match db_path {
            Some(path) => match SqliteStore::open(path) {
                Ok(store) => {
                    tracing::info!("Using SQLite record store: {:?}", path);
                    return Arc::new(store);
                }
                Err(e) => {
                    tracing::warn!("Failed to open SQLite store, falling back to memory: {}", e);
                }
            },
            None => {
                tracing::warn!("SQLite store requested without a path, using memory store");
            }
        }
    }

    tracing::info!("Using in-memory record store");
    Arc::new(MemoryStore::new())
}
