//! 优雅关闭
//!
//! worker 退出分两步：先取消 token，让保活、锁续期、工单超时扫描等周期任务停下；
//! 再按注册顺序执行清理，其中最重要的是释放本进程仍持有的会话锁，
//! 这样其它 worker 不必等到锁 TTL 过期才能接手同一个门户会话。

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::session::SessionLockManager;

const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

/// 退出原因；只记录第一次触发的那个
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    Interrupt,
    /// SIGTERM，通常来自进程管理器的滚动发布
    Terminate,
    /// 启动或运行期间无法恢复的错误
    Fatal(String),
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interrupt => f.write_str("interrupt"),
            Self::Terminate => f.write_str("terminate"),
            Self::Fatal(msg) => write!(f, "fatal: {}", msg),
        }
    }
}

/// 关闭信号：一个取消 token 加上首次触发的原因
#[derive(Debug, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: OnceLock<ShutdownReason>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 子 token 交给周期任务；取消父 token 会同时取消所有子 token
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// 触发关闭；重复触发只保留第一次的原因
    pub fn shutdown(&self, reason: ShutdownReason) {
        if self.reason.set(reason.clone()).is_ok() {
            tracing::info!(reason = %reason, "shutdown requested");
        }
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<&ShutdownReason> {
        self.reason.get()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// 监听 Ctrl+C；unix 下同时监听 SIGTERM
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                manager.shutdown(ShutdownReason::Interrupt);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                match signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                        manager.shutdown(ShutdownReason::Terminate);
                    }
                    Err(e) => tracing::warn!("could not install SIGTERM handler: {}", e),
                }
            });
        }
    }
}

/// 退出前要做的一项清理
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 日志里显示的名称
    fn name(&self) -> &'static str;
}

/// 按注册顺序逐项清理；单项失败或超时只记日志，不影响后面的清理
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    tasks: Vec<Arc<dyn ShutdownCleanup>>,
    task_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            tasks: Vec::new(),
            task_timeout: DEFAULT_CLEANUP_TIMEOUT,
        }
    }

    /// 每项清理的超时
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.tasks.push(Arc::new(task));
    }

    /// 返回成功完成的清理项数量
    pub async fn run_cleanup(&self) -> usize {
        let reason = self
            .manager
            .reason()
            .map(ToString::to_string)
            .unwrap_or_else(|| "normal exit".to_string());
        tracing::info!(tasks = self.tasks.len(), reason = %reason, "running shutdown cleanup");

        let mut completed = 0;
        for task in &self.tasks {
            let name = task.name();
            match tokio::time::timeout(self.task_timeout, task.cleanup()).await {
                Ok(Ok(())) => {
                    completed += 1;
                    tracing::info!(task = name, "cleanup finished");
                }
                Ok(Err(e)) => tracing::warn!(task = name, "cleanup failed: {}", e),
                Err(_) => tracing::warn!(
                    task = name,
                    timeout_ms = self.task_timeout.as_millis() as u64,
                    "cleanup timed out"
                ),
            }
        }
        completed
    }
}

/// 释放本进程持有的全部会话锁
pub struct HeldLockCleanup {
    locks: SessionLockManager,
}

impl HeldLockCleanup {
    pub fn new(locks: SessionLockManager) -> Self {
        Self { locks }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for HeldLockCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let released = self.locks.release_all().await?;
        tracing::info!(released, holder = %self.locks.holder(), "released held session locks");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "session_locks"
    }
}
