//! 持久化记录类型
//!
//! 门户会话（含锁字段）、OTP 尝试、工作流执行记录、人工介入工单、失败任务记录。
//! 时间统一为毫秒时间戳（i64），与 Clock 对齐。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::automation::StepLog;
use crate::core::{ErrorCategory, PortalError, PortalResult, Severity};
use crate::orchestrator::ConfirmationNumber;

/// 抽取步骤累积的数据
pub type ExtractedData = BTreeMap<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// PortalSession
// ---------------------------------------------------------------------------

/// 门户会话认证状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    PendingLogin,
    SmsRequired,
    Authenticated,
    ExpiredMaxAge,
    ExpiredInactivity,
    Failed,
    Terminated,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingLogin => "pending_login",
            Self::SmsRequired => "sms_required",
            Self::Authenticated => "authenticated",
            Self::ExpiredMaxAge => "expired_max_age",
            Self::ExpiredInactivity => "expired_inactivity",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending_login" => Self::PendingLogin,
            "sms_required" => Self::SmsRequired,
            "authenticated" => Self::Authenticated,
            "expired_max_age" => Self::ExpiredMaxAge,
            "expired_inactivity" => Self::ExpiredInactivity,
            "failed" => Self::Failed,
            "terminated" => Self::Terminated,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ExpiredMaxAge | Self::ExpiredInactivity | Self::Failed | Self::Terminated
        )
    }

    /// 合法迁移表；任意非终态都可以进入 failed / terminated
    pub fn can_transition_to(&self, to: SessionStatus) -> bool {
        use SessionStatus::*;
        if self.is_terminal() {
            return false;
        }
        match (self, to) {
            (_, Failed) | (_, Terminated) => true,
            (PendingLogin, Authenticated) | (PendingLogin, SmsRequired) => true,
            (SmsRequired, Authenticated) => true,
            (Authenticated, ExpiredInactivity) | (Authenticated, ExpiredMaxAge) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 会话锁：仅当不存在或已过期时才能被他人替换
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionLock {
    pub session_id: String,
    pub token: String,
    pub holder: String,
    pub expires_at: i64,
}

impl SessionLock {
    /// 过期的锁在逻辑上视为不存在
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at <= now_ms
    }
}

/// 会话保活 / 过期策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPolicy {
    pub max_age_secs: u64,
    pub inactivity_secs: u64,
    pub keep_alive: bool,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            max_age_secs: 8 * 3600,
            inactivity_secs: 30 * 60,
            keep_alive: true,
        }
    }
}

/// 会话流水（每次状态迁移追加一条）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub at: i64,
    pub status: SessionStatus,
    pub note: String,
}

/// 一个 (organization, payer) 对应的门户登录会话
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalSession {
    pub id: String,
    pub organization_id: String,
    pub payer_id: String,
    pub portal_name: String,
    pub credential_ref: String,
    pub status: SessionStatus,
    /// 锁字段只能通过 RecordStore 的 CAS 原语修改
    pub lock: Option<SessionLock>,
    pub policy: SessionPolicy,
    pub created_at: i64,
    pub authenticated_at: Option<i64>,
    pub last_activity_at: i64,
    pub cookies: Option<String>,
    pub transcript: Vec<SessionEvent>,
    pub termination_reason: Option<String>,
    /// 非锁字段的乐观并发版本号
    pub version: i64,
}

impl PortalSession {
    pub fn new(
        organization_id: impl Into<String>,
        payer_id: impl Into<String>,
        portal_name: impl Into<String>,
        credential_ref: impl Into<String>,
        policy: SessionPolicy,
        now_ms: i64,
    ) -> Self {
        Self {
            id: format!("ps_{}", uuid::Uuid::new_v4()),
            organization_id: organization_id.into(),
            payer_id: payer_id.into(),
            portal_name: portal_name.into(),
            credential_ref: credential_ref.into(),
            status: SessionStatus::PendingLogin,
            lock: None,
            policy,
            created_at: now_ms,
            authenticated_at: None,
            last_activity_at: now_ms,
            cookies: None,
            transcript: vec![SessionEvent {
                at: now_ms,
                status: SessionStatus::PendingLogin,
                note: "session created".to_string(),
            }],
            termination_reason: None,
            version: 0,
        }
    }

    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.created_at
    }

    pub fn idle_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.last_activity_at
    }

    pub fn exceeds_max_age(&self, now_ms: i64) -> bool {
        self.age_ms(now_ms) > (self.policy.max_age_secs as i64) * 1000
    }

    pub fn exceeds_inactivity(&self, now_ms: i64) -> bool {
        self.idle_ms(now_ms) > (self.policy.inactivity_secs as i64) * 1000
    }

    pub fn touch(&mut self, now_ms: i64) {
        self.last_activity_at = now_ms;
    }

    /// 校验并执行状态迁移，同时记入流水
    pub fn transition(
        &mut self,
        to: SessionStatus,
        note: impl Into<String>,
        now_ms: i64,
    ) -> PortalResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(PortalError::InvalidTransition {
                entity: format!("session {}", self.id),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        let note = note.into();
        match to {
            SessionStatus::Authenticated => {
                self.authenticated_at = Some(now_ms);
                self.last_activity_at = now_ms;
            }
            s if s.is_terminal() => {
                self.termination_reason = Some(note.clone());
            }
            _ => {}
        }
        self.status = to;
        self.transcript.push(SessionEvent {
            at: now_ms,
            status: to,
            note,
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// OtpAttempt
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtpStatus {
    WaitingForOtp,
    OtpReceived,
    OtpRetrieved,
    Verified,
    Failed,
    Expired,
}

impl OtpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WaitingForOtp => "waiting_for_otp",
            Self::OtpReceived => "otp_received",
            Self::OtpRetrieved => "otp_retrieved",
            Self::Verified => "verified",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "waiting_for_otp" => Self::WaitingForOtp,
            "otp_received" => Self::OtpReceived,
            "otp_retrieved" => Self::OtpRetrieved,
            "verified" => Self::Verified,
            "failed" => Self::Failed,
            "expired" => Self::Expired,
            _ => return None,
        })
    }
}

/// 一次 OTP 捕获周期；手机号、短信正文只存哈希，验证码只存密文
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtpAttempt {
    pub id: String,
    pub phone_hash: String,
    pub purpose: String,
    pub session_id: Option<String>,
    pub attempt_number: u32,
    pub status: OtpStatus,
    pub created_at: i64,
    pub expires_at: i64,
    pub received_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub message_id: Option<String>,
    pub message_hash: Option<String>,
    pub sender_hash: Option<String>,
    pub encrypted_code: Option<String>,
    /// 人工录入时的录入人
    pub entered_by: Option<String>,
    pub verification_result: Option<String>,
}

impl OtpAttempt {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at <= now_ms
    }
}

/// OTP 尝试查询条件
#[derive(Debug, Clone, Default)]
pub struct OtpFilter {
    pub phone_hash: Option<String>,
    pub purpose: Option<String>,
    pub status: Option<OtpStatus>,
    pub created_after: Option<i64>,
}

impl OtpFilter {
    pub fn matches(&self, attempt: &OtpAttempt) -> bool {
        self.phone_hash.as_ref().map_or(true, |p| *p == attempt.phone_hash)
            && self.purpose.as_ref().map_or(true, |p| *p == attempt.purpose)
            && self.status.map_or(true, |s| s == attempt.status)
            && self.created_after.map_or(true, |t| attempt.created_at >= t)
    }
}

// ---------------------------------------------------------------------------
// WorkflowRun
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Submission,
    StatusCheck,
    DocumentUpload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    WaitingHuman,
    Cancelled,
}

impl RunStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub at: i64,
    pub step: Option<String>,
    pub code: String,
    pub category: ErrorCategory,
    pub message: String,
}

/// 一次编排尝试的执行记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: String,
    pub kind: RunKind,
    pub organization_id: String,
    pub payer_id: String,
    /// 关联的事前授权 ID
    pub reference_id: String,
    pub session_id: Option<String>,
    pub status: RunStatus,
    pub steps: Vec<StepLog>,
    pub current_step: Option<String>,
    pub extracted: ExtractedData,
    pub errors: Vec<RunError>,
    pub intervention_id: Option<String>,
    pub failed_job_id: Option<String>,
    /// 由哪次执行重跑而来
    #[serde(default)]
    pub retry_of: Option<String>,
    /// 接手重跑的执行
    #[serde(default)]
    pub retried_by: Option<String>,
    pub confirmation: Option<ConfirmationNumber>,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
}

impl WorkflowRun {
    pub fn new(
        kind: RunKind,
        organization_id: impl Into<String>,
        payer_id: impl Into<String>,
        reference_id: impl Into<String>,
        now_ms: i64,
    ) -> Self {
        Self {
            id: format!("run_{}", uuid::Uuid::new_v4()),
            kind,
            organization_id: organization_id.into(),
            payer_id: payer_id.into(),
            reference_id: reference_id.into(),
            session_id: None,
            status: RunStatus::Pending,
            steps: Vec::new(),
            current_step: None,
            extracted: ExtractedData::new(),
            errors: Vec::new(),
            intervention_id: None,
            failed_job_id: None,
            retry_of: None,
            retried_by: None,
            confirmation: None,
            created_at: now_ms,
            updated_at: now_ms,
            completed_at: None,
        }
    }

    pub fn set_status(&mut self, status: RunStatus, now_ms: i64) {
        self.status = status;
        self.updated_at = now_ms;
        if status.is_finished() {
            self.completed_at = Some(now_ms);
        }
    }
}

// ---------------------------------------------------------------------------
// InterventionTicket
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionKind {
    SmsCodeNeeded,
    CaptchaSolve,
    PortalError,
    UnexpectedUi,
    ManualReview,
    FormValidationError,
}

impl InterventionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SmsCodeNeeded => "sms_code_needed",
            Self::CaptchaSolve => "captcha_solve",
            Self::PortalError => "portal_error",
            Self::UnexpectedUi => "unexpected_ui",
            Self::ManualReview => "manual_review",
            Self::FormValidationError => "form_validation_error",
        }
    }

    /// 由失败类别推断工单类型
    pub fn for_category(category: ErrorCategory) -> Self {
        match category {
            ErrorCategory::BotDetection => Self::CaptchaSolve,
            ErrorCategory::PortalChange => Self::UnexpectedUi,
            ErrorCategory::FormFilling => Self::FormValidationError,
            ErrorCategory::Authentication | ErrorCategory::Network => Self::PortalError,
        }
    }
}

impl std::fmt::Display for InterventionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low = 0,
    Medium = 1,
    High = 2,
    Urgent = 3,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

impl From<Severity> for Priority {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Critical => Self::Urgent,
            Severity::High => Self::High,
            Severity::Medium => Self::Medium,
            Severity::Low => Self::Low,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Medium
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Pending,
    Assigned,
    InProgress,
    Resolved,
    Escalated,
    Cancelled,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::InProgress => "in_progress",
            Self::Resolved => "resolved",
            Self::Escalated => "escalated",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "assigned" => Self::Assigned,
            "in_progress" => Self::InProgress,
            "resolved" => Self::Resolved,
            "escalated" => Self::Escalated,
            "cancelled" => Self::Cancelled,
            _ => return None,
        })
    }

    /// 仍需人工处理（超时扫描对象）
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Assigned | Self::InProgress)
    }
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 解决方式；决定关联工作流的最终状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionType {
    CompletedManually,
    ProvidedCode,
    FixedError,
    EscalatedToManual,
    Cancelled,
}

impl ResolutionType {
    pub fn run_status(&self) -> RunStatus {
        match self {
            Self::CompletedManually => RunStatus::Completed,
            Self::EscalatedToManual => RunStatus::Failed,
            Self::Cancelled => RunStatus::Cancelled,
            // 原执行到此结束，重跑另起一条执行并通过 retry_of 关联
            Self::ProvidedCode | Self::FixedError => RunStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub resolution_type: ResolutionType,
    pub resolved_by: String,
    pub notes: Option<String>,
    /// 附带数据（如人工提供的验证码、确认号）
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Resolution {
    pub fn new(resolution_type: ResolutionType, resolved_by: impl Into<String>) -> Self {
        Self {
            resolution_type,
            resolved_by: resolved_by.into(),
            notes: None,
            data: serde_json::Value::Null,
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// 人工介入工单
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterventionTicket {
    pub id: String,
    pub kind: InterventionKind,
    pub category: Option<ErrorCategory>,
    pub priority: Priority,
    pub status: TicketStatus,
    pub organization_id: String,
    pub workflow_run_id: Option<String>,
    pub session_id: Option<String>,
    pub title: String,
    pub description: String,
    pub instructions: Vec<String>,
    pub context: serde_json::Value,
    pub assigned_to: Option<String>,
    pub timeout_at: i64,
    pub created_at: i64,
    pub assigned_at: Option<i64>,
    pub started_at: Option<i64>,
    pub resolved_at: Option<i64>,
    pub escalated_at: Option<i64>,
    pub escalation_reason: Option<String>,
    pub resolution: Option<Resolution>,
    pub notified_channels: Vec<String>,
}

impl InterventionTicket {
    pub fn is_overdue(&self, now_ms: i64) -> bool {
        self.status.is_open() && self.timeout_at <= now_ms
    }
}

/// 工单查询条件
#[derive(Debug, Clone, Default)]
pub struct TicketFilter {
    pub organization_id: Option<String>,
    pub assigned_to: Option<String>,
    pub statuses: Vec<TicketStatus>,
    pub workflow_run_id: Option<String>,
}

impl TicketFilter {
    pub fn open() -> Self {
        Self {
            statuses: vec![
                TicketStatus::Pending,
                TicketStatus::Assigned,
                TicketStatus::InProgress,
            ],
            ..Default::default()
        }
    }

    pub fn matches(&self, ticket: &InterventionTicket) -> bool {
        self.organization_id
            .as_ref()
            .map_or(true, |o| *o == ticket.organization_id)
            && self
                .assigned_to
                .as_ref()
                .map_or(true, |a| ticket.assigned_to.as_ref() == Some(a))
            && (self.statuses.is_empty() || self.statuses.contains(&ticket.status))
            && self
                .workflow_run_id
                .as_ref()
                .map_or(true, |r| ticket.workflow_run_id.as_ref() == Some(r))
    }
}

// ---------------------------------------------------------------------------
// FailedJobRecord
// ---------------------------------------------------------------------------

pub const PORTAL_JOB_TYPE: &str = "portal_automation_workflow";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedJobStatus {
    /// 等待 next_retry_at 到期
    Scheduled,
    /// 已被某个 worker 取走重跑
    Retrying,
    /// 终态：已升级人工
    Escalated,
}

impl FailedJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Retrying => "retrying",
            Self::Escalated => "escalated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "scheduled" => Self::Scheduled,
            "retrying" => Self::Retrying,
            "escalated" => Self::Escalated,
            _ => return None,
        })
    }
}

/// 失败任务的重试调度记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedJobRecord {
    pub id: String,
    pub job_type: String,
    pub workflow_run_id: Option<String>,
    pub organization_id: String,
    pub payer_id: String,
    /// 请求快照，用于重跑
    pub payload: serde_json::Value,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<i64>,
    pub status: FailedJobStatus,
    pub failure_reason: String,
    pub last_error: String,
    pub intervention_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl FailedJobRecord {
    pub fn new(
        organization_id: impl Into<String>,
        payer_id: impl Into<String>,
        payload: serde_json::Value,
        max_retries: u32,
        now_ms: i64,
    ) -> Self {
        Self {
            id: format!("job_{}", uuid::Uuid::new_v4()),
            job_type: PORTAL_JOB_TYPE.to_string(),
            workflow_run_id: None,
            organization_id: organization_id.into(),
            payer_id: payer_id.into(),
            payload,
            retry_count: 0,
            max_retries,
            next_retry_at: None,
            status: FailedJobStatus::Scheduled,
            failure_reason: String::new(),
            last_error: String::new(),
            intervention_id: None,
            created_at: now_ms,
            updated_at: now_ms,
        }
    }

    pub fn is_due(&self, now_ms: i64) -> bool {
        self.status == FailedJobStatus::Scheduled
            && self.next_retry_at.map_or(false, |t| t <= now_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_transition_table() {
        use SessionStatus::*;
        assert!(PendingLogin.can_transition_to(SmsRequired));
        assert!(PendingLogin.can_transition_to(Authenticated));
        assert!(SmsRequired.can_transition_to(Authenticated));
        assert!(SmsRequired.can_transition_to(Failed));
        assert!(Authenticated.can_transition_to(ExpiredMaxAge));
        assert!(!Authenticated.can_transition_to(SmsRequired));
        assert!(!PendingLogin.can_transition_to(ExpiredInactivity));
        assert!(!Terminated.can_transition_to(Authenticated));
        assert!(!Failed.can_transition_to(Terminated));
    }

    #[test]
    fn test_session_transition_records_transcript() {
        let mut session = PortalSession::new("org", "anthem", "Anthem", "main", SessionPolicy::default(), 0);
        session.transition(SessionStatus::SmsRequired, "otp challenge", 10).unwrap();
        session.transition(SessionStatus::Authenticated, "otp accepted", 20).unwrap();
        assert_eq!(session.authenticated_at, Some(20));
        assert_eq!(session.transcript.len(), 3);

        let err = session.transition(SessionStatus::PendingLogin, "bad", 30).unwrap_err();
        assert!(matches!(err, PortalError::InvalidTransition { .. }));
    }

    #[test]
    fn test_session_age_and_inactivity() {
        let policy = SessionPolicy {
            max_age_secs: 100,
            inactivity_secs: 10,
            keep_alive: true,
        };
        let mut session = PortalSession::new("org", "p", "P", "c", policy, 0);
        assert!(!session.exceeds_max_age(100_000));
        assert!(session.exceeds_max_age(100_001));
        assert!(session.exceeds_inactivity(10_001));
        session.touch(10_000);
        assert!(!session.exceeds_inactivity(10_001));
    }

    #[test]
    fn test_resolution_maps_run_status() {
        assert_eq!(ResolutionType::CompletedManually.run_status(), RunStatus::Completed);
        assert_eq!(ResolutionType::EscalatedToManual.run_status(), RunStatus::Failed);
        assert_eq!(ResolutionType::Cancelled.run_status(), RunStatus::Cancelled);
        assert_eq!(ResolutionType::ProvidedCode.run_status(), RunStatus::Failed);
        assert_eq!(ResolutionType::FixedError.run_status(), RunStatus::Failed);
        assert!(ResolutionType::FixedError.run_status().is_finished());
    }

    #[test]
    fn test_priority_from_severity() {
        assert_eq!(Priority::from(Severity::Critical), Priority::Urgent);
        assert_eq!(Priority::from(Severity::Low), Priority::Low);
        assert!(Priority::Urgent > Priority::High);
    }
}
