//! 门户自动化错误类型与失败分类
//!
//! 与 RetryController 配合：PortalError 先被归类为 ClassifiedError（code / category / severity / retryable），
//! 再由重试控制器决定退避重试还是升级为人工介入。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::browser::BrowserError;
use crate::store::StoreError;

/// 编排核心中可能出现的错误（锁竞争、认证、OTP、浏览器、持久化等）
#[derive(Error, Debug)]
pub enum PortalError {
    #[error("Lock acquisition timed out for session {session_id} after {waited_ms}ms")]
    LockTimeout { session_id: String, waited_ms: u64 },

    #[error("Lock not held: {0}")]
    LockNotHeld(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// 验证码、限流横幅、真人验证等反自动化信号
    #[error("Bot detection triggered (confidence {confidence:.2}): {}", signals.join(", "))]
    BotDetected { confidence: f64, signals: Vec<String> },

    #[error("SMS cooldown active, retry in {remaining_secs}s")]
    OtpCooldown { remaining_secs: u64 },

    #[error("Maximum SMS attempts ({max}) reached within window")]
    OtpAttemptsExhausted { max: u32 },

    #[error("Timeout waiting for SMS code: {0}")]
    OtpTimeout(String),

    #[error("SMS code expired: {0}")]
    OtpExpired(String),

    #[error("OTP attempt not found: {0}")]
    OtpNotFound(String),

    #[error("Invalid SMS code for attempt {0}")]
    OtpInvalid(String),

    #[error("Invalid state transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        entity: String,
        from: String,
        to: String,
    },

    #[error("Intervention not found: {0}")]
    InterventionNotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Step failed: {0}")]
    StepFailed(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error(transparent)]
    Browser(#[from] BrowserError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type PortalResult<T> = Result<T, PortalError>;

/// 失败类别：决定是否可重试以及升级路径
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// 凭据错误、会话过期
    Authentication,
    /// 选择器缺失、等待元素超时（门户改版）
    PortalChange,
    /// 连接重置、请求超时
    Network,
    /// 表单校验等提交异常
    FormFilling,
    /// 验证码 / 限流 / 真人验证：永不重试
    BotDetection,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::PortalChange => "portal_change",
            Self::Network => "network",
            Self::FormFilling => "form_filling",
            Self::BotDetection => "bot_detection",
        }
    }

    /// 类别默认是否可重试
    pub fn default_retryable(&self) -> bool {
        matches!(
            self,
            Self::Authentication | Self::PortalChange | Self::Network
        )
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 严重度，用于决定介入工单优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low = 0,
    Medium = 1,
    High = 2,
    Critical = 3,
}

/// 归类后的失败：RetryController 只对这个结构做模式匹配
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub code: String,
    pub category: ErrorCategory,
    pub message: String,
    pub retryable: bool,
    pub severity: Severity,
}

impl ClassifiedError {
    pub fn new(code: &str, category: ErrorCategory, message: impl Into<String>) -> Self {
        let severity = match category {
            ErrorCategory::BotDetection => Severity::Critical,
            ErrorCategory::Authentication | ErrorCategory::FormFilling => Severity::High,
            ErrorCategory::PortalChange | ErrorCategory::Network => Severity::Medium,
        };
        Self {
            code: code.to_string(),
            category,
            message: message.into(),
            retryable: category.default_retryable(),
            severity,
        }
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable && self.category != ErrorCategory::BotDetection;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

impl std::fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}/{}] {}", self.code, self.category, self.message)
    }
}
