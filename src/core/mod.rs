//! 核心层：错误与失败分类、重试与熔断、时间源、周期任务、优雅关闭

pub mod clock;
pub mod error;
pub mod retry;
pub mod shutdown;
pub mod ticker;

pub use clock::{bounded, Clock, ManualClock, SystemClock};
pub use error::{ClassifiedError, ErrorCategory, PortalError, PortalResult, Severity};
pub use retry::{
    intervention_instructions, next_steps, EscalationReason, FailureContext, FailureDisposition,
    RetryController, RetryDecision, RetryPolicy,
};
pub use shutdown::{HeldLockCleanup, ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason};
pub use ticker::spawn_periodic;
