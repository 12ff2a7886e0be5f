//! 门户会话：锁、生命周期、凭据
//!
//! - **lock**: 基于存储 CAS 的跨 worker 会话锁
//! - **lifecycle**: 登录 / 短信验证 / 复用 / 过期 / 清理
//! - **credentials**: credential_ref → 用户名密码

pub mod credentials;
pub mod lifecycle;
pub mod lock;

pub use credentials::{CredentialProvider, EnvCredentialProvider, PortalCredentials, StaticCredentialProvider};
pub use lifecycle::{LifecycleSettings, PortalSessionLifecycle, SessionLease, SessionRequest, OTP_PURPOSE};
pub use lock::{LockGuard, SessionLockManager};
