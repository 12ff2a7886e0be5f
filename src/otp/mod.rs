//! 短信 OTP：捕获、入站匹配、等待交接、人工录入与落盘加密

pub mod coordinator;
pub mod crypto;
pub mod extract;

pub use coordinator::{InboundSms, OtpCoordinator, OtpSettings};
pub use crypto::{hash_prefix, hash_value, SecretBox};
pub use extract::{extract_code, normalize_phone};
