//! OTP 协调器
//!
//! 把异步到达的短信验证码交给正在同步等待的登录流程。入站路径和等待路径可能在不同进程，
//! 两边只通过 RecordStore 中的 OtpAttempt 交接：入站写 otp_received，等待方轮询状态。

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::crypto::{hash_prefix, hash_value, SecretBox};
use super::extract::{extract_code, normalize_phone};
use crate::config::OtpSection;
use crate::core::{Clock, PortalError, PortalResult};
use crate::store::{OtpAttempt, OtpFilter, OtpStatus, RecordStore};

/// 入站短信（由短信网关 webhook 交付）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundSms {
    pub from_number: String,
    /// 接收号码，即门户配置的 otp_phone
    pub to_number: String,
    pub body: String,
    pub message_id: String,
}

#[derive(Debug, Clone)]
pub struct OtpSettings {
    pub code_expiration: Duration,
    pub max_attempts: u32,
    pub window: Duration,
    pub cooldown: Duration,
    pub poll_interval: Duration,
}

impl From<&OtpSection> for OtpSettings {
    fn from(section: &OtpSection) -> Self {
        Self {
            code_expiration: Duration::from_secs(section.code_expiration_secs),
            max_attempts: section.max_attempts,
            window: Duration::from_secs(section.window_secs),
            cooldown: Duration::from_secs(section.cooldown_secs),
            poll_interval: Duration::from_millis(section.poll_interval_ms),
        }
    }
}

pub struct OtpCoordinator {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    secrets: SecretBox,
    settings: OtpSettings,
}

impl OtpCoordinator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        secrets: SecretBox,
        settings: OtpSettings,
    ) -> Self {
        Self {
            store,
            clock,
            secrets,
            settings,
        }
    }

    pub fn settings(&self) -> &OtpSettings {
        &self.settings
    }

    async fn load(&self, attempt_id: &str) -> PortalResult<OtpAttempt> {
        self.store
            .get_otp_attempt(attempt_id)
            .await?
            .ok_or_else(|| PortalError::OtpNotFound(attempt_id.to_string()))
    }

    /// 开始一次捕获；冷却期内或窗口内次数用尽时拒绝
    pub async fn start_capture(
        &self,
        phone: &str,
        purpose: &str,
        session_id: Option<&str>,
    ) -> PortalResult<String> {
        let phone_hash = hash_value(&normalize_phone(phone));
        let now = self.clock.now_ms();

        let recent = self
            .store
            .list_otp_attempts(&OtpFilter {
                phone_hash: Some(phone_hash.clone()),
                created_after: Some(now - self.settings.window.as_millis() as i64),
                ..Default::default()
            })
            .await?;

        let cooldown_ms = self.settings.cooldown.as_millis() as i64;
        if let Some(latest) = recent.first() {
            let elapsed = now - latest.created_at;
            if elapsed < cooldown_ms {
                let remaining_ms = cooldown_ms - elapsed;
                return Err(PortalError::OtpCooldown {
                    remaining_secs: ((remaining_ms + 999) / 1000) as u64,
                });
            }
        }
        if recent.len() as u32 >= self.settings.max_attempts {
            return Err(PortalError::OtpAttemptsExhausted {
                max: self.settings.max_attempts,
            });
        }

        // 同一 (phone, purpose) 只保留一个等待中的尝试
        let waiting = self
            .store
            .list_otp_attempts(&OtpFilter {
                phone_hash: Some(phone_hash.clone()),
                purpose: Some(purpose.to_string()),
                status: Some(OtpStatus::WaitingForOtp),
                ..Default::default()
            })
            .await?;
        for mut old in waiting {
            old.status = OtpStatus::Expired;
            old.verification_result = Some("superseded".to_string());
            old.completed_at = Some(now);
            self.store.update_otp_attempt(&old).await?;
        }

        let attempt = OtpAttempt {
            id: format!("otp_{}", uuid::Uuid::new_v4()),
            phone_hash,
            purpose: purpose.to_string(),
            session_id: session_id.map(str::to_string),
            attempt_number: recent.len() as u32 + 1,
            status: OtpStatus::WaitingForOtp,
            created_at: now,
            expires_at: now + self.settings.code_expiration.as_millis() as i64,
            received_at: None,
            completed_at: None,
            message_id: None,
            message_hash: None,
            sender_hash: None,
            encrypted_code: None,
            entered_by: None,
            verification_result: None,
        };
        self.store.insert_otp_attempt(&attempt).await?;

        tracing::info!(
            attempt_id = %attempt.id,
            phone = %hash_prefix(&normalize_phone(phone)),
            purpose = %purpose,
            attempt_number = attempt.attempt_number,
            "otp capture started"
        );
        Ok(attempt.id)
    }

    /// 入站短信：匹配该号码最近一个未过期的等待尝试
    pub async fn on_inbound_message(&self, sms: &InboundSms) -> PortalResult<Option<String>> {
        let Some(code) = extract_code(&sms.body) else {
            tracing::debug!(message_id = %sms.message_id, "inbound sms carries no code");
            return Ok(None);
        };

        let phone_hash = hash_value(&normalize_phone(&sms.to_number));
        let now = self.clock.now_ms();
        let waiting = self
            .store
            .list_otp_attempts(&OtpFilter {
                phone_hash: Some(phone_hash),
                status: Some(OtpStatus::WaitingForOtp),
                ..Default::default()
            })
            .await?;

        let Some(mut attempt) = waiting.into_iter().find(|a| !a.is_expired(now)) else {
            tracing::info!(message_id = %sms.message_id, "no waiting otp attempt for inbound sms");
            return Ok(None);
        };

        attempt.status = OtpStatus::OtpReceived;
        attempt.received_at = Some(now);
        attempt.message_id = Some(sms.message_id.clone());
        attempt.message_hash = Some(hash_value(&sms.body));
        attempt.sender_hash = Some(hash_value(&normalize_phone(&sms.from_number)));
        attempt.encrypted_code = Some(self.secrets.encrypt(&code)?);
        self.store.update_otp_attempt(&attempt).await?;

        tracing::info!(attempt_id = %attempt.id, "otp received");
        Ok(Some(attempt.id))
    }

    /// 轮询直到收到验证码、尝试过期或超时
    pub async fn await_code(&self, attempt_id: &str, timeout: Duration) -> PortalResult<String> {
        self.poll_code(attempt_id, timeout, false).await
    }

    /// 人工录入等待：尝试已过期也继续等，直到 record_manual_entry 写入
    pub async fn await_manual_entry(&self, attempt_id: &str, timeout: Duration) -> PortalResult<String> {
        self.poll_code(attempt_id, timeout, true).await
    }

    async fn poll_code(
        &self,
        attempt_id: &str,
        timeout: Duration,
        allow_expired: bool,
    ) -> PortalResult<String> {
        let started = tokio::time::Instant::now();
        loop {
            let mut attempt = self.load(attempt_id).await?;
            match attempt.status {
                OtpStatus::OtpReceived => return self.take_code(attempt_id).await,
                OtpStatus::Failed => return Err(PortalError::OtpInvalid(attempt_id.to_string())),
                OtpStatus::Expired if !allow_expired => {
                    return Err(PortalError::OtpExpired(attempt_id.to_string()))
                }
                OtpStatus::WaitingForOtp
                    if !allow_expired && attempt.is_expired(self.clock.now_ms()) =>
                {
                    attempt.status = OtpStatus::Expired;
                    attempt.verification_result = Some("expired".to_string());
                    self.store.update_otp_attempt(&attempt).await?;
                    return Err(PortalError::OtpExpired(attempt_id.to_string()));
                }
                OtpStatus::OtpRetrieved | OtpStatus::Verified => {
                    return Err(PortalError::InvalidTransition {
                        entity: format!("otp attempt {}", attempt_id),
                        from: attempt.status.as_str().to_string(),
                        to: OtpStatus::OtpRetrieved.as_str().to_string(),
                    })
                }
                _ => {}
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(PortalError::OtpTimeout(attempt_id.to_string()));
            }
            tokio::time::sleep(self.settings.poll_interval.min(timeout - elapsed)).await;
        }
    }

    /// 临时解密验证码并标记 otp_retrieved
    pub async fn take_code(&self, attempt_id: &str) -> PortalResult<String> {
        let mut attempt = self.load(attempt_id).await?;
        let sealed = match (&attempt.status, &attempt.encrypted_code) {
            (OtpStatus::OtpReceived, Some(sealed)) => sealed.clone(),
            _ => {
                return Err(PortalError::InvalidTransition {
                    entity: format!("otp attempt {}", attempt_id),
                    from: attempt.status.as_str().to_string(),
                    to: OtpStatus::OtpRetrieved.as_str().to_string(),
                })
            }
        };
        let code = self.secrets.decrypt(&sealed)?;
        attempt.status = OtpStatus::OtpRetrieved;
        self.store.update_otp_attempt(&attempt).await?;
        Ok(code)
    }

    /// 人工录入验证码；等待中或已过期的尝试都接受，并重新计算有效期
    pub async fn record_manual_entry(
        &self,
        attempt_id: &str,
        code: &str,
        entered_by: &str,
    ) -> PortalResult<()> {
        let code = code.trim();
        if code.len() < 4 || code.len() > 8 || !code.chars().all(|c| c.is_ascii_digit()) {
            return Err(PortalError::Validation("code must be 4-8 digits".to_string()));
        }
        let mut attempt = self.load(attempt_id).await?;
        if !matches!(attempt.status, OtpStatus::WaitingForOtp | OtpStatus::Expired) {
            return Err(PortalError::InvalidTransition {
                entity: format!("otp attempt {}", attempt_id),
                from: attempt.status.as_str().to_string(),
                to: OtpStatus::OtpReceived.as_str().to_string(),
            });
        }
        let now = self.clock.now_ms();
        attempt.status = OtpStatus::OtpReceived;
        attempt.received_at = Some(now);
        attempt.expires_at = now + self.settings.code_expiration.as_millis() as i64;
        attempt.encrypted_code = Some(self.secrets.encrypt(code)?);
        attempt.entered_by = Some(entered_by.to_string());
        attempt.verification_result = None;
        self.store.update_otp_attempt(&attempt).await?;
        tracing::info!(attempt_id = %attempt_id, entered_by = %entered_by, "otp entered manually");
        Ok(())
    }

    /// 校验验证码：一致则 verified，否则 failed/invalid_code
    pub async fn verify(&self, attempt_id: &str, code: &str) -> PortalResult<bool> {
        let mut attempt = self.load(attempt_id).await?;
        let now = self.clock.now_ms();
        if attempt.is_expired(now) && attempt.status != OtpStatus::OtpRetrieved {
            attempt.status = OtpStatus::Expired;
            attempt.verification_result = Some("expired".to_string());
            self.store.update_otp_attempt(&attempt).await?;
            return Err(PortalError::OtpExpired(attempt_id.to_string()));
        }
        let stored = match &attempt.encrypted_code {
            Some(sealed) => self.secrets.decrypt(sealed)?,
            None => String::new(),
        };
        let ok = !stored.is_empty() && stored == code.trim();
        attempt.status = if ok { OtpStatus::Verified } else { OtpStatus::Failed };
        attempt.verification_result = Some(if ok { "success" } else { "invalid_code" }.to_string());
        attempt.completed_at = Some(now);
        self.store.update_otp_attempt(&attempt).await?;
        Ok(ok)
    }

    /// 门户拒绝了已输入的验证码
    pub async fn reject(&self, attempt_id: &str, reason: &str) -> PortalResult<()> {
        let mut attempt = self.load(attempt_id).await?;
        attempt.status = OtpStatus::Failed;
        attempt.verification_result = Some(reason.to_string());
        attempt.completed_at = Some(self.clock.now_ms());
        self.store.update_otp_attempt(&attempt).await?;
        Ok(())
    }

    /// 把过期的等待尝试标记为 expired
    pub async fn expire_stale(&self) -> PortalResult<usize> {
        let now = self.clock.now_ms();
        let waiting = self
            .store
            .list_otp_attempts(&OtpFilter {
                status: Some(OtpStatus::WaitingForOtp),
                ..Default::default()
            })
            .await?;
        let mut expired = 0;
        for mut attempt in waiting.into_iter().filter(|a| a.is_expired(now)) {
            attempt.status = OtpStatus::Expired;
            attempt.verification_result = Some("expired".to_string());
            self.store.update_otp_attempt(&attempt).await?;
            expired += 1;
        }
        if expired > 0 {
            tracing::info!(expired, "expired stale otp attempts");
        }
        Ok(expired)
    }
}
