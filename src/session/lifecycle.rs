//! 门户会话生命周期
//!
//! pending_login → sms_required → authenticated → {expired_max_age | expired_inactivity | failed | terminated}
//!
//! 复用或创建会话都必须先持有会话锁；认证在锁内进行，任何退出路径都会释放锁
//! （显式 release，或 LockGuard 被 drop 时补一次释放）。

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::browser::{BotDetector, BrowserFactory, BrowserSession, TypeOptions};
use crate::config::{AppConfig, PortalProfile};
use crate::core::{bounded, Clock, PortalError, PortalResult};
use crate::intervention::{InterventionRequest, InterventionService};
use crate::otp::OtpCoordinator;
use crate::store::{
    InterventionKind, PortalSession, Priority, RecordStore, SessionPolicy, SessionStatus,
};

use super::credentials::CredentialProvider;
use super::lock::{LockGuard, SessionLockManager};

pub const USERNAME_FIELDS: &[&str] = &["[name=\"username\"]", "[name=\"email\"]", "#username", "#email"];
pub const PASSWORD_FIELDS: &[&str] = &["[name=\"password\"]", "#password"];
pub const SUBMIT_BUTTONS: &[&str] = &[
    "[type=\"submit\"]",
    "button[type=\"submit\"]",
    ".login-button",
    "#login-button",
];
pub const OTP_FIELDS: &[&str] = &[
    "[name=\"code\"]",
    "[name=\"sms\"]",
    "[name=\"verification\"]",
    "#sms-code",
    "#verification-code",
    ".sms-verification",
    ".two-factor",
];
pub const OTP_SUBMIT_BUTTONS: &[&str] = &["#verify-button", ".verify-button", "[data-action=\"verify\"]"];
pub const SUCCESS_MARKERS: &[&str] = &[".dashboard", ".welcome", ".user-menu", ".logout", "[href*=\"logout\"]"];

const INVALID_CREDENTIAL_PHRASES: &[&str] = &[
    "invalid username",
    "invalid password",
    "incorrect username",
    "incorrect password",
    "invalid credentials",
    "login failed",
    "account locked",
];

pub const OTP_PURPOSE: &str = "portal_login";

/// 登录提交后页面的去向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoginOutcome {
    Authenticated,
    OtpChallenge,
}

/// 会话请求：定位 (organization, payer) 与凭据，附带门户配置
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub organization_id: String,
    pub payer_id: String,
    pub credential_ref: String,
    pub portal: PortalProfile,
    /// 调用方的截止时间；登录期间的所有等待都不会越过它
    pub deadline: Option<Instant>,
}

impl SessionRequest {
    pub fn new(
        organization_id: impl Into<String>,
        credential_ref: impl Into<String>,
        portal: PortalProfile,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            payer_id: portal.payer_id.clone(),
            credential_ref: credential_ref.into(),
            portal,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub policy: SessionPolicy,
    pub keep_alive_interval: Duration,
    pub auth_timeout: Duration,
    pub lock_ttl: Duration,
    pub lock_acquire_timeout: Duration,
    pub reuse_lock_timeout: Duration,
    pub probe_on_reuse: bool,
    pub marker_poll: Duration,
    pub otp_wait: Duration,
    pub manual_entry_wait: Duration,
}

impl LifecycleSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let session = &config.session;
        Self {
            policy: SessionPolicy {
                max_age_secs: session.max_age_secs,
                inactivity_secs: session.inactivity_secs,
                keep_alive: session.keep_alive,
            },
            keep_alive_interval: Duration::from_secs(session.keep_alive_interval_secs),
            auth_timeout: Duration::from_secs(session.auth_timeout_secs),
            lock_ttl: config.lock.ttl(),
            lock_acquire_timeout: config.lock.acquire_timeout(),
            reuse_lock_timeout: Duration::from_millis(session.reuse_lock_timeout_ms),
            probe_on_reuse: session.probe_on_reuse,
            marker_poll: Duration::from_millis(session.marker_poll_ms),
            otp_wait: Duration::from_secs(config.otp.wait_timeout_secs),
            manual_entry_wait: Duration::from_secs(config.otp.manual_entry_wait_secs),
        }
    }
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// 一次自动化运行所需的会话：记录 + 已登录的浏览器 + 锁
pub struct SessionLease {
    pub session: PortalSession,
    pub browser: Box<dyn BrowserSession>,
    pub guard: LockGuard,
    /// 复用了已有会话
    pub reused: bool,
}

impl SessionLease {
    pub fn session_id(&self) -> &str {
        &self.session.id
    }

    pub fn into_parts(self) -> (PortalSession, Box<dyn BrowserSession>, LockGuard) {
        (self.session, self.browser, self.guard)
    }
}

pub struct PortalSessionLifecycle {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    locks: SessionLockManager,
    otp: Arc<OtpCoordinator>,
    interventions: Arc<InterventionService>,
    browsers: Arc<dyn BrowserFactory>,
    credentials: Arc<dyn CredentialProvider>,
    detector: BotDetector,
    settings: LifecycleSettings,
}

impl PortalSessionLifecycle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        locks: SessionLockManager,
        otp: Arc<OtpCoordinator>,
        interventions: Arc<InterventionService>,
        browsers: Arc<dyn BrowserFactory>,
        credentials: Arc<dyn CredentialProvider>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            store,
            clock,
            locks,
            otp,
            interventions,
            browsers,
            credentials,
            detector: BotDetector::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    pub fn locks(&self) -> &SessionLockManager {
        &self.locks
    }

    async fn load(&self, session_id: &str) -> PortalResult<PortalSession> {
        self.store
            .get_session(session_id)
            .await?
            .ok_or_else(|| PortalError::SessionNotFound(session_id.to_string()))
    }

    async fn apply_transition(
        &self,
        session: &mut PortalSession,
        to: SessionStatus,
        note: &str,
    ) -> PortalResult<()> {
        let from = session.status;
        session.transition(to, note, self.clock.now_ms())?;
        if to.is_terminal() {
            session.cookies = None;
        }
        self.store.update_session(session).await?;
        tracing::info!(
            session_id = %session.id,
            from = %from,
            to = %to,
            note = %note,
            "session transition"
        );
        Ok(())
    }

    /// 先复用，无法复用再新建并登录。auth_timeout 与调用方截止时间取小，作为整个过程的截止时间
    pub async fn acquire(&self, request: &SessionRequest) -> PortalResult<SessionLease> {
        let deadline = Instant::now() + bounded(self.settings.auth_timeout, request.deadline);
        if let Some(lease) = self.try_reuse(request, deadline).await? {
            return Ok(lease);
        }
        self.create_and_authenticate(request, deadline).await
    }

    async fn try_reuse(
        &self,
        request: &SessionRequest,
        deadline: Instant,
    ) -> PortalResult<Option<SessionLease>> {
        let candidates: Vec<PortalSession> = self
            .store
            .find_sessions(&request.organization_id, &request.payer_id)
            .await?
            .into_iter()
            .filter(|s| s.status == SessionStatus::Authenticated && s.credential_ref == request.credential_ref)
            .collect();

        for candidate in candidates {
            let guard = match self
                .locks
                .acquire(
                    &candidate.id,
                    self.settings.lock_ttl,
                    bounded(self.settings.reuse_lock_timeout, Some(deadline)),
                )
                .await
            {
                Ok(guard) => guard,
                Err(PortalError::LockTimeout { .. }) => {
                    tracing::debug!(session_id = %candidate.id, "session busy, skipping reuse");
                    continue;
                }
                Err(e) => return Err(e),
            };

            // 锁内重新读取，候选记录可能已过时
            let mut session = self.load(&candidate.id).await?;
            if !self.validate(&mut session).await? {
                guard.release().await?;
                continue;
            }

            let mut browser = match self.browsers.open(&request.portal).await {
                Ok(b) => b,
                Err(e) => {
                    guard.release().await?;
                    return Err(e.into());
                }
            };
            if let Some(cookies) = session.cookies.clone() {
                if let Err(e) = browser.restore_cookies(&cookies).await {
                    tracing::warn!(session_id = %session.id, "cookie restore failed: {}", e);
                }
            }

            if self.settings.probe_on_reuse && !self.probe(browser.as_mut(), &request.portal).await {
                if let Err(e) = browser.close().await {
                    tracing::debug!(session_id = %session.id, "failed to close stale browser: {}", e);
                }
                let (to, note) = if session.exceeds_inactivity(self.clock.now_ms()) {
                    (SessionStatus::ExpiredInactivity, "refresh_failed")
                } else {
                    (SessionStatus::Terminated, "reuse_probe_failed")
                };
                self.apply_transition(&mut session, to, note).await?;
                guard.release().await?;
                continue;
            }

            session.touch(self.clock.now_ms());
            self.store.update_session(&mut session).await?;
            tracing::info!(session_id = %session.id, payer = %request.payer_id, "reusing portal session");
            return Ok(Some(SessionLease {
                session,
                browser,
                guard,
                reused: true,
            }));
        }
        Ok(None)
    }

    async fn create_and_authenticate(
        &self,
        request: &SessionRequest,
        deadline: Instant,
    ) -> PortalResult<SessionLease> {
        let mut session = PortalSession::new(
            request.organization_id.clone(),
            request.payer_id.clone(),
            request.portal.display_name(),
            request.credential_ref.clone(),
            self.settings.policy,
            self.clock.now_ms(),
        );
        self.store.insert_session(&session).await?;
        let guard = self
            .locks
            .acquire(
                &session.id,
                self.settings.lock_ttl,
                bounded(self.settings.lock_acquire_timeout, Some(deadline)),
            )
            .await?;
        tracing::info!(session_id = %session.id, payer = %request.payer_id, "created portal session");

        let mut browser = match self.browsers.open(&request.portal).await {
            Ok(b) => b,
            Err(e) => {
                self.fail_session(&mut session, &e.to_string()).await;
                guard.release().await?;
                return Err(e.into());
            }
        };

        match self
            .authenticate(&mut session, browser.as_mut(), &request.portal, deadline)
            .await
        {
            Ok(()) => Ok(SessionLease {
                session,
                browser,
                guard,
                reused: false,
            }),
            Err(e) => {
                tracing::warn!(session_id = %session.id, "authentication failed: {}", e);
                if let Err(e) = browser.close().await {
                    tracing::warn!(session_id = %session.id, "failed to close browser after login: {}", e);
                }
                self.fail_session(&mut session, &e.to_string()).await;
                guard.release().await?;
                Err(e)
            }
        }
    }

    async fn fail_session(&self, session: &mut PortalSession, reason: &str) {
        if session.status.is_terminal() {
            return;
        }
        if let Err(e) = self.apply_transition(session, SessionStatus::Failed, reason).await {
            tracing::warn!(session_id = %session.id, "could not mark session failed: {}", e);
        }
    }

    /// 登录：凭据表单 → （可选）短信验证码 → 成功标记；成功后保存 cookie。
    /// 各阶段共用同一个截止时间
    pub async fn authenticate(
        &self,
        session: &mut PortalSession,
        browser: &mut dyn BrowserSession,
        portal: &PortalProfile,
        deadline: Instant,
    ) -> PortalResult<()> {
        let credentials = self.credentials.resolve(&session.credential_ref).await?;

        browser.navigate(&portal.login_url()).await?;
        self.ensure_not_bot(browser).await?;

        let username = browser
            .first_present(USERNAME_FIELDS)
            .await?
            .ok_or_else(|| PortalError::AuthenticationFailed("username field not found".to_string()))?;
        let password = browser
            .first_present(PASSWORD_FIELDS)
            .await?
            .ok_or_else(|| PortalError::AuthenticationFailed("password field not found".to_string()))?;
        browser
            .type_text(&username, &credentials.username, TypeOptions::human())
            .await?;
        browser
            .type_text(&password, &credentials.password, TypeOptions::human())
            .await?;
        let submit = browser
            .first_present(SUBMIT_BUTTONS)
            .await?
            .ok_or_else(|| PortalError::AuthenticationFailed("login button not found".to_string()))?;
        browser.click(&submit).await?;

        if self.await_login_outcome(browser, true, deadline).await? == LoginOutcome::OtpChallenge {
            self.apply_transition(session, SessionStatus::SmsRequired, "sms verification requested")
                .await?;
            self.complete_otp_challenge(session, browser, portal, deadline)
                .await?;
        }

        session.cookies = match browser.cookies().await {
            Ok(c) if !c.is_empty() => Some(c),
            _ => None,
        };
        self.apply_transition(session, SessionStatus::Authenticated, "login succeeded")
            .await?;
        Ok(())
    }

    async fn complete_otp_challenge(
        &self,
        session: &mut PortalSession,
        browser: &mut dyn BrowserSession,
        portal: &PortalProfile,
        deadline: Instant,
    ) -> PortalResult<()> {
        let phone = portal.otp_phone.as_deref().ok_or_else(|| {
            PortalError::AuthenticationFailed(format!(
                "{} requires an sms code but no otp phone is configured",
                portal.display_name()
            ))
        })?;
        let attempt_id = self
            .otp
            .start_capture(phone, OTP_PURPOSE, Some(session.id.as_str()))
            .await?;

        let otp_wait = bounded(self.settings.otp_wait, Some(deadline));
        let code = match self.otp.await_code(&attempt_id, otp_wait).await {
            Ok(code) => code,
            Err(PortalError::OtpTimeout(_)) | Err(PortalError::OtpExpired(_)) => {
                self.request_manual_code(session, portal, &attempt_id).await?;
                let manual_wait = bounded(self.settings.manual_entry_wait, Some(deadline));
                self.otp.await_manual_entry(&attempt_id, manual_wait).await?
            }
            Err(e) => return Err(e),
        };

        let field = browser
            .first_present(OTP_FIELDS)
            .await?
            .ok_or_else(|| PortalError::AuthenticationFailed("sms code field disappeared".to_string()))?;
        browser.type_text(&field, &code, TypeOptions::human()).await?;
        let submit = match browser.first_present(OTP_SUBMIT_BUTTONS).await? {
            Some(s) => Some(s),
            None => browser.first_present(SUBMIT_BUTTONS).await?,
        };
        let submit = submit
            .ok_or_else(|| PortalError::AuthenticationFailed("verify button not found".to_string()))?;
        browser.click(&submit).await?;

        match self.await_login_outcome(browser, false, deadline).await {
            Ok(_) => {
                self.otp.verify(&attempt_id, &code).await?;
                Ok(())
            }
            Err(e) => {
                self.otp.reject(&attempt_id, "portal_rejected").await?;
                match e {
                    PortalError::AuthenticationFailed(_) => Err(PortalError::OtpInvalid(attempt_id)),
                    other => Err(other),
                }
            }
        }
    }

    async fn request_manual_code(
        &self,
        session: &PortalSession,
        portal: &PortalProfile,
        attempt_id: &str,
    ) -> PortalResult<()> {
        let request = InterventionRequest::new(
            InterventionKind::SmsCodeNeeded,
            session.organization_id.clone(),
            format!("SMS code needed for {}", portal.display_name()),
            "The portal sent a verification code that was not received automatically.",
        )
        .with_priority(Priority::High)
        .with_session(Some(session.id.clone()))
        .with_instructions(vec![
            "Check the portal phone for the verification code".to_string(),
            "Enter the code against this ticket".to_string(),
        ])
        .with_context(serde_json::json!({
            "otp_attempt_id": attempt_id,
            "session_id": session.id,
            "payer_id": session.payer_id,
        }))
        .with_timeout(self.settings.manual_entry_wait);
        let ticket = self.interventions.create(request).await?;
        tracing::info!(
            session_id = %session.id,
            attempt_id = %attempt_id,
            ticket_id = %ticket.id,
            "waiting for manual sms code entry"
        );
        Ok(())
    }

    /// 轮询登录结果直到截止时间；allow_otp 为假时再次出现验证码输入框视为失败
    async fn await_login_outcome(
        &self,
        browser: &mut dyn BrowserSession,
        allow_otp: bool,
        deadline: Instant,
    ) -> PortalResult<LoginOutcome> {
        loop {
            self.ensure_not_bot(browser).await?;
            if browser.first_present(SUCCESS_MARKERS).await?.is_some() {
                return Ok(LoginOutcome::Authenticated);
            }
            if allow_otp && browser.first_present(OTP_FIELDS).await?.is_some() {
                return Ok(LoginOutcome::OtpChallenge);
            }
            let text = browser.page_text().await?.to_lowercase();
            if let Some(phrase) = INVALID_CREDENTIAL_PHRASES.iter().find(|p| text.contains(*p)) {
                return Err(PortalError::InvalidCredentials(phrase.to_string()));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(PortalError::AuthenticationFailed(
                    "timed out waiting for login result".to_string(),
                ));
            }
            tokio::time::sleep(self.settings.marker_poll.min(remaining)).await;
        }
    }

    async fn ensure_not_bot(&self, browser: &mut dyn BrowserSession) -> PortalResult<()> {
        let signal = self.detector.check(browser).await?;
        if signal.should_escalate {
            return Err(PortalError::BotDetected {
                confidence: signal.confidence,
                signals: signal.signals,
            });
        }
        Ok(())
    }

    /// 存活探测：带 cookie 打开登录页，已登录门户会直接显示成功标记
    async fn probe(&self, browser: &mut dyn BrowserSession, portal: &PortalProfile) -> bool {
        if let Err(e) = browser.navigate(&portal.login_url()).await {
            tracing::debug!("session probe navigation failed: {}", e);
            return false;
        }
        match self.detector.check(browser).await {
            Ok(signal) if signal.should_escalate => return false,
            Err(_) => return false,
            _ => {}
        }
        matches!(browser.first_present(SUCCESS_MARKERS).await, Ok(Some(_)))
    }

    /// 年龄与不活跃检查（调用方需持有锁）；过期时迁移并持久化
    pub async fn validate(&self, session: &mut PortalSession) -> PortalResult<bool> {
        if session.status != SessionStatus::Authenticated {
            return Ok(false);
        }
        let now = self.clock.now_ms();
        if session.exceeds_max_age(now) {
            self.apply_transition(session, SessionStatus::ExpiredMaxAge, "max_age_exceeded")
                .await?;
            return Ok(false);
        }
        if session.exceeds_inactivity(now) && !session.policy.keep_alive {
            self.apply_transition(session, SessionStatus::ExpiredInactivity, "inactivity_timeout")
                .await?;
            return Ok(false);
        }
        Ok(true)
    }

    /// 运行结束：记录活动时间并释放锁
    pub async fn finish(&self, mut session: PortalSession, guard: LockGuard) -> PortalResult<()> {
        if !session.status.is_terminal() {
            session.touch(self.clock.now_ms());
            if let Err(e) = self.store.update_session(&mut session).await {
                tracing::warn!(session_id = %session.id, "could not record session activity: {}", e);
            }
        }
        guard.release().await?;
        Ok(())
    }

    /// 显式关闭；已是终态时返回 false
    pub async fn terminate(&self, session_id: &str, reason: &str) -> PortalResult<bool> {
        let guard = self
            .locks
            .acquire(session_id, self.settings.lock_ttl, self.settings.lock_acquire_timeout)
            .await?;
        let result = self.terminate_locked(session_id, reason).await;
        guard.release().await?;
        result
    }

    async fn terminate_locked(&self, session_id: &str, reason: &str) -> PortalResult<bool> {
        let mut session = self.load(session_id).await?;
        if session.status.is_terminal() {
            return Ok(false);
        }
        self.apply_transition(&mut session, SessionStatus::Terminated, reason)
            .await?;
        Ok(true)
    }

    /// 启动清理：未完成登录的会话与超龄 / 长期不活跃的会话一律终止；被他人持锁的跳过
    pub async fn cleanup_stale_sessions(&self) -> PortalResult<usize> {
        let now = self.clock.now_ms();
        let mut stale = Vec::new();
        for status in [SessionStatus::PendingLogin, SessionStatus::SmsRequired] {
            stale.extend(self.store.sessions_with_status(status).await?);
        }
        stale.extend(
            self.store
                .sessions_with_status(SessionStatus::Authenticated)
                .await?
                .into_iter()
                .filter(|s| s.exceeds_max_age(now) || s.exceeds_inactivity(now)),
        );

        let mut cleaned = 0;
        for candidate in stale {
            let Some(lock) = self.locks.try_acquire(&candidate.id, self.settings.lock_ttl).await? else {
                continue;
            };
            let result = self.terminate_locked(&candidate.id, "cleanup_expired").await;
            self.locks.release(&lock).await?;
            if result? {
                cleaned += 1;
            }
        }
        if cleaned > 0 {
            tracing::info!(cleaned, "terminated stale portal sessions");
        }
        Ok(cleaned)
    }

    /// 保活：对空闲超过保活周期的已认证会话做一次探测；失败则 expired_inactivity
    pub async fn refresh_idle_sessions(&self, portals: &[PortalProfile]) -> PortalResult<usize> {
        let now = self.clock.now_ms();
        let idle_ms = self.settings.keep_alive_interval.as_millis() as i64;
        let candidates: Vec<PortalSession> = self
            .store
            .sessions_with_status(SessionStatus::Authenticated)
            .await?
            .into_iter()
            .filter(|s| s.idle_ms(now) >= idle_ms)
            .collect();

        let mut refreshed = 0;
        for candidate in candidates {
            let Some(lock) = self.locks.try_acquire(&candidate.id, self.settings.lock_ttl).await? else {
                continue;
            };
            let portal = portals
                .iter()
                .find(|p| p.payer_id == candidate.payer_id)
                .cloned()
                .unwrap_or_else(|| PortalProfile::new(candidate.payer_id.clone(), candidate.portal_name.clone()));
            let result = self.refresh_one(&candidate.id, &portal).await;
            self.locks.release(&lock).await?;
            match result {
                Ok(true) => refreshed += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(session_id = %candidate.id, "session refresh failed: {}", e),
            }
        }
        Ok(refreshed)
    }

    async fn refresh_one(&self, session_id: &str, portal: &PortalProfile) -> PortalResult<bool> {
        let mut session = self.load(session_id).await?;
        if session.status != SessionStatus::Authenticated {
            return Ok(false);
        }
        let now = self.clock.now_ms();
        if session.exceeds_max_age(now) {
            self.apply_transition(&mut session, SessionStatus::ExpiredMaxAge, "max_age_exceeded")
                .await?;
            return Ok(false);
        }
        if !session.policy.keep_alive {
            if session.exceeds_inactivity(now) {
                self.apply_transition(&mut session, SessionStatus::ExpiredInactivity, "inactivity_timeout")
                    .await?;
            }
            return Ok(false);
        }

        let alive = match self.browsers.open(portal).await {
            Ok(mut browser) => {
                if let Some(cookies) = session.cookies.clone() {
                    if let Err(e) = browser.restore_cookies(&cookies).await {
                        tracing::debug!(session_id = %session_id, "keep-alive cookie restore failed: {}", e);
                    }
                }
                let alive = self.probe(browser.as_mut(), portal).await;
                if alive {
                    if let Ok(c) = browser.cookies().await {
                        if !c.is_empty() {
                            session.cookies = Some(c);
                        }
                    }
                }
                if let Err(e) = browser.close().await {
                    tracing::debug!(session_id = %session_id, "failed to close keep-alive browser: {}", e);
                }
                alive
            }
            Err(e) => {
                tracing::debug!(session_id = %session_id, "keep-alive browser unavailable: {}", e);
                false
            }
        };

        if alive {
            session.touch(self.clock.now_ms());
            self.store.update_session(&mut session).await?;
            tracing::debug!(session_id = %session_id, "session kept alive");
            Ok(true)
        } else {
            self.apply_transition(&mut session, SessionStatus::ExpiredInactivity, "refresh_failed")
                .await?;
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{BrowserError, Reaction, ScriptedBrowser, ScriptedBrowserFactory};
    use crate::config::{InterventionSection, OtpSection};
    use crate::core::ManualClock;
    use crate::intervention::{InterventionSettings, LogNotifier, RoundRobinAssigner};
    use crate::otp::{InboundSms, OtpSettings, SecretBox};
    use crate::session::StaticCredentialProvider;
    use crate::store::{MemoryStore, OtpFilter, OtpStatus, TicketFilter};
    use std::collections::HashMap;

    const OTP_PHONE: &str = "+15551234567";

    struct Harness {
        store: Arc<dyn RecordStore>,
        clock: Arc<ManualClock>,
        otp: Arc<OtpCoordinator>,
        factory: Arc<ScriptedBrowserFactory>,
        lifecycle: Arc<PortalSessionLifecycle>,
    }

    fn portal() -> PortalProfile {
        PortalProfile::new("anthem", "Anthem")
            .with_login_url("https://anthem.test/login")
            .with_otp_phone(OTP_PHONE)
    }

    fn login_page() -> ScriptedBrowser {
        ScriptedBrowser::new()
            .with_present("[name=\"username\"]")
            .with_present("[name=\"password\"]")
            .with_present("[type=\"submit\"]")
    }

    fn harness(browser: ScriptedBrowser) -> Harness {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let mut otp_settings = OtpSettings::from(&OtpSection::default());
        otp_settings.poll_interval = Duration::from_millis(10);
        let otp = Arc::new(OtpCoordinator::new(
            store.clone(),
            clock.clone(),
            SecretBox::random(),
            otp_settings,
        ));
        let interventions = Arc::new(InterventionService::new(
            store.clone(),
            clock.clone(),
            Arc::new(LogNotifier),
            Arc::new(RoundRobinAssigner::new(HashMap::new())),
            InterventionSettings::from(&InterventionSection::default()),
        ));
        let locks = SessionLockManager::new(
            store.clone(),
            clock.clone(),
            "worker-test",
            Duration::from_secs(300),
            Duration::from_millis(10),
        );
        let factory = Arc::new(ScriptedBrowserFactory::new(browser));
        let mut settings = LifecycleSettings::default();
        settings.marker_poll = Duration::from_millis(5);
        settings.auth_timeout = Duration::from_secs(3);
        settings.otp_wait = Duration::from_secs(1);
        settings.manual_entry_wait = Duration::from_secs(1);
        settings.reuse_lock_timeout = Duration::from_millis(50);
        let lifecycle = Arc::new(PortalSessionLifecycle::new(
            store.clone(),
            clock.clone(),
            locks,
            otp.clone(),
            interventions,
            factory.clone(),
            Arc::new(StaticCredentialProvider::new().with("main", "clinic", "s3cret")),
            settings,
        ));
        Harness {
            store,
            clock,
            otp,
            factory,
            lifecycle,
        }
    }

    fn request() -> SessionRequest {
        SessionRequest::new("org", "main", portal())
    }

    async fn deliver_when_waiting(otp: Arc<OtpCoordinator>, store: Arc<dyn RecordStore>, body: &str) {
        for _ in 0..200 {
            let waiting = store
                .list_otp_attempts(&OtpFilter {
                    status: Some(OtpStatus::WaitingForOtp),
                    ..Default::default()
                })
                .await
                .unwrap();
            if !waiting.is_empty() {
                let sms = InboundSms {
                    from_number: "+18005550000".to_string(),
                    to_number: OTP_PHONE.to_string(),
                    body: body.to_string(),
                    message_id: "SM1".to_string(),
                };
                otp.on_inbound_message(&sms).await.unwrap();
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no otp attempt started");
    }

    #[tokio::test]
    async fn test_direct_login_saves_cookies_and_reuses() {
        let browser = login_page().on_click("[type=\"submit\"]", vec![Reaction::Show(".dashboard".into())]);
        browser.set_cookies("sid=abc");
        let h = harness(browser);

        let lease = h.lifecycle.acquire(&request()).await.unwrap();
        assert!(!lease.reused);
        assert_eq!(lease.session.status, SessionStatus::Authenticated);
        assert_eq!(lease.session.cookies.as_deref(), Some("sid=abc"));
        assert_eq!(h.factory.browser().field_value("[name=\"password\"]").as_deref(), Some("s3cret"));
        let first_id = lease.session.id.clone();
        let (session, mut browser, guard) = lease.into_parts();
        browser.close().await.unwrap();
        h.lifecycle.finish(session, guard).await.unwrap();

        h.clock.advance_secs(60);
        let lease = h.lifecycle.acquire(&request()).await.unwrap();
        assert!(lease.reused);
        assert_eq!(lease.session.id, first_id);
        assert!(h.factory.browser().actions().contains(&"restore_cookies".to_string()));
    }

    #[tokio::test]
    async fn test_sms_challenge_completes_with_inbound_code() {
        let browser = login_page()
            .with_present("#verify-button")
            .on_click("[type=\"submit\"]", vec![Reaction::Show("#sms-code".into())])
            .on_click(
                "#verify-button",
                vec![Reaction::Hide("#sms-code".into()), Reaction::Show(".dashboard".into())],
            );
        let h = harness(browser);

        let deliver = tokio::spawn(deliver_when_waiting(
            h.otp.clone(),
            h.store.clone(),
            "Your verification code is: 482913",
        ));
        let lease = h.lifecycle.acquire(&request()).await.unwrap();
        deliver.await.unwrap();

        assert_eq!(h.factory.browser().field_value("#sms-code").as_deref(), Some("482913"));
        let statuses: Vec<_> = lease.session.transcript.iter().map(|e| e.status).collect();
        assert_eq!(
            statuses,
            vec![
                SessionStatus::PendingLogin,
                SessionStatus::SmsRequired,
                SessionStatus::Authenticated
            ]
        );
        let attempts = h.store.list_otp_attempts(&OtpFilter::default()).await.unwrap();
        assert_eq!(attempts[0].status, OtpStatus::Verified);
    }

    #[tokio::test]
    async fn test_invalid_credentials_fail_session_and_release_lock() {
        let browser = login_page().on_click(
            "[type=\"submit\"]",
            vec![Reaction::SetPageText("Invalid username or password".into())],
        );
        let h = harness(browser);

        let err = h.lifecycle.acquire(&request()).await.err().unwrap();
        assert!(matches!(err, PortalError::InvalidCredentials(_)));

        let sessions = h.store.find_sessions("org", "anthem").await.unwrap();
        assert_eq!(sessions[0].status, SessionStatus::Failed);
        assert!(h.lifecycle.locks().held_locks().await.is_empty());
        assert!(h.factory.browser().is_closed());
    }

    #[tokio::test]
    async fn test_close_error_after_failed_login_keeps_login_error() {
        let browser = login_page()
            .on_click(
                "[type=\"submit\"]",
                vec![Reaction::SetPageText("Invalid username or password".into())],
            )
            .fail_times("close", 1, BrowserError::Connection("socket closed".into()));
        let h = harness(browser);

        let err = h.lifecycle.acquire(&request()).await.err().unwrap();
        assert!(matches!(err, PortalError::InvalidCredentials(_)));
        assert_eq!(h.factory.browser().close_count(), 1);
        assert!(h.lifecycle.locks().held_locks().await.is_empty());
        let sessions = h.store.find_sessions("org", "anthem").await.unwrap();
        assert_eq!(sessions[0].status, SessionStatus::Failed);
    }

    #[tokio::test]
    async fn test_captcha_on_login_page_is_bot_detection() {
        let browser = login_page().with_present(".captcha");
        let h = harness(browser);
        let err = h.lifecycle.acquire(&request()).await.err().unwrap();
        assert!(matches!(err, PortalError::BotDetected { .. }));
    }

    #[tokio::test]
    async fn test_otp_timeout_opens_sms_ticket() {
        let browser = login_page().on_click("[type=\"submit\"]", vec![Reaction::Show("#sms-code".into())]);
        let h = harness(browser);

        let err = h.lifecycle.acquire(&request()).await.err().unwrap();
        assert!(matches!(err, PortalError::OtpTimeout(_)));
        let tickets = h.store.list_tickets(&TicketFilter::default()).await.unwrap();
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].kind, InterventionKind::SmsCodeNeeded);
        assert!(tickets[0].context["otp_attempt_id"].as_str().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_wait_stops_at_caller_deadline() {
        let h = harness(login_page());
        let started = Instant::now();
        let request = request().with_deadline(started + Duration::from_millis(100));

        let err = h.lifecycle.acquire(&request).await.err().unwrap();
        assert!(matches!(err, PortalError::AuthenticationFailed(_)));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(200), "waited {:?}", elapsed);
        assert!(h.lifecycle.locks().held_locks().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_otp_waits_share_the_login_deadline() {
        let browser = login_page().on_click("[type=\"submit\"]", vec![Reaction::Show("#sms-code".into())]);
        let h = harness(browser);
        let started = Instant::now();
        let request = request().with_deadline(started + Duration::from_millis(300));

        let err = h.lifecycle.acquire(&request).await.err().unwrap();
        assert!(matches!(err, PortalError::OtpTimeout(_)));
        // 自动等待与人工录入各 1 秒，合计不得越过 300ms 的截止时间
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(400), "waited {:?}", elapsed);
        let tickets = h.store.list_tickets(&TicketFilter::default()).await.unwrap();
        assert_eq!(tickets[0].kind, InterventionKind::SmsCodeNeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_otp_waits_fit_inside_auth_timeout() {
        let browser = login_page().on_click("[type=\"submit\"]", vec![Reaction::Show("#sms-code".into())]);
        let h = harness(browser);
        let started = Instant::now();

        let err = h.lifecycle.acquire(&request()).await.err().unwrap();
        assert!(matches!(err, PortalError::OtpTimeout(_)));
        // otp_wait + manual_entry_wait 合计 2 秒，仍在 3 秒的登录上限内
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_secs(3), "waited {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_max_age_session_not_reused() {
        let browser = login_page().on_click("[type=\"submit\"]", vec![Reaction::Show(".dashboard".into())]);
        let h = harness(browser);
        let lease = h.lifecycle.acquire(&request()).await.unwrap();
        let old_id = lease.session.id.clone();
        let (session, _browser, guard) = lease.into_parts();
        h.lifecycle.finish(session, guard).await.unwrap();

        h.clock.advance_secs(9 * 3600);
        let lease = h.lifecycle.acquire(&request()).await.unwrap();
        assert_ne!(lease.session.id, old_id);
        let old = h.store.get_session(&old_id).await.unwrap().unwrap();
        assert_eq!(old.status, SessionStatus::ExpiredMaxAge);
    }

    #[tokio::test]
    async fn test_cleanup_and_terminate() {
        let h = harness(login_page());
        let pending = PortalSession::new("org", "anthem", "Anthem", "main", SessionPolicy::default(), 0);
        h.store.insert_session(&pending).await.unwrap();

        assert_eq!(h.lifecycle.cleanup_stale_sessions().await.unwrap(), 1);
        let s = h.store.get_session(&pending.id).await.unwrap().unwrap();
        assert_eq!(s.status, SessionStatus::Terminated);
        assert_eq!(s.termination_reason.as_deref(), Some("cleanup_expired"));

        assert!(!h.lifecycle.terminate(&pending.id, "closed").await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_refresh_expires_idle_session() {
        let h = harness(login_page());
        let mut session = PortalSession::new("org", "anthem", "Anthem", "main", SessionPolicy::default(), 1_000_000);
        session.transition(SessionStatus::Authenticated, "login", 1_000_000).unwrap();
        h.store.insert_session(&session).await.unwrap();

        h.clock.advance_secs(600);
        assert_eq!(h.lifecycle.refresh_idle_sessions(&[portal()]).await.unwrap(), 0);
        let s = h.store.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(s.status, SessionStatus::ExpiredInactivity);
        assert_eq!(s.termination_reason.as_deref(), Some("refresh_failed"));
    }
}
