//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `AUTHPILOT__*` 覆盖（双下划线表示嵌套，如 `AUTHPILOT__RETRY__MAX_RETRIES=5`）。
//! 重试 / 退避参数全部来自 [retry] 段，不在调用点写死。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::intervention::ChannelConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub lock: LockSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub otp: OtpSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub intervention: InterventionSection,
    #[serde(default)]
    pub portals: Vec<PortalProfile>,
}

impl AppConfig {
    /// 按 payer_id 查门户配置
    pub fn portal(&self, payer_id: &str) -> Option<&PortalProfile> {
        self.portals.iter().find(|p| p.payer_id == payer_id)
    }
}

/// [app] 段：worker 标识
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 锁持有者标识；未设置时用 worker-{pid}
    pub worker_id: Option<String>,
}

impl AppSection {
    pub fn worker_id(&self) -> String {
        self.worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", std::process::id()))
    }
}

/// [store] 段：memory / sqlite
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_store_backend")]
    pub backend: String,
    pub path: Option<PathBuf>,
}

fn default_store_backend() -> String {
    "memory".to_string()
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: None,
        }
    }
}

/// [lock] 段：会话锁 TTL、轮询间隔、获取超时、清扫与续期周期
#[derive(Debug, Clone, Deserialize)]
pub struct LockSection {
    #[serde(default = "default_lock_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_lock_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_lock_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    #[serde(default = "default_lock_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_lock_renew_interval_secs")]
    pub renew_interval_secs: u64,
}

fn default_lock_ttl_secs() -> u64 {
    300
}

fn default_lock_poll_interval_ms() -> u64 {
    250
}

fn default_lock_acquire_timeout_secs() -> u64 {
    30
}

fn default_lock_sweep_interval_secs() -> u64 {
    60
}

fn default_lock_renew_interval_secs() -> u64 {
    60
}

impl Default for LockSection {
    fn default() -> Self {
        Self {
            ttl_secs: default_lock_ttl_secs(),
            poll_interval_ms: default_lock_poll_interval_ms(),
            acquire_timeout_secs: default_lock_acquire_timeout_secs(),
            sweep_interval_secs: default_lock_sweep_interval_secs(),
            renew_interval_secs: default_lock_renew_interval_secs(),
        }
    }
}

impl LockSection {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

/// [session] 段：最长寿命、不活跃阈值、保活、认证超时、复用策略
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    /// 默认 8 小时
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
    /// 默认 30 分钟
    #[serde(default = "default_inactivity_secs")]
    pub inactivity_secs: u64,
    #[serde(default = "default_true")]
    pub keep_alive: bool,
    #[serde(default = "default_keep_alive_interval_secs")]
    pub keep_alive_interval_secs: u64,
    /// 一次登录（含锁等待、短信验证码与人工录入）的总上限
    #[serde(default = "default_auth_timeout_secs")]
    pub auth_timeout_secs: u64,
    /// 尝试复用已有会话时等锁的上限（毫秒）
    #[serde(default = "default_reuse_lock_timeout_ms")]
    pub reuse_lock_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub probe_on_reuse: bool,
    #[serde(default = "default_true")]
    pub cleanup_on_startup: bool,
    /// 登录后轮询成功 / OTP 标记的间隔
    #[serde(default = "default_marker_poll_ms")]
    pub marker_poll_ms: u64,
}

fn default_max_age_secs() -> u64 {
    8 * 3600
}

fn default_inactivity_secs() -> u64 {
    30 * 60
}

fn default_keep_alive_interval_secs() -> u64 {
    300
}

fn default_auth_timeout_secs() -> u64 {
    20 * 60
}

fn default_reuse_lock_timeout_ms() -> u64 {
    2000
}

fn default_marker_poll_ms() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            max_age_secs: default_max_age_secs(),
            inactivity_secs: default_inactivity_secs(),
            keep_alive: true,
            keep_alive_interval_secs: default_keep_alive_interval_secs(),
            auth_timeout_secs: default_auth_timeout_secs(),
            reuse_lock_timeout_ms: default_reuse_lock_timeout_ms(),
            probe_on_reuse: true,
            cleanup_on_startup: true,
            marker_poll_ms: default_marker_poll_ms(),
        }
    }
}

/// [otp] 段：验证码有效期、限流、轮询、静态加密密钥
#[derive(Debug, Clone, Deserialize)]
pub struct OtpSection {
    #[serde(default = "default_code_expiration_secs")]
    pub code_expiration_secs: u64,
    #[serde(default = "default_otp_max_attempts")]
    pub max_attempts: u32,
    /// 限流滚动窗口
    #[serde(default = "default_otp_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_otp_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_otp_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_otp_wait_timeout_secs")]
    pub wait_timeout_secs: u64,
    /// 自动等待超时后，开人工工单再等待的时长；0 表示不等待
    #[serde(default = "default_manual_entry_wait_secs")]
    pub manual_entry_wait_secs: u64,
    /// base64 编码的 32 字节 AES 密钥；未设置时进程内随机生成
    pub encryption_key: Option<String>,
    #[serde(default = "default_otp_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_code_expiration_secs() -> u64 {
    300
}

fn default_otp_max_attempts() -> u32 {
    3
}

fn default_otp_window_secs() -> u64 {
    3600
}

fn default_otp_cooldown_secs() -> u64 {
    60
}

fn default_otp_poll_interval_ms() -> u64 {
    2000
}

fn default_otp_wait_timeout_secs() -> u64 {
    300
}

fn default_manual_entry_wait_secs() -> u64 {
    600
}

fn default_otp_cleanup_interval_secs() -> u64 {
    300
}

impl Default for OtpSection {
    fn default() -> Self {
        Self {
            code_expiration_secs: default_code_expiration_secs(),
            max_attempts: default_otp_max_attempts(),
            window_secs: default_otp_window_secs(),
            cooldown_secs: default_otp_cooldown_secs(),
            poll_interval_ms: default_otp_poll_interval_ms(),
            wait_timeout_secs: default_otp_wait_timeout_secs(),
            manual_entry_wait_secs: default_manual_entry_wait_secs(),
            encryption_key: None,
            cleanup_interval_secs: default_otp_cleanup_interval_secs(),
        }
    }
}

/// [retry] 段：退避基数、上限、抖动比例、最大重试次数、熔断时长
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// 抖动上限（0.1 = 10%）
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 步骤内重试的基础间隔
    #[serde(default = "default_step_retry_delay_ms")]
    pub step_retry_delay_ms: u64,
    /// bot_detection 触发后该 payer 熔断时长
    #[serde(default = "default_circuit_open_secs")]
    pub circuit_open_secs: u64,
    #[serde(default = "default_process_interval_secs")]
    pub process_interval_secs: u64,
}

fn default_base_delay_ms() -> u64 {
    60_000
}

fn default_max_delay_ms() -> u64 {
    3_600_000
}

fn default_jitter_ratio() -> f64 {
    0.1
}

fn default_max_retries() -> u32 {
    3
}

fn default_step_retry_delay_ms() -> u64 {
    1000
}

fn default_circuit_open_secs() -> u64 {
    900
}

fn default_process_interval_secs() -> u64 {
    60
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ratio: default_jitter_ratio(),
            max_retries: default_max_retries(),
            step_retry_delay_ms: default_step_retry_delay_ms(),
            circuit_open_secs: default_circuit_open_secs(),
            process_interval_secs: default_process_interval_secs(),
        }
    }
}

/// [executor] 段：步骤默认超时、失败截图
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorSection {
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub screenshot_on_failure: bool,
    /// 每个 navigate / act 步骤后检查反自动化信号
    #[serde(default = "default_true")]
    pub bot_check: bool,
    /// 一次编排（登录 + 执行计划）的总上限，登录等待不会超过它
    #[serde(default = "default_orchestration_timeout_secs")]
    pub orchestration_timeout_secs: u64,
}

fn default_step_timeout_secs() -> u64 {
    30
}

fn default_orchestration_timeout_secs() -> u64 {
    30 * 60
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            default_step_timeout_secs: default_step_timeout_secs(),
            screenshot_on_failure: true,
            bot_check: true,
            orchestration_timeout_secs: default_orchestration_timeout_secs(),
        }
    }
}

/// [intervention] 段：超时、扫描周期、自动分派、团队与通知渠道
#[derive(Debug, Clone, Deserialize)]
pub struct InterventionSection {
    #[serde(default = "default_intervention_timeout_mins")]
    pub default_timeout_mins: u64,
    /// 按工单类型覆盖超时（键为 sms_code_needed / portal_error 等）
    #[serde(default = "default_timeout_overrides")]
    pub timeout_mins: HashMap<String, u64>,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_true")]
    pub auto_assign: bool,
    /// organization_id -> 可分派成员；"default" 为兜底
    #[serde(default)]
    pub team: HashMap<String, Vec<String>>,
    /// organization_id -> 通知渠道；"default" 为兜底
    #[serde(default)]
    pub channels: HashMap<String, Vec<ChannelConfig>>,
    /// 通知中的工单链接前缀
    pub dashboard_url: Option<String>,
}

fn default_intervention_timeout_mins() -> u64 {
    30
}

fn default_timeout_overrides() -> HashMap<String, u64> {
    HashMap::from([("portal_error".to_string(), 60)])
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for InterventionSection {
    fn default() -> Self {
        Self {
            default_timeout_mins: default_intervention_timeout_mins(),
            timeout_mins: default_timeout_overrides(),
            sweep_interval_secs: default_sweep_interval_secs(),
            auto_assign: true,
            team: HashMap::new(),
            channels: HashMap::new(),
            dashboard_url: None,
        }
    }
}

/// [[portals]] 段：一个支付方门户
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PortalProfile {
    pub payer_id: String,
    #[serde(default)]
    pub name: String,
    pub base_url: Option<String>,
    pub login_url: Option<String>,
    /// section -> URL，如 prior-auth / status
    #[serde(default)]
    pub urls: HashMap<String, String>,
    /// 门户下发 OTP 的接收号码
    pub otp_phone: Option<String>,
    #[serde(default = "default_true")]
    pub supports_submission: bool,
    #[serde(default = "default_true")]
    pub supports_status_check: bool,
    #[serde(default = "default_true")]
    pub supports_upload: bool,
}

impl PortalProfile {
    pub fn new(payer_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            payer_id: payer_id.into(),
            name: name.into(),
            supports_submission: true,
            supports_status_check: true,
            supports_upload: true,
            ..Default::default()
        }
    }

    pub fn with_url(mut self, section: &str, url: &str) -> Self {
        self.urls.insert(section.to_string(), url.to_string());
        self
    }

    pub fn with_login_url(mut self, url: &str) -> Self {
        self.login_url = Some(url.to_string());
        self
    }

    pub fn with_otp_phone(mut self, phone: &str) -> Self {
        self.otp_phone = Some(phone.to_string());
        self
    }

    /// 解析某个功能区的 URL：显式配置 > base_url/section > 通用兜底
    pub fn url(&self, section: &str) -> String {
        if let Some(url) = self.urls.get(section) {
            return url.clone();
        }
        match &self.base_url {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), section),
            None => format!("https://provider-portal.com/{}", section),
        }
    }

    pub fn login_url(&self) -> String {
        self.login_url.clone().unwrap_or_else(|| self.url("login"))
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.payer_id
        } else {
            &self.name
        }
    }
}

/// 从 config 目录加载配置，环境变量 AUTHPILOT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 AUTHPILOT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("AUTHPILOT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_portal_policy() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.session.max_age_secs, 28_800);
        assert_eq!(cfg.session.inactivity_secs, 1_800);
        assert_eq!(cfg.otp.code_expiration_secs, 300);
        assert_eq!(cfg.otp.max_attempts, 3);
        assert_eq!(cfg.otp.cooldown_secs, 60);
        assert_eq!(cfg.retry.base_delay_ms, 60_000);
        assert_eq!(cfg.retry.max_delay_ms, 3_600_000);
        assert_eq!(cfg.intervention.default_timeout_mins, 30);
        assert_eq!(cfg.intervention.timeout_mins.get("portal_error"), Some(&60));
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authpilot.toml");
        std::fs::write(
            &path,
            r#"
[retry]
base_delay_ms = 1000
max_retries = 5

[[portals]]
payer_id = "anthem"
name = "Anthem"
base_url = "https://provider.anthem.com/"
otp_phone = "+15550001111"

[intervention.channels]
default = [{ kind = "webhook", target = "https://hooks.example.com/pa" }]
"#,
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.retry.base_delay_ms, 1000);
        assert_eq!(cfg.retry.max_retries, 5);
        assert_eq!(cfg.retry.max_delay_ms, 3_600_000);
        let portal = cfg.portal("anthem").unwrap();
        assert_eq!(portal.url("status"), "https://provider.anthem.com/status");
        assert!(portal.supports_submission);
        assert_eq!(cfg.intervention.channels["default"].len(), 1);
    }

    #[test]
    fn test_portal_url_fallback() {
        let portal = PortalProfile::new("unknown", "");
        assert_eq!(portal.url("prior-auth"), "https://provider-portal.com/prior-auth");
        assert_eq!(portal.display_name(), "unknown");
        let portal = portal.with_url("status", "https://x.test/search");
        assert_eq!(portal.url("status"), "https://x.test/search");
    }
}
