//! 运行时装配：由 AppConfig 构建存储、锁、OTP、人工介入、会话生命周期、执行器、重试与编排器
//!
//! 主程序与集成测试共用同一套装配逻辑；测试可替换存储、时钟、浏览器工厂、凭据与通知渠道。

use std::sync::Arc;
use std::time::Duration;

use crate::automation::{ExecutorSettings, StepExecutor};
use crate::browser::BrowserFactory;
use crate::config::AppConfig;
use crate::core::{Clock, PortalResult, RetryController, RetryPolicy, SystemClock};
use crate::intervention::{
    HttpNotifier, InterventionService, InterventionSettings, Notifier, RoundRobinAssigner,
};
use crate::orchestrator::Orchestrator;
use crate::otp::{OtpCoordinator, OtpSettings, SecretBox};
use crate::session::{
    CredentialProvider, EnvCredentialProvider, LifecycleSettings, PortalSessionLifecycle,
    SessionLockManager,
};
use crate::store::{create_record_store, RecordStore};

/// 装配完成的运行时组件
#[derive(Clone)]
pub struct Runtime {
    pub config: AppConfig,
    pub store: Arc<dyn RecordStore>,
    pub clock: Arc<dyn Clock>,
    pub locks: SessionLockManager,
    pub otp: Arc<OtpCoordinator>,
    pub interventions: Arc<InterventionService>,
    pub lifecycle: Arc<PortalSessionLifecycle>,
    pub executor: Arc<StepExecutor>,
    pub retry: Arc<RetryController>,
    pub orchestrator: Arc<Orchestrator>,
}

/// 运行时构建器
pub struct RuntimeBuilder {
    config: AppConfig,
    store: Option<Arc<dyn RecordStore>>,
    clock: Option<Arc<dyn Clock>>,
    browsers: Option<Arc<dyn BrowserFactory>>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl RuntimeBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            store: None,
            clock: None,
            browsers: None,
            credentials: None,
            notifier: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_browsers(mut self, browsers: Arc<dyn BrowserFactory>) -> Self {
        self.browsers = Some(browsers);
        self
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    fn default_browsers(config: &AppConfig) -> Arc<dyn BrowserFactory> {
        #[cfg(feature = "browser")]
        {
            Arc::new(crate::browser::ChromeBrowserFactory::new(
                true,
                Duration::from_secs(config.executor.default_step_timeout_secs),
            ))
        }
        #[cfg(not(feature = "browser"))]
        {
            let _ = config;
            tracing::warn!("built without the `browser` feature, portal automation is unavailable");
            Arc::new(crate::browser::UnavailableBrowserFactory)
        }
    }

    pub fn build(self) -> PortalResult<Runtime> {
        let config = self.config;
        let store = self.store.unwrap_or_else(|| {
            create_record_store(&config.store.backend, config.store.path.as_deref())
        });
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let browsers = self
            .browsers
            .unwrap_or_else(|| Self::default_browsers(&config));
        let credentials = self
            .credentials
            .unwrap_or_else(|| Arc::new(EnvCredentialProvider));
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(HttpNotifier::new()));

        let locks = SessionLockManager::new(
            store.clone(),
            clock.clone(),
            config.app.worker_id(),
            config.lock.ttl(),
            Duration::from_millis(config.lock.poll_interval_ms),
        );

        let secrets = SecretBox::from_config(config.otp.encryption_key.as_deref())?;
        let otp = Arc::new(OtpCoordinator::new(
            store.clone(),
            clock.clone(),
            secrets,
            OtpSettings::from(&config.otp),
        ));

        let interventions = Arc::new(InterventionService::new(
            store.clone(),
            clock.clone(),
            notifier,
            Arc::new(RoundRobinAssigner::new(config.intervention.team.clone())),
            InterventionSettings::from(&config.intervention),
        ));

        let lifecycle = Arc::new(PortalSessionLifecycle::new(
            store.clone(),
            clock.clone(),
            locks.clone(),
            otp.clone(),
            interventions.clone(),
            browsers,
            credentials,
            LifecycleSettings::from_config(&config),
        ));

        let executor = Arc::new(StepExecutor::new(
            ExecutorSettings::from_config(&config.executor, &config.retry),
            clock.clone(),
        ));

        let retry = Arc::new(RetryController::new(
            store.clone(),
            clock.clone(),
            interventions.clone(),
            RetryPolicy::from(&config.retry),
            Duration::from_secs(config.retry.circuit_open_secs),
        ));

        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            clock.clone(),
            config.portals.clone(),
            lifecycle.clone(),
            executor.clone(),
            retry.clone(),
            interventions.clone(),
            otp.clone(),
        )
        .with_timeout(Duration::from_secs(config.executor.orchestration_timeout_secs)));

        tracing::info!(
            worker_id = %locks.holder(),
            portals = config.portals.len(),
            backend = %config.store.backend,
            "runtime assembled"
        );

        Ok(Runtime {
            config,
            store,
            clock,
            locks,
            otp,
            interventions,
            lifecycle,
            executor,
            retry,
            orchestrator,
        })
    }
}
