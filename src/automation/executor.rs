//! 步骤执行器
//!
//! 严格按顺序执行计划；每个步骤有独立超时，可重试的步骤失败后原地重试（不重跑整个计划）。
//! 步骤内的 panic 被捕获并归类为该步骤的失败。navigate / act 之后检查反自动化信号。
//! 每次尝试输出一行 JSON 审计日志；无论成功、失败还是 panic，浏览器都会被关闭。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::FutureExt;
use regex::Regex;

use super::step::{
    interpolate, AutomationStep, ExecutionSummary, ExtractField, StepAction, StepFailure, StepKind,
    StepLog, StepStatus,
};
use crate::browser::{BotDetector, BrowserError, BrowserResult, BrowserSession, TypeOptions};
use crate::config::{ExecutorSection, RetrySection};
use crate::core::{
    ClassifiedError, Clock, ErrorCategory, PortalError, PortalResult, RetryController,
};
use crate::store::ExtractedData;

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub default_step_timeout: Duration,
    /// 第 n 次重试前等待 retry_delay * n
    pub retry_delay: Duration,
    pub screenshot_on_failure: bool,
    pub bot_check: bool,
}

impl ExecutorSettings {
    pub fn from_config(executor: &ExecutorSection, retry: &RetrySection) -> Self {
        Self {
            default_step_timeout: Duration::from_secs(executor.default_step_timeout_secs),
            retry_delay: Duration::from_millis(retry.step_retry_delay_ms),
            screenshot_on_failure: executor.screenshot_on_failure,
            bot_check: executor.bot_check,
        }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from_config(&ExecutorSection::default(), &RetrySection::default())
    }
}

/// 步骤日志的观察者（执行记录落盘等）
#[async_trait]
pub trait StepObserver: Send + Sync {
    async fn on_step(&self, log: &StepLog, extracted: &ExtractedData);
}

pub struct NoopObserver;

#[async_trait]
impl StepObserver for NoopObserver {
    async fn on_step(&self, _log: &StepLog, _extracted: &ExtractedData) {}
}

pub struct StepExecutor {
    settings: ExecutorSettings,
    detector: BotDetector,
    clock: Arc<dyn Clock>,
}

impl StepExecutor {
    pub fn new(settings: ExecutorSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            detector: BotDetector::new(),
            clock,
        }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    pub async fn run(
        &self,
        plan: &[AutomationStep],
        browser: Box<dyn BrowserSession>,
    ) -> Result<ExecutionSummary, StepFailure> {
        self.run_with_observer(plan, browser, &NoopObserver).await
    }

    /// 执行计划并在所有出口关闭浏览器
    pub async fn run_with_observer(
        &self,
        plan: &[AutomationStep],
        mut browser: Box<dyn BrowserSession>,
        observer: &dyn StepObserver,
    ) -> Result<ExecutionSummary, StepFailure> {
        let outcome = self.drive(plan, browser.as_mut(), observer).await;
        if let Err(e) = browser.close().await {
            tracing::warn!("failed to close browser after run: {}", e);
        }
        outcome
    }

    async fn drive(
        &self,
        plan: &[AutomationStep],
        browser: &mut dyn BrowserSession,
        observer: &dyn StepObserver,
    ) -> Result<ExecutionSummary, StepFailure> {
        let total = plan.len();
        let mut extracted = ExtractedData::new();
        let mut logs: Vec<StepLog> = Vec::new();

        for (index, step) in plan.iter().enumerate() {
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                let started = Instant::now();
                let result = self.attempt(step, browser, &mut extracted).await;
                let duration_ms = started.elapsed().as_millis() as u64;

                let error = match result {
                    Ok(()) => {
                        let log = self.log(step, index, StepStatus::Completed, attempt, None, duration_ms);
                        audit(&log);
                        observer.on_step(&log, &extracted).await;
                        logs.push(log);
                        break;
                    }
                    Err(e) => e,
                };

                let classified = match step.kind() {
                    StepKind::Otp => ClassifiedError::new(
                        "HUMAN_REQUIRED",
                        ErrorCategory::Authentication,
                        error.to_string(),
                    )
                    .with_retryable(false),
                    _ => RetryController::classify(&error),
                };
                let requires_human = step.kind() == StepKind::Otp
                    || classified.category == ErrorCategory::BotDetection;
                let terminal =
                    requires_human || !classified.retryable || attempt >= step.max_attempts();

                let screenshot = if terminal && self.settings.screenshot_on_failure {
                    capture(browser).await
                } else {
                    None
                };
                let status = if terminal {
                    StepStatus::Failed
                } else {
                    StepStatus::Retrying
                };
                let mut log = self.log(
                    step,
                    index,
                    status,
                    attempt,
                    Some(classified.to_string()),
                    duration_ms,
                );
                log.screenshot = screenshot.clone();
                audit(&log);
                observer.on_step(&log, &extracted).await;
                logs.push(log);

                if terminal {
                    tracing::warn!(
                        step = %step.name,
                        attempts = attempt,
                        code = %classified.code,
                        "step failed"
                    );
                    return Err(StepFailure {
                        step: step.name.clone(),
                        index,
                        kind: step.kind(),
                        error: classified,
                        attempts: attempt,
                        requires_human,
                        screenshot,
                        completed: index,
                        total,
                        extracted,
                        logs,
                    });
                }

                tracing::debug!(step = %step.name, attempt, "retrying step");
                tokio::time::sleep(self.settings.retry_delay * attempt).await;
            }
        }

        Ok(ExecutionSummary {
            completed: total,
            total,
            extracted,
            logs,
        })
    }

    fn log(
        &self,
        step: &AutomationStep,
        index: usize,
        status: StepStatus,
        attempt: u32,
        message: Option<String>,
        duration_ms: u64,
    ) -> StepLog {
        StepLog {
            step: step.name.clone(),
            index,
            kind: step.kind(),
            status,
            attempt,
            message,
            duration_ms,
            at: self.clock.now_ms(),
            screenshot: None,
        }
    }

    /// 单次尝试：超时与 panic 都转为错误值
    async fn attempt(
        &self,
        step: &AutomationStep,
        browser: &mut dyn BrowserSession,
        extracted: &mut ExtractedData,
    ) -> PortalResult<()> {
        if let StepAction::Otp { instruction } = &step.action {
            return Err(PortalError::StepFailed(format!(
                "'{}' requires human intervention: {}",
                step.name, instruction
            )));
        }

        let timeout = step.timeout.unwrap_or(self.settings.default_step_timeout);
        let work = AssertUnwindSafe(perform(step, &mut *browser, extracted, timeout)).catch_unwind();
        match tokio::time::timeout(timeout, work).await {
            Err(_) => {
                return Err(PortalError::Timeout(format!(
                    "step '{}' exceeded {}ms",
                    step.name,
                    timeout.as_millis()
                )))
            }
            Ok(Err(panic)) => {
                return Err(PortalError::StepFailed(format!(
                    "step '{}' panicked: {}",
                    step.name,
                    panic_message(panic.as_ref())
                )))
            }
            Ok(Ok(result)) => result?,
        }

        if self.settings.bot_check && step.kind().checks_for_bots() {
            let signal = self.detector.check(browser).await?;
            if signal.should_escalate {
                return Err(PortalError::BotDetected {
                    confidence: signal.confidence,
                    signals: signal.signals,
                });
            }
        }
        Ok(())
    }
}

async fn perform(
    step: &AutomationStep,
    browser: &mut dyn BrowserSession,
    extracted: &mut ExtractedData,
    timeout: Duration,
) -> PortalResult<()> {
    match &step.action {
        StepAction::Navigate { url } => {
            browser.navigate(&interpolate(url, extracted)).await?;
        }
        StepAction::Act {
            fills,
            click,
            wait_for,
            ..
        } => {
            for fill in fills {
                let value = interpolate(&fill.value, extracted);
                if fill.human {
                    browser
                        .type_text(&fill.selector, &value, TypeOptions::human())
                        .await?;
                } else {
                    browser.fill(&fill.selector, &value).await?;
                }
            }
            if let Some(selector) = click {
                browser.click(selector).await?;
            }
            if let Some(target) = wait_for {
                browser.wait_for(target, timeout).await?;
            }
        }
        StepAction::Extract { fields } => {
            for field in fields {
                match extract_field(browser, field).await? {
                    Some(value) => {
                        extracted.insert(field.name.clone(), serde_json::Value::String(value));
                    }
                    None if field.required => {
                        return Err(BrowserError::ElementNotFound(format!(
                            "{} ({})",
                            field.name,
                            field.selectors.join(" | ")
                        ))
                        .into());
                    }
                    None => {}
                }
            }
        }
        StepAction::Observe { selectors } => {
            let refs: Vec<&str> = selectors.iter().map(String::as_str).collect();
            if browser.first_present(&refs).await?.is_none() {
                return Err(BrowserError::ElementNotFound(selectors.join(", ")).into());
            }
        }
        StepAction::Wait { target } => {
            browser.wait_for(target, timeout).await?;
        }
        StepAction::Upload {
            selector,
            path,
            wait_for,
        } => {
            browser.upload_file(selector, path).await?;
            if let Some(target) = wait_for {
                browser.wait_for(target, timeout).await?;
            }
        }
        StepAction::Otp { .. } => {
            return Err(PortalError::StepFailed(format!(
                "'{}' cannot be automated",
                step.name
            )));
        }
    }
    Ok(())
}

async fn extract_field(
    browser: &mut dyn BrowserSession,
    field: &ExtractField,
) -> BrowserResult<Option<String>> {
    let mut sources = Vec::new();
    if field.selectors.is_empty() {
        sources.push(browser.page_text().await?);
    } else {
        for selector in &field.selectors {
            if let Some(text) = browser.inner_text(selector).await? {
                if !text.trim().is_empty() {
                    sources.push(text);
                }
            }
        }
    }

    for text in sources {
        if field.patterns.is_empty() {
            return Ok(Some(text.trim().to_string()));
        }
        for pattern in &field.patterns {
            let re = match Regex::new(pattern) {
                Ok(re) => re,
                Err(e) => {
                    tracing::warn!(field = %field.name, "invalid extract pattern: {}", e);
                    continue;
                }
            };
            if let Some(m) = re.captures(&text).and_then(|c| c.get(1)) {
                return Ok(Some(m.as_str().trim().to_string()));
            }
        }
    }
    Ok(None)
}

async fn capture(browser: &mut dyn BrowserSession) -> Option<String> {
    match browser.screenshot().await {
        Ok(bytes) => Some(BASE64.encode(bytes)),
        Err(e) => {
            tracing::debug!("failure screenshot unavailable: {}", e);
            None
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn audit(log: &StepLog) {
    let audit = serde_json::json!({
        "event": "step_audit",
        "step": log.step,
        "index": log.index,
        "kind": log.kind.as_str(),
        "status": log.status,
        "attempt": log.attempt,
        "duration_ms": log.duration_ms,
        "message": log.message,
    });
    tracing::info!(audit = %audit.to_string(), "step");
}
