//! 失败分类、退避重试与熔断
//!
//! 把 PortalError 归类为 ClassifiedError，再决定：可重试且预算未用尽 → 写入 FailedJobRecord 并按指数退避排期；
//! 不可重试、预算用尽或命中反自动化 → 开人工介入工单，失败任务进入终态。
//! bot_detection 首次出现即升级，同时为该 payer 打开熔断，熔断期内新请求直接转人工。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::RwLock;

use crate::browser::BrowserError;
use crate::config::RetrySection;
use crate::core::{Clock, ClassifiedError, ErrorCategory, PortalError, PortalResult, Severity};
use crate::intervention::{InterventionRequest, InterventionService};
use crate::store::{FailedJobRecord, FailedJobStatus, InterventionKind, Priority, RecordStore};

/// 退避参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_ratio: f64,
    pub max_retries: u32,
}

impl From<&RetrySection> for RetryPolicy {
    fn from(section: &RetrySection) -> Self {
        Self {
            base_delay: Duration::from_millis(section.base_delay_ms),
            max_delay: Duration::from_millis(section.max_delay_ms),
            jitter_ratio: section.jitter_ratio.clamp(0.0, 1.0),
            max_retries: section.max_retries,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySection::default())
    }
}

impl RetryPolicy {
    /// 不含抖动的退避：min(base * 2^n, cap)
    pub fn nominal_delay(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// 带抖动的退避，抖动不超过 jitter_ratio
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let delay = self.nominal_delay(retry_count);
        if self.jitter_ratio <= 0.0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen::<f64>() * self.jitter_ratio;
        delay + delay.mul_f64(jitter)
    }
}

/// 升级原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationReason {
    NonRetryable,
    BudgetExhausted,
    BotDetected,
}

impl EscalationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NonRetryable => "non_retryable",
            Self::BudgetExhausted => "max_retries_exceeded",
            Self::BotDetected => "bot_detected",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Retry { delay: Duration, retry_count: u32 },
    Escalate { reason: EscalationReason },
}

/// 一次失败的上下文
#[derive(Debug, Clone)]
pub struct FailureContext {
    pub organization_id: String,
    pub payer_id: String,
    pub workflow_run_id: Option<String>,
    pub session_id: Option<String>,
    /// 重跑已有任务时传入，首次失败为 None
    pub job_id: Option<String>,
    /// 请求快照，用于重跑
    pub payload: serde_json::Value,
    pub error: ClassifiedError,
    pub current_step: Option<String>,
    /// base64 PNG
    pub screenshot: Option<String>,
}

impl FailureContext {
    pub fn new(
        organization_id: impl Into<String>,
        payer_id: impl Into<String>,
        error: ClassifiedError,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            payer_id: payer_id.into(),
            workflow_run_id: None,
            session_id: None,
            job_id: None,
            payload: serde_json::Value::Null,
            error,
            current_step: None,
            screenshot: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailureDisposition {
    RetryScheduled {
        job_id: String,
        next_retry_at: i64,
        delay: Duration,
        retry_count: u32,
    },
    Escalated {
        ticket_id: String,
        job_id: String,
        reason: EscalationReason,
    },
}

/// 重试控制器
pub struct RetryController {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    interventions: Arc<InterventionService>,
    policy: RetryPolicy,
    circuit_open_for: Duration,
    /// payer_id -> 熔断截止时间
    circuits: RwLock<HashMap<String, i64>>,
}

impl RetryController {
    pub fn new(
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        interventions: Arc<InterventionService>,
        policy: RetryPolicy,
        circuit_open_for: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            interventions,
            policy,
            circuit_open_for,
            circuits: RwLock::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// 按错误变体归类；未覆盖的变体退回到文本关键字
    pub fn classify(error: &PortalError) -> ClassifiedError {
        let message = error.to_string();
        match error {
            PortalError::BotDetected { .. } => {
                ClassifiedError::new("BOT_DETECTED", ErrorCategory::BotDetection, message)
            }
            PortalError::InvalidCredentials(_) => {
                ClassifiedError::new("INVALID_CREDENTIALS", ErrorCategory::Authentication, message)
                    .with_retryable(false)
            }
            PortalError::AuthenticationFailed(_) => {
                ClassifiedError::new("AUTH_FAILED", ErrorCategory::Authentication, message)
            }
            PortalError::LockTimeout { .. } | PortalError::LockNotHeld(_) => {
                ClassifiedError::new("LOCK_TIMEOUT", ErrorCategory::Network, message)
            }
            PortalError::OtpTimeout(_) | PortalError::OtpExpired(_) | PortalError::OtpInvalid(_) => {
                ClassifiedError::new("OTP_FAILED", ErrorCategory::Authentication, message)
            }
            // 冷却期或窗口上限：不可重试
            PortalError::OtpCooldown { .. } | PortalError::OtpAttemptsExhausted { .. } => {
                ClassifiedError::new("OTP_EXHAUSTED", ErrorCategory::Authentication, message)
                    .with_retryable(false)
            }
            PortalError::Browser(BrowserError::ElementNotFound(_) | BrowserError::Timeout(_))
            | PortalError::Timeout(_) => {
                ClassifiedError::new("SELECTOR_TIMEOUT", ErrorCategory::PortalChange, message)
            }
            PortalError::Browser(
                BrowserError::Connection(_)
                | BrowserError::Navigation(_)
                | BrowserError::Closed
                | BrowserError::Unavailable(_),
            ) => ClassifiedError::new("NETWORK_ERROR", ErrorCategory::Network, message),
            PortalError::Validation(_) => {
                ClassifiedError::new("VALIDATION_ERROR", ErrorCategory::FormFilling, message)
            }
            PortalError::Store(_) => {
                ClassifiedError::new("STORE_ERROR", ErrorCategory::Network, message)
            }
            _ => Self::classify_message(&message),
        }
    }

    /// 关键字表；顺序即优先级
    pub fn classify_message(message: &str) -> ClassifiedError {
        let lower = message.to_lowercase();
        if lower.contains("captcha") || lower.contains("bot detection") {
            ClassifiedError::new("BOT_DETECTED", ErrorCategory::BotDetection, message)
        } else if lower.contains("timeout") || lower.contains("element not found") {
            ClassifiedError::new("SELECTOR_TIMEOUT", ErrorCategory::PortalChange, message)
        } else if lower.contains("authentication") || lower.contains("login") {
            ClassifiedError::new("AUTH_FAILED", ErrorCategory::Authentication, message)
        } else if lower.contains("network") || lower.contains("connection") {
            ClassifiedError::new("NETWORK_ERROR", ErrorCategory::Network, message)
        } else {
            ClassifiedError::new("UNKNOWN_ERROR", ErrorCategory::FormFilling, message)
                .with_severity(Severity::High)
                .with_retryable(false)
        }
    }

    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        self.policy.backoff_delay(retry_count)
    }

    /// retry_count 为本次失败之前已经排过的重试次数
    pub fn decide(&self, error: &ClassifiedError, retry_count: u32) -> RetryDecision {
        if error.category == ErrorCategory::BotDetection {
            return RetryDecision::Escalate {
                reason: EscalationReason::BotDetected,
            };
        }
        if !error.retryable {
            return RetryDecision::Escalate {
                reason: EscalationReason::NonRetryable,
            };
        }
        if retry_count >= self.policy.max_retries {
            return RetryDecision::Escalate {
                reason: EscalationReason::BudgetExhausted,
            };
        }
        RetryDecision::Retry {
            delay: self.backoff_delay(retry_count),
            retry_count: retry_count + 1,
        }
    }

    pub async fn is_circuit_open(&self, payer_id: &str) -> bool {
        let now = self.clock.now_ms();
        self.circuits
            .read()
            .await
            .get(payer_id)
            .map_or(false, |until| *until > now)
    }

    async fn open_circuit(&self, payer_id: &str) {
        let until = self.clock.now_ms() + self.circuit_open_for.as_millis() as i64;
        self.circuits.write().await.insert(payer_id.to_string(), until);
        tracing::warn!(payer_id = %payer_id, until, "circuit opened after bot detection");
    }

    /// 记录失败并给出处置：排期重试或升级人工
    pub async fn handle_failure(&self, ctx: FailureContext) -> PortalResult<FailureDisposition> {
        let now = self.clock.now_ms();
        let existing = match &ctx.job_id {
            Some(id) => self.store.get_failed_job(id).await?,
            None => None,
        };
        let is_new = existing.is_none();
        let mut job = existing.unwrap_or_else(|| {
            let mut job = FailedJobRecord::new(
                ctx.organization_id.clone(),
                ctx.payer_id.clone(),
                ctx.payload.clone(),
                self.policy.max_retries,
                now,
            );
            job.workflow_run_id = ctx.workflow_run_id.clone();
            job
        });
        if ctx.workflow_run_id.is_some() {
            job.workflow_run_id = ctx.workflow_run_id.clone();
        }
        job.failure_reason = ctx.error.category.as_str().to_string();
        job.last_error = ctx.error.message.clone();
        job.updated_at = now;
        if is_new {
            self.store.insert_failed_job(&job).await?;
        }

        let decision = self.decide(&ctx.error, job.retry_count);
        tracing::info!(
            job_id = %job.id,
            code = %ctx.error.code,
            category = %ctx.error.category,
            retry_count = job.retry_count,
            decision = ?decision,
            "automation failure handled"
        );

        match decision {
            RetryDecision::Retry { delay, retry_count } => {
                let next_retry_at = now + delay.as_millis() as i64;
                job.retry_count = retry_count;
                job.next_retry_at = Some(next_retry_at);
                job.status = FailedJobStatus::Scheduled;
                self.store.update_failed_job(&job).await?;
                Ok(FailureDisposition::RetryScheduled {
                    job_id: job.id,
                    next_retry_at,
                    delay,
                    retry_count,
                })
            }
            RetryDecision::Escalate { reason } => {
                if reason == EscalationReason::BotDetected {
                    self.open_circuit(&ctx.payer_id).await;
                }
                let ticket = self.escalate(&ctx, &job, reason).await?;
                job.status = FailedJobStatus::Escalated;
                job.next_retry_at = None;
                job.intervention_id = Some(ticket.clone());
                self.store.update_failed_job(&job).await?;
                Ok(FailureDisposition::Escalated {
                    ticket_id: ticket,
                    job_id: job.id,
                    reason,
                })
            }
        }
    }

    async fn escalate(
        &self,
        ctx: &FailureContext,
        job: &FailedJobRecord,
        reason: EscalationReason,
    ) -> PortalResult<String> {
        let category = ctx.error.category;
        let context = serde_json::json!({
            "error_code": ctx.error.code,
            "error_message": ctx.error.message,
            "category": category.as_str(),
            "current_step": ctx.current_step,
            "retry_count": job.retry_count,
            "failed_job_id": job.id,
            "escalation_reason": reason.as_str(),
            "screenshot": ctx.screenshot,
            "next_steps": next_steps(category),
        });
        let request = InterventionRequest::new(
            InterventionKind::for_category(category),
            ctx.organization_id.clone(),
            format!("{} Error in PA Automation", category.as_str()),
            ctx.error.message.clone(),
        )
        .with_category(category)
        .with_priority(Priority::from(ctx.error.severity))
        .with_run(ctx.workflow_run_id.clone())
        .with_session(ctx.session_id.clone())
        .with_instructions(intervention_instructions(category))
        .with_context(context);

        let ticket = self.interventions.create(request).await?;
        Ok(ticket.id)
    }

    /// 成功后删除失败任务
    pub async fn record_success(&self, job_id: &str) -> PortalResult<bool> {
        Ok(self.store.delete_failed_job(job_id).await?)
    }

    /// 把任务挂到已建好的人工工单上，不再自动重跑
    pub async fn escalate_to_ticket(&self, job_id: &str, ticket_id: &str) -> PortalResult<bool> {
        let Some(mut job) = self.store.get_failed_job(job_id).await? else {
            return Ok(false);
        };
        job.status = FailedJobStatus::Escalated;
        job.next_retry_at = None;
        job.intervention_id = Some(ticket_id.to_string());
        job.updated_at = self.clock.now_ms();
        self.store.update_failed_job(&job).await?;
        tracing::info!(job_id = %job_id, ticket_id = %ticket_id, "failed job attached to intervention");
        Ok(true)
    }

    pub async fn due_jobs(&self) -> PortalResult<Vec<FailedJobRecord>> {
        Ok(self.store.due_failed_jobs(self.clock.now_ms()).await?)
    }

    /// 取走一个到期任务；已被其它 worker 取走时返回 false
    pub async fn mark_retrying(&self, job_id: &str) -> PortalResult<bool> {
        Ok(self
            .store
            .claim_failed_job(
                job_id,
                FailedJobStatus::Scheduled,
                FailedJobStatus::Retrying,
                self.clock.now_ms(),
            )
            .await?)
    }
}

/// 给调用方的后续建议
pub fn next_steps(category: ErrorCategory) -> Vec<String> {
    let steps: &[&str] = match category {
        ErrorCategory::BotDetection => &[
            "Manual portal access required",
            "Complete PA form manually",
            "Update bot avoidance configuration",
            "Review portal changes",
        ],
        ErrorCategory::Authentication => &[
            "Verify portal credentials",
            "Check 2FA/OTP requirements",
            "Test manual login",
            "Update authentication configuration",
        ],
        ErrorCategory::PortalChange => &[
            "Inspect portal structure changes",
            "Update selector configuration",
            "Test new selectors",
            "Complete submission manually",
        ],
        ErrorCategory::Network => &[
            "Check network connectivity",
            "Retry with exponential backoff",
            "Verify portal availability",
            "Review firewall settings",
        ],
        ErrorCategory::FormFilling => &[
            "Review error details",
            "Complete task manually",
            "Update automation configuration",
            "Contact technical support",
        ],
    };
    steps.iter().map(|s| s.to_string()).collect()
}

/// 工单中给处理人的操作步骤
pub fn intervention_instructions(category: ErrorCategory) -> Vec<String> {
    let steps: &[&str] = match category {
        ErrorCategory::BotDetection => &[
            "Access the portal manually using the same credentials",
            "Navigate to the prior authorization section",
            "Complete the PA form with the provided patient data",
            "Submit and capture the confirmation number",
        ],
        ErrorCategory::Authentication => &[
            "Verify portal credentials are correct",
            "Check if 2FA/OTP is required",
            "Test manual login to the portal",
            "Update credentials if needed",
        ],
        ErrorCategory::PortalChange => &[
            "Inspect the current portal structure",
            "Update selectors in the portal configuration",
            "Test the new selectors manually",
            "Complete the PA submission manually if needed",
        ],
        ErrorCategory::Network | ErrorCategory::FormFilling => {
            &["Review the error details and complete the PA submission manually"]
        }
    };
    steps.iter().map(|s| s.to_string()).collect()
}
