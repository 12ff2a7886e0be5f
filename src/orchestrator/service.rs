//! 编排器：提交 / 状态查询 / 附件上传的对外入口
//!
//! 获取会话（复用或登录）→ 构建计划 → StepExecutor 执行 → 成功则整理结果，
//! 失败交给 RetryController 排期重试或升级人工。调用方拿到的永远是结构化结果。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::confirmation::ConfirmationNumber;
use super::request::{
    validate_documents, JobPayload, OrchestrationResult, OrchestrationStatus, PortalStatus,
    PortalTarget, StatusRequest, StatusResult, SubmissionRequest, UploadRequest,
};
use crate::automation::{AutomationStep, PlanBuilder, StepExecutor, StepLog, StepObserver};
use crate::config::PortalProfile;
use crate::core::{
    next_steps, ClassifiedError, Clock, ErrorCategory, FailureContext, FailureDisposition,
    PortalError, PortalResult, RetryController,
};
use crate::intervention::{InterventionRequest, InterventionService};
use crate::otp::OtpCoordinator;
use crate::session::{PortalSessionLifecycle, SessionRequest};
use crate::store::{
    ExtractedData, FailedJobStatus, InterventionKind, InterventionTicket, Priority, RecordStore,
    Resolution, ResolutionType, RunError, RunKind, RunStatus, WorkflowRun,
};

const SUBMITTED_NEXT_STEPS: &[&str] = &[
    "Monitor status automatically",
    "Check for payer response in 24-48 hours",
    "Follow up if no response within expected timeframe",
];
const INTERVENTION_NEXT_STEPS: &[&str] = &[
    "Wait for human intervention",
    "Check intervention status",
    "Consider manual submission if intervention fails",
];
const UNSUPPORTED_NEXT_STEPS: &[&str] = &["Submit manually via payer portal", "Contact payer directly"];
const STATUS_UNSUPPORTED_NEXT_STEPS: &[&str] = &["Check status manually", "Contact payer directly"];
const UPLOADED_NEXT_STEPS: &[&str] = &["Monitor for payer response", "Check status in 24 hours"];
const VALIDATION_NEXT_STEPS: &[&str] = &["Correct the request data", "Resubmit the request"];
const EXCEPTION_NEXT_STEPS: &[&str] = &[
    "Contact technical support",
    "Submit manually via payer portal",
    "Check system status",
];

const MANUAL_REVIEW_TIMEOUT: Duration = Duration::from_secs(60 * 60);
const DEFAULT_ORCHESTRATION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

fn owned(steps: &[&str]) -> Vec<String> {
    steps.iter().map(|s| s.to_string()).collect()
}

fn rejected(message: &str) -> ClassifiedError {
    ClassifiedError::new("VALIDATION_ERROR", ErrorCategory::FormFilling, message).with_retryable(false)
}

fn unsupported(message: &str) -> ClassifiedError {
    ClassifiedError::new("UNSUPPORTED_OPERATION", ErrorCategory::FormFilling, message)
        .with_retryable(false)
}

/// 执行过程中把每条步骤日志写回 WorkflowRun
struct RunRecorder {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    run: Mutex<WorkflowRun>,
}

impl RunRecorder {
    fn new(store: Arc<dyn RecordStore>, clock: Arc<dyn Clock>, run: WorkflowRun) -> Self {
        Self {
            store,
            clock,
            run: Mutex::new(run),
        }
    }

    fn into_run(self) -> WorkflowRun {
        self.run.into_inner()
    }
}

#[async_trait]
impl StepObserver for RunRecorder {
    async fn on_step(&self, log: &StepLog, extracted: &ExtractedData) {
        let mut run = self.run.lock().await;
        run.steps.push(log.clone());
        run.current_step = Some(log.step.clone());
        run.extracted = extracted.clone();
        run.updated_at = self.clock.now_ms();
        if let Err(e) = self.store.update_run(&run).await {
            tracing::warn!(run_id = %run.id, "failed to record step progress: {}", e);
        }
    }
}

/// 一次自动化的执行结果
enum RunOutcome {
    Succeeded(WorkflowRun),
    Failed {
        run: WorkflowRun,
        error: ClassifiedError,
        step: Option<String>,
        screenshot: Option<String>,
    },
}

/// 失败处置后给调用方的摘要
struct FailureReport {
    status: OrchestrationStatus,
    intervention_id: Option<String>,
    failed_job_id: Option<String>,
    next_retry_at: Option<i64>,
    error: String,
    next_steps: Vec<String>,
}

pub struct Orchestrator {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    portals: Vec<PortalProfile>,
    lifecycle: Arc<PortalSessionLifecycle>,
    executor: Arc<StepExecutor>,
    retry: Arc<RetryController>,
    interventions: Arc<InterventionService>,
    otp: Arc<OtpCoordinator>,
    /// 单次编排（登录 + 执行计划）的总上限
    timeout: Duration,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        portals: Vec<PortalProfile>,
        lifecycle: Arc<PortalSessionLifecycle>,
        executor: Arc<StepExecutor>,
        retry: Arc<RetryController>,
        interventions: Arc<InterventionService>,
        otp: Arc<OtpCoordinator>,
    ) -> Self {
        Self {
            store,
            clock,
            portals,
            lifecycle,
            executor,
            retry,
            interventions,
            otp,
            timeout: DEFAULT_ORCHESTRATION_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 未配置的 payer 使用通用门户地址
    pub fn portal(&self, payer_id: &str) -> PortalProfile {
        self.portals
            .iter()
            .find(|p| p.payer_id == payer_id)
            .cloned()
            .unwrap_or_else(|| PortalProfile::new(payer_id, ""))
    }

    // ----- 提交 -----

    pub async fn submit(&self, request: SubmissionRequest) -> OrchestrationResult {
        self.submit_job(request, None).await
    }

    async fn submit_job(&self, request: SubmissionRequest, job_id: Option<String>) -> OrchestrationResult {
        let prior_auth_id = request.prior_auth_id.clone();
        match self.try_submit(&request, job_id.clone()).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(prior_auth_id = %prior_auth_id, "submission orchestration error: {}", e);
                self.settle_job(job_id.as_deref(), &request.target, RetryController::classify(&e))
                    .await;
                OrchestrationResult::failed(prior_auth_id, e.to_string(), EXCEPTION_NEXT_STEPS)
            }
        }
    }

    async fn try_submit(
        &self,
        request: &SubmissionRequest,
        job_id: Option<String>,
    ) -> PortalResult<OrchestrationResult> {
        let documents = match request.validate() {
            Ok(docs) => docs,
            Err(e) => {
                tracing::info!(prior_auth_id = %request.prior_auth_id, "submission rejected: {}", e);
                self.settle_job(job_id.as_deref(), &request.target, rejected(&e.to_string()))
                    .await;
                return Ok(OrchestrationResult::failed(
                    request.prior_auth_id.clone(),
                    e.to_string(),
                    VALIDATION_NEXT_STEPS,
                ));
            }
        };

        let portal = self.portal(&request.target.payer_id);
        if !portal.supports_submission {
            let message = format!("{} does not support automated submission", portal.display_name());
            self.settle_job(job_id.as_deref(), &request.target, unsupported(&message))
                .await;
            return Ok(OrchestrationResult::failed(
                request.prior_auth_id.clone(),
                message,
                UNSUPPORTED_NEXT_STEPS,
            ));
        }

        if self.retry.is_circuit_open(&request.target.payer_id).await {
            let (run, ticket) = self
                .open_manual_review(
                    RunKind::Submission,
                    &request.target,
                    &request.prior_auth_id,
                    job_id.as_deref(),
                )
                .await?;
            let mut result = OrchestrationResult::new(
                request.prior_auth_id.clone(),
                OrchestrationStatus::RequiresIntervention,
            );
            result.run_id = Some(run.id);
            result.requires_human_intervention = true;
            result.intervention_id = Some(ticket.id);
            result.error = Some("automation paused for this payer after bot detection".to_string());
            result.next_steps = owned(INTERVENTION_NEXT_STEPS);
            return Ok(result);
        }

        let plan = PlanBuilder::new(&portal).submission(request, &documents);
        let outcome = self
            .execute(
                RunKind::Submission,
                &request.target,
                &request.prior_auth_id,
                &portal,
                plan,
                job_id.as_deref(),
            )
            .await?;
        let payload = serde_json::to_value(JobPayload::Submit(request.clone()))
            .map_err(|e| PortalError::Validation(e.to_string()))?;

        match outcome {
            RunOutcome::Succeeded(mut run) => {
                let confirmation = ConfirmationNumber::from_extracted(&run.extracted, self.clock.now_ms());
                run.confirmation = Some(confirmation.clone());
                self.store.update_run(&run).await?;
                self.clear_job(job_id.as_deref()).await;
                tracing::info!(
                    prior_auth_id = %request.prior_auth_id,
                    run_id = %run.id,
                    confirmation = %confirmation,
                    synthesized = confirmation.is_synthesized(),
                    "prior authorization submitted"
                );
                let mut result =
                    OrchestrationResult::new(request.prior_auth_id.clone(), OrchestrationStatus::Submitted);
                result.run_id = Some(run.id);
                result.confirmation = Some(confirmation);
                result.next_steps = owned(SUBMITTED_NEXT_STEPS);
                Ok(result)
            }
            RunOutcome::Failed {
                run,
                error,
                step,
                screenshot,
            } => {
                let run_id = run.id.clone();
                let report = self
                    .handle_failure(run, &request.target, error, step, screenshot, payload, job_id)
                    .await?;
                let mut result = OrchestrationResult::new(request.prior_auth_id.clone(), report.status);
                result.run_id = Some(run_id);
                result.requires_human_intervention = report.status == OrchestrationStatus::RequiresIntervention;
                result.intervention_id = report.intervention_id;
                result.failed_job_id = report.failed_job_id;
                result.next_retry_at = report.next_retry_at;
                result.error = Some(report.error);
                result.next_steps = report.next_steps;
                Ok(result)
            }
        }
    }

    // ----- 状态查询 -----

    pub async fn check_status(&self, request: StatusRequest) -> StatusResult {
        self.check_status_job(request, None).await
    }

    async fn check_status_job(&self, request: StatusRequest, job_id: Option<String>) -> StatusResult {
        match self.try_check_status(&request, job_id.clone()).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(prior_auth_id = %request.prior_auth_id, "status check error: {}", e);
                self.settle_job(job_id.as_deref(), &request.target, RetryController::classify(&e))
                    .await;
                Self::status_failed(&request.prior_auth_id, e.to_string(), EXCEPTION_NEXT_STEPS)
            }
        }
    }

    fn status_failed(prior_auth_id: &str, error: String, steps: &[&str]) -> StatusResult {
        StatusResult {
            prior_auth_id: prior_auth_id.to_string(),
            outcome: OrchestrationStatus::Failed,
            portal_status: PortalStatus::Unknown,
            extracted: ExtractedData::new(),
            run_id: None,
            intervention_id: None,
            error: Some(error),
            next_steps: owned(steps),
        }
    }

    async fn try_check_status(
        &self,
        request: &StatusRequest,
        job_id: Option<String>,
    ) -> PortalResult<StatusResult> {
        if request.reference_number.trim().is_empty() {
            let message = "No reference number available for status check";
            self.settle_job(job_id.as_deref(), &request.target, rejected(message))
                .await;
            return Ok(Self::status_failed(
                &request.prior_auth_id,
                message.to_string(),
                STATUS_UNSUPPORTED_NEXT_STEPS,
            ));
        }
        let portal = self.portal(&request.target.payer_id);
        if !portal.supports_status_check {
            let message = format!("{} does not support automated status checks", portal.display_name());
            self.settle_job(job_id.as_deref(), &request.target, unsupported(&message))
                .await;
            return Ok(Self::status_failed(
                &request.prior_auth_id,
                message,
                STATUS_UNSUPPORTED_NEXT_STEPS,
            ));
        }

        let mut result = StatusResult {
            prior_auth_id: request.prior_auth_id.clone(),
            outcome: OrchestrationStatus::Failed,
            portal_status: PortalStatus::Unknown,
            extracted: ExtractedData::new(),
            run_id: None,
            intervention_id: None,
            error: None,
            next_steps: Vec::new(),
        };

        if self.retry.is_circuit_open(&request.target.payer_id).await {
            let (run, ticket) = self
                .open_manual_review(
                    RunKind::StatusCheck,
                    &request.target,
                    &request.prior_auth_id,
                    job_id.as_deref(),
                )
                .await?;
            result.outcome = OrchestrationStatus::RequiresIntervention;
            result.run_id = Some(run.id);
            result.intervention_id = Some(ticket.id);
            result.error = Some("automation paused for this payer after bot detection".to_string());
            result.next_steps = owned(INTERVENTION_NEXT_STEPS);
            return Ok(result);
        }

        let plan = PlanBuilder::new(&portal).status_check(request);
        let outcome = self
            .execute(
                RunKind::StatusCheck,
                &request.target,
                &request.prior_auth_id,
                &portal,
                plan,
                job_id.as_deref(),
            )
            .await?;
        let payload = serde_json::to_value(JobPayload::CheckStatus(request.clone()))
            .map_err(|e| PortalError::Validation(e.to_string()))?;

        match outcome {
            RunOutcome::Succeeded(run) => {
                self.clear_job(job_id.as_deref()).await;
                let raw = run
                    .extracted
                    .get("status")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                let status = PortalStatus::normalize(raw);
                tracing::info!(
                    prior_auth_id = %request.prior_auth_id,
                    status = %status.as_str(),
                    "prior authorization status checked"
                );
                result.outcome = OrchestrationStatus::Completed;
                result.portal_status = status;
                result.extracted = run.extracted;
                result.run_id = Some(run.id);
                result.next_steps = status.next_steps();
                Ok(result)
            }
            RunOutcome::Failed {
                run,
                error,
                step,
                screenshot,
            } => {
                result.run_id = Some(run.id.clone());
                result.extracted = run.extracted.clone();
                let report = self
                    .handle_failure(run, &request.target, error, step, screenshot, payload, job_id)
                    .await?;
                result.outcome = report.status;
                result.intervention_id = report.intervention_id;
                result.error = Some(report.error);
                result.next_steps = report.next_steps;
                Ok(result)
            }
        }
    }

    // ----- 附件上传 -----

    pub async fn upload_documents(&self, request: UploadRequest) -> OrchestrationResult {
        self.upload_job(request, None).await
    }

    async fn upload_job(&self, request: UploadRequest, job_id: Option<String>) -> OrchestrationResult {
        let prior_auth_id = request.prior_auth_id.clone();
        match self.try_upload(&request, job_id.clone()).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(prior_auth_id = %prior_auth_id, "document upload error: {}", e);
                self.settle_job(job_id.as_deref(), &request.target, RetryController::classify(&e))
                    .await;
                OrchestrationResult::failed(prior_auth_id, e.to_string(), EXCEPTION_NEXT_STEPS)
            }
        }
    }

    async fn try_upload(
        &self,
        request: &UploadRequest,
        job_id: Option<String>,
    ) -> PortalResult<OrchestrationResult> {
        let documents = match validate_documents(&request.documents) {
            Ok(docs) if docs.is_empty() => {
                let message = "No documents to upload";
                self.settle_job(job_id.as_deref(), &request.target, rejected(message))
                    .await;
                return Ok(OrchestrationResult::failed(
                    request.prior_auth_id.clone(),
                    message,
                    VALIDATION_NEXT_STEPS,
                ));
            }
            Ok(docs) => docs,
            Err(e) => {
                self.settle_job(job_id.as_deref(), &request.target, rejected(&e.to_string()))
                    .await;
                return Ok(OrchestrationResult::failed(
                    request.prior_auth_id.clone(),
                    e.to_string(),
                    VALIDATION_NEXT_STEPS,
                ))
            }
        };
        let portal = self.portal(&request.target.payer_id);
        if !portal.supports_upload {
            let message = format!("{} does not support automated document upload", portal.display_name());
            self.settle_job(job_id.as_deref(), &request.target, unsupported(&message))
                .await;
            return Ok(OrchestrationResult::failed(
                request.prior_auth_id.clone(),
                message,
                UNSUPPORTED_NEXT_STEPS,
            ));
        }

        if self.retry.is_circuit_open(&request.target.payer_id).await {
            let (run, ticket) = self
                .open_manual_review(
                    RunKind::DocumentUpload,
                    &request.target,
                    &request.prior_auth_id,
                    job_id.as_deref(),
                )
                .await?;
            let mut result = OrchestrationResult::new(
                request.prior_auth_id.clone(),
                OrchestrationStatus::RequiresIntervention,
            );
            result.run_id = Some(run.id);
            result.requires_human_intervention = true;
            result.intervention_id = Some(ticket.id);
            result.next_steps = owned(INTERVENTION_NEXT_STEPS);
            return Ok(result);
        }

        let plan = PlanBuilder::new(&portal).document_upload(request, &documents);
        let outcome = self
            .execute(
                RunKind::DocumentUpload,
                &request.target,
                &request.prior_auth_id,
                &portal,
                plan,
                job_id.as_deref(),
            )
            .await?;
        let payload = serde_json::to_value(JobPayload::UploadDocuments(request.clone()))
            .map_err(|e| PortalError::Validation(e.to_string()))?;

        match outcome {
            RunOutcome::Succeeded(run) => {
                self.clear_job(job_id.as_deref()).await;
                tracing::info!(
                    prior_auth_id = %request.prior_auth_id,
                    documents = documents.len(),
                    "documents uploaded"
                );
                let mut result =
                    OrchestrationResult::new(request.prior_auth_id.clone(), OrchestrationStatus::Completed);
                result.run_id = Some(run.id);
                result.next_steps = owned(UPLOADED_NEXT_STEPS);
                Ok(result)
            }
            RunOutcome::Failed {
                run,
                error,
                step,
                screenshot,
            } => {
                let run_id = run.id.clone();
                let report = self
                    .handle_failure(run, &request.target, error, step, screenshot, payload, job_id)
                    .await?;
                let mut result = OrchestrationResult::new(request.prior_auth_id.clone(), report.status);
                result.run_id = Some(run_id);
                result.requires_human_intervention = report.status == OrchestrationStatus::RequiresIntervention;
                result.intervention_id = report.intervention_id;
                result.failed_job_id = report.failed_job_id;
                result.next_retry_at = report.next_retry_at;
                result.error = Some(report.error);
                result.next_steps = report.next_steps;
                Ok(result)
            }
        }
    }

    // ----- 公共执行路径 -----

    /// 获取会话并执行计划；会话锁在返回前释放。登录与执行共用一个截止时间
    async fn execute(
        &self,
        kind: RunKind,
        target: &PortalTarget,
        reference_id: &str,
        portal: &PortalProfile,
        plan: Vec<AutomationStep>,
        job_id: Option<&str>,
    ) -> PortalResult<RunOutcome> {
        let now = self.clock.now_ms();
        let mut run = WorkflowRun::new(kind, &target.organization_id, &target.payer_id, reference_id, now);
        run.set_status(RunStatus::InProgress, now);
        if let Some(id) = job_id {
            run.failed_job_id = Some(id.to_string());
            run.retry_of = self.link_retry(id, &run.id).await?;
        }
        self.store.insert_run(&run).await?;

        let deadline = tokio::time::Instant::now() + self.timeout;
        let session_request =
            SessionRequest::new(&target.organization_id, &target.credential_ref, portal.clone())
                .with_deadline(deadline);
        let lease = match self.lifecycle.acquire(&session_request).await {
            Ok(lease) => lease,
            Err(e) => {
                tracing::warn!(run_id = %run.id, "could not obtain portal session: {}", e);
                return Ok(RunOutcome::Failed {
                    run,
                    error: RetryController::classify(&e),
                    step: Some("authenticate".to_string()),
                    screenshot: None,
                });
            }
        };

        run.session_id = Some(lease.session_id().to_string());
        self.store.update_run(&run).await?;
        let (session, browser, guard) = lease.into_parts();

        let recorder = RunRecorder::new(self.store.clone(), self.clock.clone(), run);
        let result = tokio::time::timeout_at(
            deadline,
            self.executor.run_with_observer(&plan, browser, &recorder),
        )
        .await;
        if let Err(e) = self.lifecycle.finish(session, guard).await {
            tracing::warn!("failed to release portal session: {}", e);
        }
        let mut run = recorder.into_run();

        let result = match result {
            Ok(result) => result,
            Err(_) => {
                let error = PortalError::Timeout(format!(
                    "orchestration exceeded {}s",
                    self.timeout.as_secs()
                ));
                tracing::warn!(run_id = %run.id, "{}", error);
                let step = run.current_step.clone();
                return Ok(RunOutcome::Failed {
                    run,
                    error: RetryController::classify(&error),
                    step,
                    screenshot: None,
                });
            }
        };

        match result {
            Ok(summary) => {
                run.extracted = summary.extracted;
                run.current_step = None;
                run.set_status(RunStatus::Completed, self.clock.now_ms());
                self.store.update_run(&run).await?;
                Ok(RunOutcome::Succeeded(run))
            }
            Err(failure) => {
                tracing::warn!(run_id = %run.id, "{}", failure);
                run.extracted = failure.extracted;
                Ok(RunOutcome::Failed {
                    run,
                    error: failure.error,
                    step: Some(failure.step),
                    screenshot: failure.screenshot,
                })
            }
        }
    }

    /// 重跑时把上一条执行指向新执行，返回上一条执行的 ID
    async fn link_retry(&self, job_id: &str, run_id: &str) -> PortalResult<Option<String>> {
        let Some(previous) = self
            .store
            .get_failed_job(job_id)
            .await?
            .and_then(|job| job.workflow_run_id)
        else {
            return Ok(None);
        };
        if let Some(mut run) = self.store.get_run(&previous).await? {
            run.retried_by = Some(run_id.to_string());
            if !run.status.is_finished() {
                run.set_status(RunStatus::Failed, self.clock.now_ms());
            }
            self.store.update_run(&run).await?;
        }
        Ok(Some(previous))
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_failure(
        &self,
        mut run: WorkflowRun,
        target: &PortalTarget,
        error: ClassifiedError,
        step: Option<String>,
        screenshot: Option<String>,
        payload: serde_json::Value,
        job_id: Option<String>,
    ) -> PortalResult<FailureReport> {
        let now = self.clock.now_ms();
        run.errors.push(RunError {
            at: now,
            step: step.clone(),
            code: error.code.clone(),
            category: error.category,
            message: error.message.clone(),
        });
        run.current_step = step.clone();
        // 先落盘，工单解决时会回写该记录
        run.set_status(RunStatus::Failed, now);
        self.store.update_run(&run).await?;

        let mut ctx = FailureContext::new(&target.organization_id, &target.payer_id, error.clone());
        ctx.workflow_run_id = Some(run.id.clone());
        ctx.session_id = run.session_id.clone();
        ctx.job_id = job_id;
        ctx.payload = payload;
        ctx.current_step = step;
        ctx.screenshot = screenshot;

        let disposition = self.retry.handle_failure(ctx).await?;
        let report = match disposition {
            FailureDisposition::RetryScheduled {
                job_id,
                next_retry_at,
                ..
            } => {
                run.failed_job_id = Some(job_id.clone());
                FailureReport {
                    status: OrchestrationStatus::RetryScheduled,
                    intervention_id: None,
                    failed_job_id: Some(job_id),
                    next_retry_at: Some(next_retry_at),
                    error: error.to_string(),
                    next_steps: next_steps(error.category),
                }
            }
            FailureDisposition::Escalated { ticket_id, job_id, .. } => {
                run.failed_job_id = Some(job_id.clone());
                run.intervention_id = Some(ticket_id.clone());
                run.set_status(RunStatus::WaitingHuman, self.clock.now_ms());
                FailureReport {
                    status: OrchestrationStatus::RequiresIntervention,
                    intervention_id: Some(ticket_id),
                    failed_job_id: Some(job_id),
                    next_retry_at: None,
                    error: error.to_string(),
                    next_steps: owned(INTERVENTION_NEXT_STEPS),
                }
            }
        };
        self.store.update_run(&run).await?;
        Ok(report)
    }

    async fn open_manual_review(
        &self,
        kind: RunKind,
        target: &PortalTarget,
        prior_auth_id: &str,
        job_id: Option<&str>,
    ) -> PortalResult<(WorkflowRun, InterventionTicket)> {
        let now = self.clock.now_ms();
        let mut run = WorkflowRun::new(kind, &target.organization_id, &target.payer_id, prior_auth_id, now);
        run.set_status(RunStatus::WaitingHuman, now);
        run.failed_job_id = job_id.map(str::to_string);
        self.store.insert_run(&run).await?;

        let request = InterventionRequest::new(
            InterventionKind::ManualReview,
            target.organization_id.clone(),
            format!("Prior Auth Automation Failed - {}", prior_auth_id),
            "Automation is paused for this payer after bot detection; complete the task manually.",
        )
        .with_category(ErrorCategory::BotDetection)
        .with_priority(Priority::High)
        .with_run(Some(run.id.clone()))
        .with_instructions(crate::core::intervention_instructions(ErrorCategory::BotDetection))
        .with_context(serde_json::json!({
            "prior_auth_id": prior_auth_id,
            "payer_id": target.payer_id,
            "reason": "circuit_open",
            "failed_job_id": job_id,
        }))
        .with_timeout(MANUAL_REVIEW_TIMEOUT);
        let ticket = self.interventions.create(request).await?;

        run.intervention_id = Some(ticket.id.clone());
        self.store.update_run(&run).await?;
        if let Some(id) = job_id {
            self.retry.escalate_to_ticket(id, &ticket.id).await?;
        }
        tracing::warn!(
            prior_auth_id = %prior_auth_id,
            payer_id = %target.payer_id,
            ticket_id = %ticket.id,
            "circuit open, routed to manual review"
        );
        Ok((run, ticket))
    }

    /// 重跑的任务提前返回时仍停在 retrying，交回重试控制器重新处置
    async fn settle_job(&self, job_id: Option<&str>, target: &PortalTarget, error: ClassifiedError) {
        let Some(id) = job_id else {
            return;
        };
        let job = match self.store.get_failed_job(id).await {
            Ok(Some(job)) if job.status == FailedJobStatus::Retrying => job,
            Ok(_) => return,
            Err(e) => {
                tracing::warn!(job_id = %id, "failed to load retried job: {}", e);
                return;
            }
        };
        let mut ctx = FailureContext::new(&target.organization_id, &target.payer_id, error);
        ctx.job_id = Some(job.id.clone());
        ctx.workflow_run_id = job.workflow_run_id.clone();
        ctx.payload = job.payload;
        if let Err(e) = self.retry.handle_failure(ctx).await {
            tracing::warn!(job_id = %id, "failed to settle retried job: {}", e);
        }
    }

    async fn clear_job(&self, job_id: Option<&str>) {
        if let Some(id) = job_id {
            if let Err(e) = self.retry.record_success(id).await {
                tracing::warn!(job_id = %id, "failed to clear retried job: {}", e);
            }
        }
    }

    // ----- 人工介入回写 -----

    /// 处理人完成工单：短信验证码交给 OTP 流程，确认号写回执行记录，
    /// FixedError 会把关联的失败任务重新排期。已关闭的工单不产生任何副作用
    pub async fn complete_intervention(
        &self,
        ticket_id: &str,
        resolution: Resolution,
    ) -> PortalResult<InterventionTicket> {
        let ticket = self
            .interventions
            .get(ticket_id)
            .await?
            .ok_or_else(|| PortalError::InterventionNotFound(ticket_id.to_string()))?;
        InterventionService::ensure_resolvable(&ticket, resolution.resolution_type)?;

        if resolution.resolution_type == ResolutionType::ProvidedCode
            && ticket.kind == InterventionKind::SmsCodeNeeded
        {
            let code = resolution
                .data
                .get("code")
                .and_then(|v| v.as_str())
                .ok_or_else(|| PortalError::Validation("resolution is missing the sms code".to_string()))?;
            let attempt_id = ticket
                .context
                .get("otp_attempt_id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| PortalError::Validation("ticket has no otp attempt".to_string()))?;
            self.otp
                .record_manual_entry(attempt_id, code, &resolution.resolved_by)
                .await?;
        }

        let confirmation = resolution
            .data
            .get("confirmation_number")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let reschedule = resolution.resolution_type == ResolutionType::FixedError;
        let resolved = self.interventions.resolve(ticket_id, resolution).await?;

        if let (Some(run_id), Some(value)) = (resolved.workflow_run_id.as_deref(), confirmation) {
            if let Some(mut run) = self.store.get_run(run_id).await? {
                run.confirmation = Some(ConfirmationNumber::Scraped(value));
                self.store.update_run(&run).await?;
            }
        }
        if reschedule {
            if let Some(job_id) = resolved.context.get("failed_job_id").and_then(|v| v.as_str()) {
                self.reschedule_job(job_id).await?;
            }
        }
        Ok(resolved)
    }

    async fn reschedule_job(&self, job_id: &str) -> PortalResult<()> {
        let Some(mut job) = self.store.get_failed_job(job_id).await? else {
            return Ok(());
        };
        let now = self.clock.now_ms();
        job.status = FailedJobStatus::Scheduled;
        job.next_retry_at = Some(now);
        job.intervention_id = None;
        job.updated_at = now;
        self.store.update_failed_job(&job).await?;
        tracing::info!(job_id = %job_id, "failed job rescheduled after fix");
        Ok(())
    }

    // ----- 失败任务重跑 -----

    /// 重跑到期的失败任务，返回处理的数量
    pub async fn retry_due_jobs(&self) -> PortalResult<usize> {
        let mut processed = 0;
        for job in self.retry.due_jobs().await? {
            if !self.retry.mark_retrying(&job.id).await? {
                continue;
            }
            processed += 1;
            let payload: JobPayload = match serde_json::from_value(job.payload.clone()) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(job_id = %job.id, "unreadable job payload: {}", e);
                    let error = ClassifiedError::new(
                        "INVALID_PAYLOAD",
                        ErrorCategory::FormFilling,
                        format!("job payload could not be decoded: {}", e),
                    )
                    .with_retryable(false);
                    let mut ctx = FailureContext::new(&job.organization_id, &job.payer_id, error);
                    ctx.job_id = Some(job.id.clone());
                    ctx.workflow_run_id = job.workflow_run_id.clone();
                    self.retry.handle_failure(ctx).await?;
                    continue;
                }
            };
            tracing::info!(job_id = %job.id, retry_count = job.retry_count, "retrying failed job");
            let job_id = Some(job.id.clone());
            match payload {
                JobPayload::Submit(request) => {
                    self.submit_job(request, job_id).await;
                }
                JobPayload::CheckStatus(request) => {
                    self.check_status_job(request, job_id).await;
                }
                JobPayload::UploadDocuments(request) => {
                    self.upload_job(request, job_id).await;
                }
            }
        }
        Ok(processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::plan;
    use crate::browser::{Reaction, ScriptedBrowser, ScriptedBrowserFactory};
    use crate::config::AppConfig;
    use crate::core::ManualClock;
    use crate::intervention::LogNotifier;
    use crate::orchestrator::{ClinicalInfo, PatientInfo, ProviderInfo};
    use crate::runtime::{Runtime, RuntimeBuilder};
    use crate::session::StaticCredentialProvider;
    use crate::store::{FailedJobRecord, FailedJobStatus, MemoryStore, OtpStatus, TicketStatus};

    const OTP_PHONE: &str = "+15551234567";

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.lock.poll_interval_ms = 10;
        config.session.marker_poll_ms = 5;
        config.session.auth_timeout_secs = 1;
        config.otp.poll_interval_ms = 10;
        config.retry.step_retry_delay_ms = 0;
        config.retry.jitter_ratio = 0.0;
        config.portals = vec![
            PortalProfile::new("anthem", "Anthem")
                .with_login_url("https://anthem.test/login")
                .with_url("prior-auth", "https://anthem.test/pa/new")
                .with_url("status", "https://anthem.test/pa/status")
                .with_otp_phone(OTP_PHONE),
            PortalProfile {
                supports_submission: false,
                supports_status_check: false,
                ..PortalProfile::new("faxonly", "Fax Only Health")
            },
        ];
        config
    }

    fn runtime(browser: ScriptedBrowser) -> Runtime {
        RuntimeBuilder::new(config())
            .with_store(Arc::new(MemoryStore::new()))
            .with_clock(Arc::new(ManualClock::new(1_000_000)))
            .with_browsers(Arc::new(ScriptedBrowserFactory::new(browser)))
            .with_credentials(Arc::new(StaticCredentialProvider::new().with("main", "clinic", "s3cret")))
            .with_notifier(Arc::new(LogNotifier))
            .build()
            .unwrap()
    }

    /// 直接登录成功、状态页可查询的门户
    fn status_portal(status_text: &str) -> ScriptedBrowser {
        ScriptedBrowser::new()
            .with_present("[name=\"username\"]")
            .with_present("[name=\"password\"]")
            .with_present("[type=\"submit\"]")
            .on_click("[type=\"submit\"]", vec![Reaction::Show(".dashboard".into())])
            .with_present(plan::SEARCH_INPUT)
            .with_present(plan::SEARCH_BUTTON)
            .on_click(
                plan::SEARCH_BUTTON,
                vec![Reaction::SetText {
                    selector: ".pa-status".into(),
                    text: status_text.into(),
                }],
            )
    }

    fn submission(payer: &str) -> SubmissionRequest {
        SubmissionRequest {
            target: PortalTarget::new("org", payer, "main"),
            prior_auth_id: "pa_1".into(),
            patient: PatientInfo {
                name: "Ada Lovelace".into(),
                date_of_birth: "1815-12-10".into(),
                member_id: "M123".into(),
                phone: None,
            },
            provider: ProviderInfo {
                name: "Dr. Babbage".into(),
                npi: "1234567890".into(),
                ..Default::default()
            },
            clinical: ClinicalInfo {
                diagnosis_code: "M54.5".into(),
                procedure_code: "72148".into(),
                rationale: None,
            },
            documents: vec![],
            existing_confirmation: None,
        }
    }

    #[tokio::test]
    async fn test_unknown_payer_uses_generic_portal() {
        let rt = runtime(ScriptedBrowser::new());
        let portal = rt.orchestrator.portal("cigna");
        assert_eq!(portal.url("prior-auth"), "https://provider-portal.com/prior-auth");
        assert_eq!(rt.orchestrator.portal("anthem").display_name(), "Anthem");
    }

    #[tokio::test]
    async fn test_unsupported_payer_fails_without_browser() {
        let browser = ScriptedBrowser::new();
        let rt = runtime(browser.clone());
        let result = rt.orchestrator.submit(submission("faxonly")).await;
        assert_eq!(result.status, OrchestrationStatus::Failed);
        assert!(result.error.unwrap().contains("Fax Only Health"));
        assert_eq!(result.next_steps, owned(UNSUPPORTED_NEXT_STEPS));
        assert!(browser.actions().is_empty());

        let status = rt
            .orchestrator
            .check_status(StatusRequest {
                target: PortalTarget::new("org", "faxonly", "main"),
                prior_auth_id: "pa_1".into(),
                reference_number: "PA-1".into(),
            })
            .await;
        assert_eq!(status.outcome, OrchestrationStatus::Failed);
        assert_eq!(status.next_steps, owned(STATUS_UNSUPPORTED_NEXT_STEPS));
    }

    #[tokio::test]
    async fn test_invalid_request_is_rejected_before_login() {
        let browser = ScriptedBrowser::new();
        let rt = runtime(browser.clone());
        let mut request = submission("anthem");
        request.documents = vec!["notes.pdf".into(), "run.bat".into()];
        let result = rt.orchestrator.submit(request).await;
        assert_eq!(result.status, OrchestrationStatus::Failed);
        assert!(result.error.unwrap().contains("run.bat"));
        assert!(result.run_id.is_none());
        assert!(browser.actions().is_empty());
    }

    #[tokio::test]
    async fn test_upload_without_documents_is_rejected() {
        let rt = runtime(ScriptedBrowser::new());
        let result = rt
            .orchestrator
            .upload_documents(UploadRequest {
                target: PortalTarget::new("org", "anthem", "main"),
                prior_auth_id: "pa_1".into(),
                reference_number: "PA-1".into(),
                documents: vec![" ".into()],
            })
            .await;
        assert_eq!(result.status, OrchestrationStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("No documents to upload"));
    }

    #[tokio::test]
    async fn test_status_check_normalizes_portal_status() {
        let rt = runtime(status_portal("Pending Clinical Review"));
        let result = rt
            .orchestrator
            .check_status(StatusRequest {
                target: PortalTarget::new("org", "anthem", "main"),
                prior_auth_id: "pa_1".into(),
                reference_number: "PA-1".into(),
            })
            .await;
        assert_eq!(result.outcome, OrchestrationStatus::Completed);
        assert_eq!(result.portal_status, PortalStatus::Pending);
        assert_eq!(result.extracted["status"], "Pending Clinical Review");
        assert_eq!(result.next_steps, PortalStatus::Pending.next_steps());

        let run = rt.store.get_run(&result.run_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.kind, RunKind::StatusCheck);
        assert_eq!(run.steps.len(), 3);
    }

    #[tokio::test]
    async fn test_provided_code_resolution_feeds_otp_attempt() {
        let rt = runtime(ScriptedBrowser::new());
        let attempt_id = rt
            .otp
            .start_capture(OTP_PHONE, crate::session::OTP_PURPOSE, Some("ses_1"))
            .await
            .unwrap();
        let ticket = rt
            .interventions
            .create(
                InterventionRequest::new(
                    InterventionKind::SmsCodeNeeded,
                    "org",
                    "SMS code needed for Anthem",
                    "code not received",
                )
                .with_context(serde_json::json!({ "otp_attempt_id": attempt_id })),
            )
            .await
            .unwrap();

        let resolved = rt
            .orchestrator
            .complete_intervention(
                &ticket.id,
                Resolution::new(ResolutionType::ProvidedCode, "nurse@clinic")
                    .with_data(serde_json::json!({ "code": "482913" })),
            )
            .await
            .unwrap();
        assert_eq!(resolved.status, TicketStatus::Resolved);

        let attempt = rt.store.get_otp_attempt(&attempt_id).await.unwrap().unwrap();
        assert_eq!(attempt.status, OtpStatus::OtpReceived);
        assert_eq!(attempt.entered_by.as_deref(), Some("nurse@clinic"));
        assert_eq!(rt.otp.take_code(&attempt_id).await.unwrap(), "482913");
    }

    #[tokio::test]
    async fn test_provided_code_without_code_is_rejected() {
        let rt = runtime(ScriptedBrowser::new());
        let ticket = rt
            .interventions
            .create(
                InterventionRequest::new(InterventionKind::SmsCodeNeeded, "org", "SMS", "no code")
                    .with_context(serde_json::json!({ "otp_attempt_id": "otp_x" })),
            )
            .await
            .unwrap();
        let err = rt
            .orchestrator
            .complete_intervention(&ticket.id, Resolution::new(ResolutionType::ProvidedCode, "ops"))
            .await
            .unwrap_err();
        assert!(matches!(err, PortalError::Validation(_)));
        let ticket = rt.interventions.get(&ticket.id).await.unwrap().unwrap();
        assert!(ticket.status.is_open());
    }

    #[tokio::test]
    async fn test_fixed_error_reschedules_failed_job_and_records_confirmation() {
        let rt = runtime(ScriptedBrowser::new());
        let now = rt.clock.now_ms();
        let mut run = WorkflowRun::new(RunKind::Submission, "org", "anthem", "pa_1", now);
        run.set_status(RunStatus::WaitingHuman, now);
        rt.store.insert_run(&run).await.unwrap();

        let mut job = FailedJobRecord::new("org", "anthem", serde_json::json!({}), 3, now);
        job.status = FailedJobStatus::Escalated;
        rt.store.insert_failed_job(&job).await.unwrap();

        let ticket = rt
            .interventions
            .create(
                InterventionRequest::new(InterventionKind::PortalError, "org", "portal_error", "boom")
                    .with_run(Some(run.id.clone()))
                    .with_context(serde_json::json!({ "failed_job_id": job.id })),
            )
            .await
            .unwrap();

        rt.orchestrator
            .complete_intervention(
                &ticket.id,
                Resolution::new(ResolutionType::FixedError, "ops")
                    .with_data(serde_json::json!({ "confirmation_number": "PA-777" })),
            )
            .await
            .unwrap();

        let job = rt.store.get_failed_job(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, FailedJobStatus::Scheduled);
        assert_eq!(job.next_retry_at, Some(now));

        let run = rt.store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(run.confirmation, Some(ConfirmationNumber::Scraped("PA-777".into())));
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_fixed_error_on_closed_ticket_leaves_job_escalated() {
        let rt = runtime(ScriptedBrowser::new());
        let now = rt.clock.now_ms();
        let mut job = FailedJobRecord::new("org", "anthem", serde_json::json!({}), 3, now);
        job.status = FailedJobStatus::Escalated;
        rt.store.insert_failed_job(&job).await.unwrap();
        let ticket = rt
            .interventions
            .create(
                InterventionRequest::new(InterventionKind::PortalError, "org", "portal_error", "boom")
                    .with_context(serde_json::json!({ "failed_job_id": job.id })),
            )
            .await
            .unwrap();

        rt.orchestrator
            .complete_intervention(&ticket.id, Resolution::new(ResolutionType::CompletedManually, "ops"))
            .await
            .unwrap();
        let err = rt
            .orchestrator
            .complete_intervention(
                &ticket.id,
                Resolution::new(ResolutionType::FixedError, "ops")
                    .with_data(serde_json::json!({ "confirmation_number": "PA-999" })),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PortalError::InvalidTransition { .. }));

        let job = rt.store.get_failed_job(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, FailedJobStatus::Escalated);
        assert!(job.next_retry_at.is_none());
        assert_eq!(rt.orchestrator.retry_due_jobs().await.unwrap(), 0);
        let ticket = rt.interventions.get(&ticket.id).await.unwrap().unwrap();
        assert_eq!(ticket.resolution.unwrap().resolution_type, ResolutionType::CompletedManually);
    }

    #[tokio::test]
    async fn test_retried_run_links_back_to_the_resolved_run() {
        let rt = runtime(status_portal("Approved"));
        let now = rt.clock.now_ms();
        let request = StatusRequest {
            target: PortalTarget::new("org", "anthem", "main"),
            prior_auth_id: "pa_1".into(),
            reference_number: "PA-1".into(),
        };
        let mut first = WorkflowRun::new(RunKind::StatusCheck, "org", "anthem", "pa_1", now);
        first.set_status(RunStatus::WaitingHuman, now);
        rt.store.insert_run(&first).await.unwrap();

        let payload = serde_json::to_value(JobPayload::CheckStatus(request)).unwrap();
        let mut job = FailedJobRecord::new("org", "anthem", payload, 3, now);
        job.status = FailedJobStatus::Escalated;
        job.workflow_run_id = Some(first.id.clone());
        rt.store.insert_failed_job(&job).await.unwrap();
        let ticket = rt
            .interventions
            .create(
                InterventionRequest::new(InterventionKind::PortalError, "org", "portal_error", "boom")
                    .with_run(Some(first.id.clone()))
                    .with_context(serde_json::json!({ "failed_job_id": job.id })),
            )
            .await
            .unwrap();
        rt.orchestrator
            .complete_intervention(&ticket.id, Resolution::new(ResolutionType::FixedError, "ops"))
            .await
            .unwrap();

        assert_eq!(rt.orchestrator.retry_due_jobs().await.unwrap(), 1);
        let first = rt.store.get_run(&first.id).await.unwrap().unwrap();
        assert_eq!(first.status, RunStatus::Failed);
        let retried = rt
            .store
            .get_run(first.retried_by.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retried.retry_of.as_deref(), Some(first.id.as_str()));
        assert_eq!(retried.failed_job_id.as_deref(), Some(job.id.as_str()));
        assert_eq!(retried.status, RunStatus::Completed);
        assert!(rt.store.get_failed_job(&job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retried_job_attaches_to_manual_review_when_circuit_is_open() {
        let browser = ScriptedBrowser::new();
        let rt = runtime(browser.clone());
        let now = rt.clock.now_ms();
        let payload = serde_json::to_value(JobPayload::Submit(submission("anthem"))).unwrap();
        let mut job = FailedJobRecord::new("org", "anthem", payload, 3, now);
        job.next_retry_at = Some(now);
        rt.store.insert_failed_job(&job).await.unwrap();

        let bot = ClassifiedError::new("BOT_DETECTED", ErrorCategory::BotDetection, "captcha shown");
        rt.retry
            .handle_failure(FailureContext::new("org", "anthem", bot))
            .await
            .unwrap();
        assert!(rt.retry.is_circuit_open("anthem").await);

        assert_eq!(rt.orchestrator.retry_due_jobs().await.unwrap(), 1);
        let job = rt.store.get_failed_job(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, FailedJobStatus::Escalated);
        let ticket = rt
            .interventions
            .get(job.intervention_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ticket.kind, InterventionKind::ManualReview);
        assert_eq!(ticket.context["failed_job_id"], job.id.as_str());
        assert!(browser.actions().is_empty());
        assert_eq!(rt.orchestrator.retry_due_jobs().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_retried_job_escalates_when_operation_is_no_longer_supported() {
        let browser = ScriptedBrowser::new();
        let rt = runtime(browser.clone());
        let now = rt.clock.now_ms();
        let payload = serde_json::to_value(JobPayload::Submit(submission("faxonly"))).unwrap();
        let mut job = FailedJobRecord::new("org", "faxonly", payload, 3, now);
        job.next_retry_at = Some(now);
        rt.store.insert_failed_job(&job).await.unwrap();

        assert_eq!(rt.orchestrator.retry_due_jobs().await.unwrap(), 1);
        let job = rt.store.get_failed_job(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, FailedJobStatus::Escalated);
        let ticket = rt
            .interventions
            .get(job.intervention_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ticket.context["error_code"], "UNSUPPORTED_OPERATION");
        assert!(browser.actions().is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_job_payload_escalates() {
        let rt = runtime(ScriptedBrowser::new());
        let now = rt.clock.now_ms();
        let mut job = FailedJobRecord::new(
            "org",
            "anthem",
            serde_json::json!({ "operation": "teleport" }),
            3,
            now,
        );
        job.status = FailedJobStatus::Scheduled;
        job.next_retry_at = Some(now);
        rt.store.insert_failed_job(&job).await.unwrap();

        assert_eq!(rt.orchestrator.retry_due_jobs().await.unwrap(), 1);
        let job = rt.store.get_failed_job(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, FailedJobStatus::Escalated);
        assert!(job.intervention_id.is_some());
        assert_eq!(rt.orchestrator.retry_due_jobs().await.unwrap(), 0);
    }
}
