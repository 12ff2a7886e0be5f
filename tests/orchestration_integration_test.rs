//! 编排端到端集成测试
//!
//! 运行：cargo test --test orchestration_integration_test

use std::sync::Arc;
use std::time::Duration;

use authpilot::automation::plan;
use authpilot::browser::{Reaction, ScriptedBrowser, ScriptedBrowserFactory};
use authpilot::config::{AppConfig, PortalProfile};
use authpilot::core::{Clock, ManualClock};
use authpilot::intervention::LogNotifier;
use authpilot::orchestrator::{
    ClinicalInfo, ConfirmationNumber, OrchestrationStatus, PatientInfo, PortalStatus, PortalTarget,
    ProviderInfo, StatusRequest, SubmissionRequest,
};
use authpilot::otp::InboundSms;
use authpilot::runtime::{Runtime, RuntimeBuilder};
use authpilot::session::StaticCredentialProvider;
use authpilot::store::{
    FailedJobStatus, InterventionKind, MemoryStore, OtpFilter, OtpStatus, RecordStore, Resolution,
    ResolutionType, RunStatus, SessionStatus, TicketFilter, TicketStatus,
};

const OTP_PHONE: &str = "+15551234567";

struct Harness {
    rt: Runtime,
    clock: Arc<ManualClock>,
    factory: Arc<ScriptedBrowserFactory>,
    browser: ScriptedBrowser,
}

fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.lock.poll_interval_ms = 10;
    config.session.marker_poll_ms = 5;
    config.session.auth_timeout_secs = 2;
    config.otp.poll_interval_ms = 10;
    config.otp.wait_timeout_secs = 1;
    config.otp.manual_entry_wait_secs = 5;
    config.retry.step_retry_delay_ms = 0;
    config.retry.base_delay_ms = 1_000;
    config.retry.jitter_ratio = 0.0;
    config.retry.max_retries = 3;
    config.portals = vec![PortalProfile::new("anthem", "Anthem")
        .with_login_url("https://anthem.test/login")
        .with_url("prior-auth", "https://anthem.test/pa/new")
        .with_url("status", "https://anthem.test/pa/status")
        .with_otp_phone(OTP_PHONE)];
    config
}

fn harness(browser: ScriptedBrowser) -> Harness {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let factory = Arc::new(ScriptedBrowserFactory::new(browser.clone()));
    let rt = RuntimeBuilder::new(config())
        .with_store(Arc::new(MemoryStore::new()))
        .with_clock(clock.clone())
        .with_browsers(factory.clone())
        .with_credentials(Arc::new(
            StaticCredentialProvider::new().with("main", "clinic", "s3cret"),
        ))
        .with_notifier(Arc::new(LogNotifier))
        .build()
        .unwrap();
    Harness {
        rt,
        clock,
        factory,
        browser,
    }
}

/// 登录后要求短信验证码的门户
fn sms_login(browser: ScriptedBrowser) -> ScriptedBrowser {
    browser
        .with_present("[name=\"username\"]")
        .with_present("[name=\"password\"]")
        .with_present("[type=\"submit\"]")
        .on_click(
            "[type=\"submit\"]",
            vec![
                Reaction::Show("[name=\"code\"]".into()),
                Reaction::Show("#verify-button".into()),
            ],
        )
        .on_click(
            "#verify-button",
            vec![
                Reaction::Hide("[name=\"code\"]".into()),
                Reaction::Show(".dashboard".into()),
            ],
        )
}

/// 直接登录成功的门户
fn direct_login(browser: ScriptedBrowser) -> ScriptedBrowser {
    browser
        .with_present("[name=\"username\"]")
        .with_present("[name=\"password\"]")
        .with_present("[type=\"submit\"]")
        .on_click("[type=\"submit\"]", vec![Reaction::Show(".dashboard".into())])
}

/// 完整的申请表单页，提交后显示确认号
fn submission_form(browser: ScriptedBrowser) -> ScriptedBrowser {
    browser
        .with_present(plan::NEW_REQUEST_BUTTON)
        .with_present(plan::PATIENT_NAME)
        .with_present(plan::PATIENT_DOB)
        .with_present(plan::MEMBER_ID)
        .with_present(plan::PROVIDER_NAME)
        .with_present(plan::PROVIDER_NPI)
        .with_present(plan::DIAGNOSIS_CODE)
        .with_present(plan::PROCEDURE_CODE)
        .with_present(plan::CLINICAL_NOTES)
        .with_present(plan::SUBMIT_BUTTON)
        .on_click(
            plan::SUBMIT_BUTTON,
            vec![
                Reaction::SetText {
                    selector: ".confirmation-number".into(),
                    text: "Confirmation Number: PA20240917".into(),
                },
                Reaction::SetPageText("Your request was successfully submitted.".into()),
            ],
        )
}

fn submission() -> SubmissionRequest {
    SubmissionRequest {
        target: PortalTarget::new("org_1", "anthem", "main"),
        prior_auth_id: "pa_42".into(),
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
            rationale: Some("Persistent lumbar pain".into()),
        },
        documents: vec![],
        existing_confirmation: None,
    }
}

async fn deliver_sms_when_waiting(store: Arc<dyn RecordStore>, h: &Harness, body: &str) {
    for _ in 0..400 {
        let waiting = store
            .list_otp_attempts(&OtpFilter {
                status: Some(OtpStatus::WaitingForOtp),
                ..Default::default()
            })
            .await
            .unwrap();
        if !waiting.is_empty() {
            let sms = InboundSms {
                from_number: "+18005550100".into(),
                to_number: OTP_PHONE.into(),
                body: body.into(),
                message_id: "SM100".into(),
            };
            h.rt.otp.on_inbound_message(&sms).await.unwrap();
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("login never asked for an sms code");
}

#[tokio::test]
async fn test_submission_with_sms_login_end_to_end() {
    let h = harness(submission_form(sms_login(ScriptedBrowser::new())));
    let store = h.rt.store.clone();

    let (result, _) = tokio::join!(
        h.rt.orchestrator.submit(submission()),
        deliver_sms_when_waiting(store.clone(), &h, "Your Anthem verification code is 482913"),
    );

    assert_eq!(result.status, OrchestrationStatus::Submitted, "{:?}", result.error);
    assert_eq!(
        result.confirmation,
        Some(ConfirmationNumber::Scraped("PA20240917".into()))
    );
    assert!(!result.requires_human_intervention);
    assert_eq!(result.next_steps[0], "Monitor status automatically");

    let sessions = store.find_sessions("org_1", "anthem").await.unwrap();
    assert_eq!(sessions.len(), 1);
    let session = &sessions[0];
    assert_eq!(session.status, SessionStatus::Authenticated);
    assert!(session.lock.is_none());
    let transcript: Vec<_> = session.transcript.iter().map(|e| e.status).collect();
    assert_eq!(
        transcript,
        vec![
            SessionStatus::PendingLogin,
            SessionStatus::SmsRequired,
            SessionStatus::Authenticated
        ]
    );

    let attempts = store.list_otp_attempts(&OtpFilter::default()).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].status, OtpStatus::Verified);
    assert_eq!(h.browser.field_value("[name=\"code\"]").as_deref(), Some("482913"));

    let run = store.get_run(result.run_id.as_deref().unwrap()).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.session_id.as_deref(), Some(session.id.as_str()));
    assert_eq!(run.steps.len(), 7);
    assert_eq!(
        h.browser.field_value(plan::PATIENT_NAME).as_deref(),
        Some("Ada Lovelace")
    );
    assert!(h.browser.is_closed());
    assert!(!h.rt.locks.is_held(&session.id).await);
}

#[tokio::test]
async fn test_sms_code_entered_by_a_person_after_timeout() {
    let h = harness(submission_form(sms_login(ScriptedBrowser::new())));
    let store = h.rt.store.clone();

    let resolver = async {
        for _ in 0..600 {
            let open = store.list_tickets(&TicketFilter::open()).await.unwrap();
            if let Some(ticket) = open.iter().find(|t| t.kind == InterventionKind::SmsCodeNeeded) {
                return h
                    .rt
                    .orchestrator
                    .complete_intervention(
                        &ticket.id,
                        Resolution::new(ResolutionType::ProvidedCode, "nurse@clinic")
                            .with_data(serde_json::json!({ "code": "771204" })),
                    )
                    .await
                    .unwrap();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no sms_code_needed ticket opened");
    };

    let (result, ticket) = tokio::join!(h.rt.orchestrator.submit(submission()), resolver);

    assert_eq!(ticket.status, TicketStatus::Resolved);
    assert_eq!(result.status, OrchestrationStatus::Submitted, "{:?}", result.error);
    assert_eq!(h.browser.field_value("[name=\"code\"]").as_deref(), Some("771204"));
    let attempts = store.list_otp_attempts(&OtpFilter::default()).await.unwrap();
    assert_eq!(attempts[0].status, OtpStatus::Verified);
    assert_eq!(attempts[0].entered_by.as_deref(), Some("nurse@clinic"));
}

#[tokio::test]
async fn test_retry_backoff_then_escalation() {
    // 没有“新建申请”按钮：每次都在第二步失败
    let h = harness(direct_login(ScriptedBrowser::new()));
    let store = h.rt.store.clone();

    let first = h.rt.orchestrator.submit(submission()).await;
    assert_eq!(first.status, OrchestrationStatus::RetryScheduled);
    let job_id = first.failed_job_id.clone().unwrap();
    assert_eq!(first.next_retry_at, Some(h.clock.now_ms() + 1_000));

    // 未到期不重跑
    assert_eq!(h.rt.orchestrator.retry_due_jobs().await.unwrap(), 0);

    let mut delays = Vec::new();
    let job = store.get_failed_job(&job_id).await.unwrap().unwrap();
    delays.push(job.next_retry_at.unwrap() - h.clock.now_ms());
    for _ in 0..3 {
        let job = store.get_failed_job(&job_id).await.unwrap().unwrap();
        h.clock.set(job.next_retry_at.unwrap());
        assert_eq!(h.rt.orchestrator.retry_due_jobs().await.unwrap(), 1);
        let job = store.get_failed_job(&job_id).await.unwrap().unwrap();
        if let Some(at) = job.next_retry_at {
            delays.push(at - h.clock.now_ms());
        }
    }
    assert_eq!(delays, vec![1_000, 2_000, 4_000]);

    let job = store.get_failed_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, FailedJobStatus::Escalated);
    assert_eq!(job.retry_count, 3);
    let ticket_id = job.intervention_id.clone().unwrap();
    let ticket = h.rt.interventions.get(&ticket_id).await.unwrap().unwrap();
    assert_eq!(ticket.context["failed_job_id"], job_id.as_str());
    assert!(ticket.status.is_open());

    // 同一会话被复用，没有重复登录
    assert_eq!(store.find_sessions("org_1", "anthem").await.unwrap().len(), 1);
    assert_eq!(h.factory.open_count(), 4);
}

#[tokio::test]
async fn test_bot_detection_escalates_on_first_occurrence() {
    let browser = submission_form(direct_login(ScriptedBrowser::new()))
        .on_navigate("/pa/new", vec![Reaction::Show(".captcha".into())]);
    let h = harness(browser);

    let result = h.rt.orchestrator.submit(submission()).await;
    assert_eq!(result.status, OrchestrationStatus::RequiresIntervention);
    assert!(result.requires_human_intervention);
    let navigations = h
        .browser
        .actions()
        .iter()
        .filter(|a| a.starts_with("navigate:https://anthem.test/pa/new"))
        .count();
    assert_eq!(navigations, 1);

    let job = h
        .rt
        .store
        .get_failed_job(result.failed_job_id.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status, FailedJobStatus::Escalated);
    assert_eq!(job.retry_count, 0);
    assert!(h.rt.retry.is_circuit_open("anthem").await);

    let run = h.rt.store.get_run(result.run_id.as_deref().unwrap()).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::WaitingHuman);
    assert_eq!(run.intervention_id, result.intervention_id);

    // 熔断期间直接转人工，不再打开浏览器
    let opened = h.factory.open_count();
    let second = h.rt.orchestrator.submit(submission()).await;
    assert_eq!(second.status, OrchestrationStatus::RequiresIntervention);
    assert_eq!(h.factory.open_count(), opened);
    let ticket = h
        .rt
        .interventions
        .get(second.intervention_id.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ticket.kind, InterventionKind::ManualReview);
    assert_eq!(ticket.title, "Prior Auth Automation Failed - pa_42");
}

#[tokio::test]
async fn test_status_check_is_repeatable() {
    let browser = direct_login(ScriptedBrowser::new())
        .with_present(plan::SEARCH_INPUT)
        .with_present(plan::SEARCH_BUTTON)
        .on_click(
            plan::SEARCH_BUTTON,
            vec![
                Reaction::SetText {
                    selector: ".pa-status".into(),
                    text: "APPROVED".into(),
                },
                Reaction::SetText {
                    selector: ".decision-date".into(),
                    text: "2024-09-18".into(),
                },
            ],
        );
    let h = harness(browser);
    let request = StatusRequest {
        target: PortalTarget::new("org_1", "anthem", "main"),
        prior_auth_id: "pa_42".into(),
        reference_number: "PA20240917".into(),
    };

    let first = h.rt.orchestrator.check_status(request.clone()).await;
    let second = h.rt.orchestrator.check_status(request).await;

    for result in [&first, &second] {
        assert_eq!(result.outcome, OrchestrationStatus::Completed);
        assert_eq!(result.portal_status, PortalStatus::Approved);
        assert_eq!(result.extracted["decision_date"], "2024-09-18");
    }
    assert_eq!(first.extracted, second.extracted);
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(
        h.browser.field_value(plan::SEARCH_INPUT).as_deref(),
        Some("PA20240917")
    );
    assert!(h.rt.store.due_failed_jobs(i64::MAX).await.unwrap().is_empty());
    assert_eq!(h.rt.store.find_sessions("org_1", "anthem").await.unwrap().len(), 1);
}
