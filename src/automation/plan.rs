//! 自动化计划构建：提交 / 状态查询 / 补充附件

use crate::browser::WaitTarget;
use crate::config::PortalProfile;
use crate::orchestrator::{StatusRequest, SubmissionRequest, UploadRequest};

use super::step::{AutomationStep, ExtractField, FieldFill};

pub const NEW_REQUEST_BUTTON: &str =
    "#new-prior-auth, button.new-prior-auth, [data-action=\"new-request\"]";
pub const PATIENT_NAME: &str = "[name=\"patientName\"], #patient-name";
pub const PATIENT_DOB: &str = "[name=\"patientDob\"], #patient-dob";
pub const MEMBER_ID: &str = "[name=\"memberId\"], #member-id";
pub const PATIENT_PHONE: &str = "[name=\"patientPhone\"], #patient-phone";
pub const PROVIDER_NAME: &str = "[name=\"providerName\"], #provider-name";
pub const PROVIDER_NPI: &str = "[name=\"providerNpi\"], #provider-npi";
pub const PROVIDER_PHONE: &str = "[name=\"providerPhone\"], #provider-phone";
pub const PROVIDER_FAX: &str = "[name=\"providerFax\"], #provider-fax";
pub const DIAGNOSIS_CODE: &str = "[name=\"diagnosisCode\"], #diagnosis-code";
pub const PROCEDURE_CODE: &str = "[name=\"procedureCode\"], #procedure-code";
pub const CLINICAL_NOTES: &str = "[name=\"clinicalNotes\"], #clinical-notes";
pub const FILE_INPUT: &str = "input[type=\"file\"], [accept*=\"pdf\"], .file-upload";
pub const SUBMIT_BUTTON: &str = "#submit-request, button.submit-request, [data-action=\"submit\"]";
pub const SEARCH_INPUT: &str = "[name=\"referenceNumber\"], #reference-search";
pub const SEARCH_BUTTON: &str = "#search-button, button.search, [data-action=\"search\"]";
pub const SAVE_BUTTON: &str = "#save-documents, button.save, [data-action=\"save\"]";
pub const UPLOAD_DONE_TEXT: &str = "uploaded successfully";

const CONFIRMATION_SELECTORS: &[&str] = &[
    "[data-testid=\"confirmation-number\"]",
    ".confirmation-number",
    "#confirmation-id",
    ".reference-number",
    ".tracking-number",
    ".submission-id",
    ".confirmation-code",
];

const LABELLED_CODE: &str =
    r"(?i)(?:confirmation|reference|tracking|submission)\s*(?:number|id|code)\s*:?\s*([A-Z0-9\-]+)";

/// 按门户配置构建计划；documents 应已去重
#[derive(Debug, Clone)]
pub struct PlanBuilder<'a> {
    portal: &'a PortalProfile,
}

impl<'a> PlanBuilder<'a> {
    pub fn new(portal: &'a PortalProfile) -> Self {
        Self { portal }
    }

    pub fn submission(&self, request: &SubmissionRequest, documents: &[String]) -> Vec<AutomationStep> {
        let patient = &request.patient;
        let provider = &request.provider;
        let clinical = &request.clinical;

        let mut patient_fills = vec![
            FieldFill::new(PATIENT_NAME, patient.name.as_str()),
            FieldFill::new(PATIENT_DOB, patient.date_of_birth.as_str()),
            FieldFill::new(MEMBER_ID, patient.member_id.as_str()),
        ];
        if let Some(phone) = &patient.phone {
            patient_fills.push(FieldFill::new(PATIENT_PHONE, phone.as_str()));
        }

        let mut provider_fills = vec![
            FieldFill::new(PROVIDER_NAME, provider.name.as_str()),
            FieldFill::new(PROVIDER_NPI, provider.npi.as_str()),
        ];
        if let Some(phone) = &provider.phone {
            provider_fills.push(FieldFill::new(PROVIDER_PHONE, phone.as_str()));
        }
        if let Some(fax) = &provider.fax {
            provider_fills.push(FieldFill::new(PROVIDER_FAX, fax.as_str()));
        }

        let mut clinical_fills = vec![
            FieldFill::new(DIAGNOSIS_CODE, clinical.diagnosis_code.as_str()),
            FieldFill::new(PROCEDURE_CODE, clinical.procedure_code.as_str()),
        ];
        if let Some(notes) = &clinical.rationale {
            clinical_fills.push(FieldFill::new(CLINICAL_NOTES, notes.as_str()));
        }

        let mut steps = vec![
            AutomationStep::navigate("Navigate to Prior Auth Portal", self.portal.url("prior-auth")),
            AutomationStep::act(
                "Start New Prior Auth Request",
                "Open a new prior authorization request",
                vec![],
                Some(NEW_REQUEST_BUTTON),
            )
            .with_retries(2),
            AutomationStep::act(
                "Fill Patient Demographics",
                "Fill out the patient information form",
                patient_fills,
                None,
            )
            .retryable(),
            AutomationStep::act(
                "Fill Provider Information",
                "Fill out the provider information",
                provider_fills,
                None,
            )
            .retryable(),
            AutomationStep::act(
                "Fill Clinical Information",
                "Fill out the clinical details",
                clinical_fills,
                None,
            )
            .retryable(),
        ];

        for (i, path) in documents.iter().enumerate() {
            steps.push(
                AutomationStep::upload(
                    &format!("Upload Document {}", i + 1),
                    FILE_INPUT,
                    path,
                    Some(WaitTarget::Text(UPLOAD_DONE_TEXT.to_string())),
                )
                .retryable(),
            );
        }

        // 提交不可重试：重复点击可能产生重复申请
        steps.push(AutomationStep::act(
            "Review and Submit",
            "Review all entered information and submit the request",
            vec![],
            Some(SUBMIT_BUTTON),
        ));
        steps.push(AutomationStep::extract(
            "Extract Confirmation Details",
            vec![
                ExtractField::new("confirmation_number", CONFIRMATION_SELECTORS)
                    .with_patterns(&[LABELLED_CODE, r"([A-Z0-9]{6,})", r"(\d{10,})"]),
                ExtractField::new("page_confirmation", &[]).with_patterns(&[
                    LABELLED_CODE,
                    r"(?i)successfully\s+submitted.*?([A-Z0-9]{6,})",
                    r"(?i)request\s+id\s*:?\s*([A-Z0-9\-]+)",
                ]),
                ExtractField::new("submission_status", &[".submission-status", ".status"]),
            ],
        ));
        steps
    }

    pub fn status_check(&self, request: &StatusRequest) -> Vec<AutomationStep> {
        vec![
            AutomationStep::navigate("Navigate to Status Check Page", self.portal.url("status")),
            AutomationStep::act(
                "Search for Prior Auth",
                "Search for the prior authorization by reference number",
                vec![FieldFill::new(SEARCH_INPUT, request.reference_number.as_str())],
                Some(SEARCH_BUTTON),
            )
            .retryable(),
            AutomationStep::extract(
                "Extract Status Information",
                vec![
                    ExtractField::new("status", &[".pa-status", ".status", "[data-field=\"status\"]"])
                        .required(),
                    ExtractField::new("decision", &[".decision", "[data-field=\"decision\"]"]),
                    ExtractField::new("decision_date", &[".decision-date", "[data-field=\"decision-date\"]"]),
                    ExtractField::new("notes", &[".notes", "[data-field=\"notes\"]"]),
                ],
            ),
        ]
    }

    pub fn document_upload(&self, request: &UploadRequest, documents: &[String]) -> Vec<AutomationStep> {
        let mut steps = vec![
            AutomationStep::navigate("Navigate to Prior Auth Portal", self.portal.url("prior-auth")),
            AutomationStep::act(
                "Find Existing Prior Auth",
                "Search for and open the existing prior authorization",
                vec![FieldFill::new(SEARCH_INPUT, request.reference_number.as_str())],
                Some(SEARCH_BUTTON),
            )
            .retryable(),
        ];
        for (i, path) in documents.iter().enumerate() {
            steps.push(
                AutomationStep::upload(
                    &format!("Upload Additional Document {}", i + 1),
                    FILE_INPUT,
                    path,
                    Some(WaitTarget::Text(UPLOAD_DONE_TEXT.to_string())),
                )
                .retryable(),
            );
        }
        steps.push(
            AutomationStep::act(
                "Save Document Upload",
                "Save the uploaded documents",
                vec![],
                Some(SAVE_BUTTON),
            )
            .retryable(),
        );
        steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::{StepAction, StepKind};
    use crate::orchestrator::{ClinicalInfo, PatientInfo, PortalTarget, ProviderInfo};

    fn submission() -> SubmissionRequest {
        SubmissionRequest {
            target: PortalTarget::new("org", "anthem", "main"),
            prior_auth_id: "pa_1".into(),
            patient: PatientInfo {
                name: "Ada Lovelace".into(),
                date_of_birth: "1815-12-10".into(),
                member_id: "M123".into(),
                phone: Some("5551234567".into()),
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

    #[test]
    fn test_submission_plan_without_documents_has_seven_steps() {
        let portal = PortalProfile::new("anthem", "Anthem").with_url("prior-auth", "https://a.test/pa/new");
        let plan = PlanBuilder::new(&portal).submission(&submission(), &[]);
        let names: Vec<_> = plan.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "Navigate to Prior Auth Portal",
                "Start New Prior Auth Request",
                "Fill Patient Demographics",
                "Fill Provider Information",
                "Fill Clinical Information",
                "Review and Submit",
                "Extract Confirmation Details",
            ]
        );
        assert_eq!(
            plan[0].action,
            StepAction::Navigate {
                url: "https://a.test/pa/new".into()
            }
        );
        assert_eq!(plan[1].max_retries, 2);
        assert!(!plan[5].retryable);
        assert_eq!(plan[6].kind(), StepKind::Extract);
    }

    #[test]
    fn test_document_steps_inserted_before_submit() {
        let portal = PortalProfile::new("unknown", "");
        let docs = vec!["a.pdf".to_string(), "b.pdf".to_string()];
        let plan = PlanBuilder::new(&portal).submission(&submission(), &docs);
        assert_eq!(plan.len(), 9);
        assert_eq!(plan[5].name, "Upload Document 1");
        assert_eq!(plan[6].name, "Upload Document 2");
        assert_eq!(plan[7].name, "Review and Submit");
        assert_eq!(
            plan[0].action,
            StepAction::Navigate {
                url: "https://provider-portal.com/prior-auth".into()
            }
        );
    }

    #[test]
    fn test_upload_plan_shape() {
        let portal = PortalProfile::new("anthem", "Anthem");
        let request = UploadRequest {
            target: PortalTarget::new("org", "anthem", "main"),
            prior_auth_id: "pa_1".into(),
            reference_number: "PA-1".into(),
            documents: vec!["x.pdf".into()],
        };
        let plan = PlanBuilder::new(&portal).document_upload(&request, &request.documents);
        let names: Vec<_> = plan.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "Navigate to Prior Auth Portal",
                "Find Existing Prior Auth",
                "Upload Additional Document 1",
                "Save Document Upload",
            ]
        );
    }
}
