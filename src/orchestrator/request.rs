//! 编排请求与结果
//!
//! 请求可序列化：失败任务以请求快照作为 payload，重跑时原样反序列化。

use serde::{Deserialize, Serialize};

use super::confirmation::ConfirmationNumber;
use crate::core::{PortalError, PortalResult};
use crate::store::ExtractedData;

const SUSPICIOUS_EXTENSIONS: &[&str] = &[".exe", ".bat", ".cmd", ".com", ".scr", ".vbs", ".js"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatientInfo {
    pub name: String,
    pub date_of_birth: String,
    pub member_id: String,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub name: String,
    pub npi: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub fax: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClinicalInfo {
    pub diagnosis_code: String,
    pub procedure_code: String,
    #[serde(default)]
    pub rationale: Option<String>,
}

/// 门户会话定位：(organization, payer) + 凭据引用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortalTarget {
    pub organization_id: String,
    pub payer_id: String,
    pub credential_ref: String,
}

impl PortalTarget {
    pub fn new(
        organization_id: impl Into<String>,
        payer_id: impl Into<String>,
        credential_ref: impl Into<String>,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            payer_id: payer_id.into(),
            credential_ref: credential_ref.into(),
        }
    }
}

/// 新的事前授权提交
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRequest {
    pub target: PortalTarget,
    pub prior_auth_id: String,
    pub patient: PatientInfo,
    pub provider: ProviderInfo,
    pub clinical: ClinicalInfo,
    #[serde(default)]
    pub documents: Vec<String>,
    /// 已提交过时携带的确认号
    #[serde(default)]
    pub existing_confirmation: Option<String>,
}

impl SubmissionRequest {
    /// 校验必填字段与附件；附件去重后返回
    pub fn validate(&self) -> PortalResult<Vec<String>> {
        if self.prior_auth_id.trim().is_empty() || self.target.organization_id.trim().is_empty() {
            return Err(PortalError::Validation(
                "Missing required fields: prior_auth_id and organization_id".to_string(),
            ));
        }
        if self.existing_confirmation.is_some() {
            return Err(PortalError::Validation(
                "Prior authorization already submitted".to_string(),
            ));
        }
        if self.patient.name.trim().is_empty() || self.provider.npi.trim().is_empty() {
            return Err(PortalError::Validation(
                "Prior authorization missing required patient or provider information".to_string(),
            ));
        }
        validate_documents(&self.documents)
    }
}

/// 状态查询
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRequest {
    pub target: PortalTarget,
    pub prior_auth_id: String,
    /// 门户侧的参考号 / 确认号
    pub reference_number: String,
}

/// 补充附件上传
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRequest {
    pub target: PortalTarget,
    pub prior_auth_id: String,
    pub reference_number: String,
    pub documents: Vec<String>,
}

/// 失败任务中保存的请求快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum JobPayload {
    Submit(SubmissionRequest),
    CheckStatus(StatusRequest),
    UploadDocuments(UploadRequest),
}

/// 去重并拒绝可疑扩展名
pub fn validate_documents(documents: &[String]) -> PortalResult<Vec<String>> {
    let mut accepted: Vec<String> = Vec::with_capacity(documents.len());
    for doc in documents {
        let doc = doc.trim();
        if doc.is_empty() {
            continue;
        }
        let lower = doc.to_lowercase();
        if SUSPICIOUS_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
            tracing::warn!(document = %doc, "suspicious document extension rejected");
            return Err(PortalError::Validation(format!(
                "Document rejected by extension check: {}",
                doc
            )));
        }
        if !accepted.iter().any(|d| d == doc) {
            accepted.push(doc.to_string());
        }
    }
    Ok(accepted)
}

/// 面向调用方的结果状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationStatus {
    Submitted,
    /// 状态查询 / 附件上传完成
    Completed,
    Pending,
    /// 已排期自动重试
    RetryScheduled,
    RequiresIntervention,
    Failed,
}

/// 门户上的授权状态（归一化）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortalStatus {
    Approved,
    Denied,
    Pending,
    RequiresAdditionalInfo,
    Unknown,
}

impl PortalStatus {
    pub fn normalize(raw: &str) -> Self {
        let s = raw.trim().to_lowercase().replace(|c: char| c == ' ' || c == '-', "_");
        if s.is_empty() {
            return Self::Unknown;
        }
        if s.contains("approved") || s.contains("certified") {
            Self::Approved
        } else if s.contains("denied") || s.contains("rejected") {
            Self::Denied
        } else if s.contains("additional") || s.contains("more_info") || s.contains("pended_for_info") {
            Self::RequiresAdditionalInfo
        } else if s.contains("pending") || s.contains("review") || s.contains("received") {
            Self::Pending
        } else {
            Self::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Pending => "pending",
            Self::RequiresAdditionalInfo => "requires_additional_info",
            Self::Unknown => "unknown",
        }
    }

    pub fn next_steps(&self) -> Vec<String> {
        let steps: &[&str] = match self {
            Self::Approved => &[
                "Notify provider of approval",
                "Schedule approved services",
                "Update patient record",
            ],
            Self::Denied => &[
                "Review denial reason",
                "Prepare appeal if appropriate",
                "Notify provider and patient",
            ],
            Self::Pending => &[
                "Monitor for updates",
                "Check status again in 24-48 hours",
                "Follow up if no response in expected timeframe",
            ],
            Self::RequiresAdditionalInfo => &[
                "Review requested information",
                "Gather additional documentation",
                "Submit additional information",
            ],
            Self::Unknown => &["Monitor status", "Contact payer if needed", "Check again in 24 hours"],
        };
        steps.iter().map(|s| s.to_string()).collect()
    }
}

/// 提交 / 上传结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationResult {
    pub prior_auth_id: String,
    pub status: OrchestrationStatus,
    pub run_id: Option<String>,
    pub confirmation: Option<ConfirmationNumber>,
    pub requires_human_intervention: bool,
    pub intervention_id: Option<String>,
    pub failed_job_id: Option<String>,
    pub next_retry_at: Option<i64>,
    pub error: Option<String>,
    pub next_steps: Vec<String>,
}

impl OrchestrationResult {
    pub fn new(prior_auth_id: impl Into<String>, status: OrchestrationStatus) -> Self {
        Self {
            prior_auth_id: prior_auth_id.into(),
            status,
            run_id: None,
            confirmation: None,
            requires_human_intervention: false,
            intervention_id: None,
            failed_job_id: None,
            next_retry_at: None,
            error: None,
            next_steps: Vec::new(),
        }
    }

    pub fn failed(prior_auth_id: impl Into<String>, error: impl Into<String>, next_steps: &[&str]) -> Self {
        let mut result = Self::new(prior_auth_id, OrchestrationStatus::Failed);
        result.error = Some(error.into());
        result.next_steps = next_steps.iter().map(|s| s.to_string()).collect();
        result
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self.status,
            OrchestrationStatus::Submitted | OrchestrationStatus::Completed | OrchestrationStatus::Pending
        )
    }
}

/// 状态查询结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResult {
    pub prior_auth_id: String,
    pub outcome: OrchestrationStatus,
    pub portal_status: PortalStatus,
    pub extracted: ExtractedData,
    pub run_id: Option<String>,
    pub intervention_id: Option<String>,
    pub error: Option<String>,
    pub next_steps: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> SubmissionRequest {
        SubmissionRequest {
            target: PortalTarget::new("org", "anthem", "main"),
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
            documents: vec!["notes.pdf".into(), "notes.pdf".into(), " mri.pdf ".into()],
            existing_confirmation: None,
        }
    }

    #[test]
    fn test_validate_dedupes_documents() {
        assert_eq!(request().validate().unwrap(), vec!["notes.pdf", "mri.pdf"]);
    }

    #[test]
    fn test_validate_rejects_bad_requests() {
        let mut r = request();
        r.provider.npi.clear();
        assert!(r.validate().is_err());

        let mut r = request();
        r.existing_confirmation = Some("PA-1".into());
        assert!(r.validate().unwrap_err().to_string().contains("already submitted"));

        let mut r = request();
        r.documents.push("payload.EXE".into());
        assert!(r.validate().is_err());
    }

    #[test]
    fn test_status_normalization() {
        assert_eq!(PortalStatus::normalize("Approved"), PortalStatus::Approved);
        assert_eq!(PortalStatus::normalize("DENIED - not medically necessary"), PortalStatus::Denied);
        assert_eq!(PortalStatus::normalize("Pending Review"), PortalStatus::Pending);
        assert_eq!(
            PortalStatus::normalize("Requires Additional Info"),
            PortalStatus::RequiresAdditionalInfo
        );
        assert_eq!(PortalStatus::normalize("???"), PortalStatus::Unknown);
    }

    #[test]
    fn test_payload_snapshot_is_tagged() {
        let payload = serde_json::to_value(JobPayload::Submit(request())).unwrap();
        assert_eq!(payload["operation"], "submit");
        let back: JobPayload = serde_json::from_value(payload).unwrap();
        assert!(matches!(back, JobPayload::Submit(_)));
    }
}
