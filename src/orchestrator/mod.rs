//! 编排层：对外的提交 / 状态查询 / 附件上传入口
//!
//! - **request**: 请求、结果与失败任务快照
//! - **confirmation**: 确认号（抓取 / 合成）
//! - **service**: Orchestrator，串起会话、执行器、重试与人工介入

pub mod confirmation;
pub mod request;
pub mod service;

pub use confirmation::{ConfirmationNumber, CONFIRMATION_KEYS};
pub use request::{
    validate_documents, ClinicalInfo, JobPayload, OrchestrationResult, OrchestrationStatus,
    PatientInfo, PortalStatus, PortalTarget, ProviderInfo, StatusRequest, StatusResult,
    SubmissionRequest, UploadRequest,
};
pub use service::Orchestrator;
