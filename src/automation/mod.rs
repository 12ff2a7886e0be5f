//! 步骤式门户自动化：步骤模型、执行器、计划构建

pub mod executor;
pub mod plan;
pub mod step;

pub use executor::{ExecutorSettings, NoopObserver, StepExecutor, StepObserver};
pub use plan::PlanBuilder;
pub use step::{
    interpolate, AutomationStep, ExecutionSummary, ExtractField, FieldFill, StepAction, StepFailure,
    StepKind, StepLog, StepStatus, DEFAULT_STEP_RETRIES,
};
