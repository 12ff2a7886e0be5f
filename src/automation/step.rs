//! 自动化步骤模型
//!
//! 计划构建完成后步骤不可变，由 StepExecutor 按顺序消费。
//! 步骤中的 URL 与填充值可以引用前序抽取结果：`{{field}}`。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::browser::WaitTarget;
use crate::core::ClassifiedError;
use crate::store::ExtractedData;

/// 可重试步骤未显式给出次数时的默认值
pub const DEFAULT_STEP_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Navigate,
    Act,
    Extract,
    Observe,
    Wait,
    Upload,
    /// 仅人工可完成，执行时直接以需人工介入失败
    Otp,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Navigate => "navigate",
            Self::Act => "act",
            Self::Extract => "extract",
            Self::Observe => "observe",
            Self::Wait => "wait",
            Self::Upload => "upload",
            Self::Otp => "otp",
        }
    }

    /// 执行后需要检查反自动化信号的步骤
    pub fn checks_for_bots(&self) -> bool {
        matches!(self, Self::Navigate | Self::Act)
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次字段填充；human 为真时逐字符输入
#[derive(Debug, Clone, PartialEq)]
pub struct FieldFill {
    pub selector: String,
    pub value: String,
    pub human: bool,
}

impl FieldFill {
    pub fn new(selector: &str, value: impl Into<String>) -> Self {
        Self {
            selector: selector.to_string(),
            value: value.into(),
            human: false,
        }
    }

    pub fn typed(mut self) -> Self {
        self.human = true;
        self
    }
}

/// 抽取字段：依次尝试选择器，selectors 为空时取整页文本；
/// patterns 非空时取第一个匹配的捕获组 1
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractField {
    pub name: String,
    pub selectors: Vec<String>,
    pub patterns: Vec<String>,
    pub required: bool,
}

impl ExtractField {
    pub fn new(name: &str, selectors: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            selectors: selectors.iter().map(|s| s.to_string()).collect(),
            patterns: Vec::new(),
            required: false,
        }
    }

    pub fn with_patterns(mut self, patterns: &[&str]) -> Self {
        self.patterns = patterns.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// 步骤动作
#[derive(Debug, Clone, PartialEq)]
pub enum StepAction {
    Navigate {
        url: String,
    },
    /// 先填充再点击，可选等待点击后的结果
    Act {
        instruction: String,
        fills: Vec<FieldFill>,
        click: Option<String>,
        wait_for: Option<WaitTarget>,
    },
    Extract {
        fields: Vec<ExtractField>,
    },
    /// 任一选择器存在即通过
    Observe {
        selectors: Vec<String>,
    },
    Wait {
        target: WaitTarget,
    },
    Upload {
        selector: String,
        path: String,
        wait_for: Option<WaitTarget>,
    },
    Otp {
        instruction: String,
    },
}

impl StepAction {
    pub fn kind(&self) -> StepKind {
        match self {
            Self::Navigate { .. } => StepKind::Navigate,
            Self::Act { .. } => StepKind::Act,
            Self::Extract { .. } => StepKind::Extract,
            Self::Observe { .. } => StepKind::Observe,
            Self::Wait { .. } => StepKind::Wait,
            Self::Upload { .. } => StepKind::Upload,
            Self::Otp { .. } => StepKind::Otp,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AutomationStep {
    pub name: String,
    pub action: StepAction,
    pub retryable: bool,
    pub max_retries: u32,
    /// None 时用执行器默认超时
    pub timeout: Option<Duration>,
}

impl AutomationStep {
    pub fn new(name: impl Into<String>, action: StepAction) -> Self {
        Self {
            name: name.into(),
            action,
            retryable: false,
            max_retries: 0,
            timeout: None,
        }
    }

    pub fn navigate(name: &str, url: impl Into<String>) -> Self {
        Self::new(name, StepAction::Navigate { url: url.into() })
    }

    pub fn act(
        name: &str,
        instruction: &str,
        fills: Vec<FieldFill>,
        click: Option<&str>,
    ) -> Self {
        Self::new(
            name,
            StepAction::Act {
                instruction: instruction.to_string(),
                fills,
                click: click.map(|s| s.to_string()),
                wait_for: None,
            },
        )
    }

    pub fn extract(name: &str, fields: Vec<ExtractField>) -> Self {
        Self::new(name, StepAction::Extract { fields })
    }

    pub fn upload(name: &str, selector: &str, path: &str, wait_for: Option<WaitTarget>) -> Self {
        Self::new(
            name,
            StepAction::Upload {
                selector: selector.to_string(),
                path: path.to_string(),
                wait_for,
            },
        )
    }

    pub fn kind(&self) -> StepKind {
        self.action.kind()
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self.max_retries = DEFAULT_STEP_RETRIES;
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.retryable = max_retries > 0;
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_wait(mut self, target: WaitTarget) -> Self {
        match &mut self.action {
            StepAction::Act { wait_for, .. } | StepAction::Upload { wait_for, .. } => {
                *wait_for = Some(target)
            }
            _ => {}
        }
        self
    }

    /// 最多执行次数（含首次）
    pub fn max_attempts(&self) -> u32 {
        if self.retryable {
            self.max_retries + 1
        } else {
            1
        }
    }
}

/// 用已抽取的数据替换 `{{name}}`
pub fn interpolate(template: &str, extracted: &ExtractedData) -> String {
    if !template.contains("{{") {
        return template.to_string();
    }
    extracted.iter().fold(template.to_string(), |acc, (key, value)| {
        let needle = format!("{{{{{}}}}}", key);
        if !acc.contains(&needle) {
            return acc;
        }
        let replacement = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        acc.replace(&needle, &replacement)
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
    /// 失败但还会重试
    Retrying,
}

/// 每次步骤尝试的日志
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepLog {
    pub step: String,
    pub index: usize,
    pub kind: StepKind,
    pub status: StepStatus,
    pub attempt: u32,
    pub message: Option<String>,
    pub duration_ms: u64,
    pub at: i64,
    /// base64 PNG
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
}

/// 全部步骤成功
#[derive(Debug, Clone, Default)]
pub struct ExecutionSummary {
    pub completed: usize,
    pub total: usize,
    pub extracted: ExtractedData,
    pub logs: Vec<StepLog>,
}

/// 终止运行的步骤失败
#[derive(Debug, Clone)]
pub struct StepFailure {
    pub step: String,
    pub index: usize,
    pub kind: StepKind,
    pub error: ClassifiedError,
    pub attempts: u32,
    /// 只能由人工完成（otp 步骤、反自动化）
    pub requires_human: bool,
    pub screenshot: Option<String>,
    pub completed: usize,
    pub total: usize,
    pub extracted: ExtractedData,
    pub logs: Vec<StepLog>,
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "step '{}' failed after {} attempt(s): {}",
            self.step, self.attempts, self.error
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpolate_uses_extracted_values() {
        let mut data = ExtractedData::new();
        data.insert("ref".into(), serde_json::json!("PA-77"));
        data.insert("count".into(), serde_json::json!(3));
        assert_eq!(
            interpolate("https://p.test/search?q={{ref}}&n={{count}}", &data),
            "https://p.test/search?q=PA-77&n=3"
        );
        assert_eq!(interpolate("{{missing}}", &data), "{{missing}}");
    }

    #[test]
    fn test_retry_budget() {
        let step = AutomationStep::navigate("Go", "https://p.test");
        assert_eq!(step.max_attempts(), 1);
        assert_eq!(step.clone().retryable().max_attempts(), 4);
        assert_eq!(step.with_retries(2).max_attempts(), 3);
    }
}
