//! 确认号：区分门户上抓取到的与本地合成的

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::store::ExtractedData;

/// 抽取结果中按优先级查找确认号的键
pub const CONFIRMATION_KEYS: &[&str] = &["confirmation_number", "page_confirmation", "reference_number"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", content = "value", rename_all = "snake_case")]
pub enum ConfirmationNumber {
    /// 从门户页面抓取
    Scraped(String),
    /// 页面上没有找到，本地生成
    Synthesized(String),
}

impl ConfirmationNumber {
    pub fn value(&self) -> &str {
        match self {
            Self::Scraped(v) | Self::Synthesized(v) => v,
        }
    }

    pub fn is_synthesized(&self) -> bool {
        matches!(self, Self::Synthesized(_))
    }

    /// AUTO_{毫秒}_{6 位大写字母数字}
    pub fn synthesize(now_ms: i64) -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(6)
            .map(|b| (b as char).to_ascii_uppercase())
            .collect();
        Self::Synthesized(format!("AUTO_{}_{}", now_ms, suffix))
    }

    /// 优先取抓取值，没有则合成
    pub fn from_extracted(extracted: &ExtractedData, now_ms: i64) -> Self {
        CONFIRMATION_KEYS
            .iter()
            .filter_map(|key| extracted.get(*key))
            .filter_map(|v| v.as_str())
            .map(str::trim)
            .find(|v| !v.is_empty())
            .map(|v| Self::Scraped(v.to_string()))
            .unwrap_or_else(|| {
                tracing::warn!("no confirmation number on page, synthesizing one");
                Self::synthesize(now_ms)
            })
    }
}

impl std::fmt::Display for ConfirmationNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefers_scraped_value() {
        let mut data = ExtractedData::new();
        data.insert("reference_number".into(), serde_json::json!("REF-9"));
        data.insert("confirmation_number".into(), serde_json::json!(" PA-2024-001 "));
        assert_eq!(
            ConfirmationNumber::from_extracted(&data, 0),
            ConfirmationNumber::Scraped("PA-2024-001".into())
        );
    }

    #[test]
    fn test_synthesized_format() {
        let c = ConfirmationNumber::from_extracted(&ExtractedData::new(), 1_700_000_000_000);
        assert!(c.is_synthesized());
        let value = c.value();
        assert!(value.starts_with("AUTO_1700000000000_"));
        let suffix = value.rsplit('_').next().unwrap();
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|ch| ch.is_ascii_uppercase() || ch.is_ascii_digit()));

        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["source"], "synthesized");
    }
}
