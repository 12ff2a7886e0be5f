//! 反自动化信号检测
//!
//! 验证码元素、限流文案、安全校验 URL、真人验证文案分别计分，置信度封顶 1.0；
//! 超过 0.5 视为命中，超过 0.7 建议直接升级人工。

use std::time::Duration;

use rand::Rng;

use super::{BrowserResult, BrowserSession};

const CAPTCHA_SELECTORS: &[&str] = &[
    ".captcha",
    "#captcha",
    "[class*=\"recaptcha\"]",
    "[data-sitekey]",
    "iframe[src*=\"recaptcha\"]",
];

const RATE_LIMIT_PHRASES: &[&str] = &[
    "too many requests",
    "rate limit",
    "please try again later",
    "temporarily blocked",
    "suspicious activity",
];

const HUMAN_VERIFICATION_PHRASES: &[&str] = &[
    "human verification",
    "verify you are human",
    "prove you are not a robot",
    "complete verification",
];

const SECURITY_URL_MARKERS: &[&str] = &["security", "verification", "captcha", "challenge"];

/// 一次检测结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BotSignal {
    pub detected: bool,
    pub confidence: f64,
    pub signals: Vec<String>,
    pub should_escalate: bool,
}

/// 检测器：阈值可调
#[derive(Debug, Clone)]
pub struct BotDetector {
    detect_threshold: f64,
    escalate_threshold: f64,
}

impl Default for BotDetector {
    fn default() -> Self {
        Self {
            detect_threshold: 0.5,
            escalate_threshold: 0.7,
        }
    }
}

impl BotDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// 基于页面文本与 URL 打分（不访问浏览器）
    pub fn score(&self, captcha_present: bool, page_text: &str, url: &str) -> BotSignal {
        let text = page_text.to_lowercase();
        let url = url.to_lowercase();
        let mut confidence: f64 = 0.0;
        let mut signals = Vec::new();

        if captcha_present {
            confidence += 0.8;
            signals.push("captcha_detected".to_string());
        }
        if RATE_LIMIT_PHRASES.iter().any(|p| text.contains(p)) {
            confidence += 0.7;
            signals.push("rate_limit_detected".to_string());
        }
        if SECURITY_URL_MARKERS.iter().any(|m| url.contains(m)) {
            confidence += 0.6;
            signals.push("security_redirect".to_string());
        }
        if HUMAN_VERIFICATION_PHRASES.iter().any(|p| text.contains(p)) {
            confidence += 0.9;
            signals.push("human_verification_required".to_string());
        }

        let confidence = confidence.min(1.0);
        BotSignal {
            detected: confidence > self.detect_threshold,
            confidence,
            signals,
            should_escalate: confidence > self.escalate_threshold,
        }
    }

    /// 检查当前页面
    pub async fn check(&self, browser: &mut dyn BrowserSession) -> BrowserResult<BotSignal> {
        let captcha = browser.first_present(CAPTCHA_SELECTORS).await?.is_some();
        let text = browser.page_text().await?;
        let url = browser.current_url().await?;
        let signal = self.score(captcha, &text, &url);
        if signal.detected {
            tracing::warn!(
                confidence = signal.confidence,
                signals = ?signal.signals,
                "bot detection signals on page"
            );
        }
        Ok(signal)
    }
}

/// 拟人输入的单字符延迟
pub fn typing_delay(range: (u64, u64)) -> Duration {
    let (lo, hi) = if range.0 <= range.1 {
        range
    } else {
        (range.1, range.0)
    };
    Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::ScriptedBrowser;

    #[test]
    fn test_clean_page_not_detected() {
        let signal = BotDetector::new().score(false, "Welcome back, Dr. Smith", "https://portal.test/home");
        assert!(!signal.detected);
        assert_eq!(signal.confidence, 0.0);
    }

    #[test]
    fn test_captcha_escalates() {
        let signal = BotDetector::new().score(true, "", "https://portal.test/login");
        assert!(signal.detected);
        assert!(signal.should_escalate);
        assert_eq!(signal.signals, vec!["captcha_detected".to_string()]);
    }

    #[test]
    fn test_security_url_alone_is_below_threshold_for_escalation() {
        let signal = BotDetector::new().score(false, "", "https://portal.test/security-check");
        assert!(signal.detected);
        assert!(!signal.should_escalate);
    }

    #[test]
    fn test_confidence_capped() {
        let signal = BotDetector::new().score(
            true,
            "Too many requests. Please verify you are human",
            "https://portal.test/captcha",
        );
        assert_eq!(signal.confidence, 1.0);
        assert_eq!(signal.signals.len(), 4);
    }

    #[test]
    fn test_typing_delay_in_range() {
        for _ in 0..20 {
            let d = typing_delay((50, 150)).as_millis();
            assert!((50..=150).contains(&d));
        }
    }

    #[tokio::test]
    async fn test_check_against_scripted_page() {
        let mut browser = ScriptedBrowser::new()
            .with_present("[data-sitekey]")
            .with_page_text("Please complete verification");
        let signal = BotDetector::new().check(&mut browser).await.unwrap();
        assert!(signal.should_escalate);
        assert!(signal.signals.contains(&"human_verification_required".to_string()));
    }
}
