//! 从短信正文中提取验证码；号码规范化

use std::sync::OnceLock;

use regex::Regex;

/// 按顺序尝试：显式 "code: NNNNNN" 类短语 → "NNNNNN is your ..." → 任意 4–8 位数字
fn patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)\b(?:code|passcode|pin|otp)\b[^0-9]{0,20}?\b(\d{4,8})\b",
            r"(?i)\b(\d{4,8})\b\s+is\s+your\b",
            r"\b(\d{4,8})\b",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

pub fn extract_code(body: &str) -> Option<String> {
    patterns()
        .iter()
        .find_map(|re| re.captures(body).and_then(|c| c.get(1)))
        .map(|m| m.as_str().to_string())
}

/// 只保留数字并加前导 +；10 位号码按北美补 +1
pub fn normalize_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() == 10 {
        format!("+1{}", digits)
    } else {
        format!("+{}", digits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_phrase() {
        assert_eq!(
            extract_code("Your verification code is: 482913").as_deref(),
            Some("482913")
        );
    }

    #[test]
    fn test_explicit_phrase_wins_over_earlier_digits() {
        assert_eq!(
            extract_code("Ref 7731. Your login code: 550123").as_deref(),
            Some("550123")
        );
    }

    #[test]
    fn test_code_first_phrasing() {
        assert_eq!(
            extract_code("90817 is your Availity one-time passcode").as_deref(),
            Some("90817")
        );
    }

    #[test]
    fn test_no_plausible_code() {
        assert_eq!(extract_code("Your appointment is tomorrow at 10"), None);
        assert_eq!(extract_code("Account 1234567890123 updated"), None);
    }

    #[test]
    fn test_normalize_phone() {
        assert_eq!(normalize_phone("(555) 123-4567"), "+15551234567");
        assert_eq!(normalize_phone("+1 555 123 4567"), "+15551234567");
        assert_eq!(normalize_phone("+44 20 7946 0958"), "+442079460958");
    }
}
