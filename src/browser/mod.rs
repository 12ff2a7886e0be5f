//! 浏览器会话抽象
//!
//! 编排核心只通过 `BrowserSession` 驱动页面：navigate / fill / click / type / screenshot / evaluate / wait_for / close。
//! - **scripted**: 确定性页面模型，测试与演练用
//! - **chrome**: headless_chrome 实现（`browser` feature）
//! - **detect**: 反自动化信号检测与拟人输入节奏

pub mod detect;
pub mod scripted;

#[cfg(feature = "browser")]
pub mod chrome;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::PortalProfile;

pub use detect::{BotDetector, BotSignal};
pub use scripted::{Reaction, ScriptedBrowser, ScriptedBrowserFactory};

#[cfg(feature = "browser")]
pub use chrome::{ChromeBrowser, ChromeBrowserFactory};

/// 浏览器驱动错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrowserError {
    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Timeout waiting for {0}")]
    Timeout(String),

    #[error("Script evaluation failed: {0}")]
    Evaluation(String),

    #[error("Network connection error: {0}")]
    Connection(String),

    #[error("Browser session closed")]
    Closed,

    #[error("Browser unavailable: {0}")]
    Unavailable(String),
}

pub type BrowserResult<T> = Result<T, BrowserError>;

/// 输入选项：逐字符延迟区间（毫秒），None 表示一次性输入
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TypeOptions {
    pub delay_ms: Option<(u64, u64)>,
    /// 输入前清空
    pub clear: bool,
}

impl TypeOptions {
    /// 拟人节奏：每字符 50–150ms
    pub fn human() -> Self {
        Self {
            delay_ms: Some((50, 150)),
            clear: true,
        }
    }
}

/// 等待目标：选择器出现、页面文本出现，或自定义 JS 谓词为真
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitTarget {
    Selector(String),
    Text(String),
    Predicate(String),
}

impl std::fmt::Display for WaitTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Selector(s) => write!(f, "selector {}", s),
            Self::Text(t) => write!(f, "text '{}'", t),
            Self::Predicate(p) => write!(f, "predicate {}", p),
        }
    }
}

fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

/// 一个远程浏览器会话
#[async_trait]
pub trait BrowserSession: Send {
    async fn navigate(&mut self, url: &str) -> BrowserResult<()>;

    async fn fill(&mut self, selector: &str, value: &str) -> BrowserResult<()>;

    async fn click(&mut self, selector: &str) -> BrowserResult<()>;

    async fn type_text(&mut self, selector: &str, text: &str, options: TypeOptions) -> BrowserResult<()>;

    /// PNG 字节
    async fn screenshot(&mut self) -> BrowserResult<Vec<u8>>;

    async fn evaluate(&mut self, script: &str) -> BrowserResult<serde_json::Value>;

    async fn wait_for(&mut self, target: &WaitTarget, timeout: Duration) -> BrowserResult<()>;

    /// 为文件输入框设置待上传文件
    async fn upload_file(&mut self, selector: &str, path: &str) -> BrowserResult<()>;

    async fn close(&mut self) -> BrowserResult<()>;

    async fn is_present(&mut self, selector: &str) -> BrowserResult<bool> {
        let script = format!("document.querySelector({}) !== null", js_string(selector));
        Ok(self.evaluate(&script).await?.as_bool().unwrap_or(false))
    }

    async fn inner_text(&mut self, selector: &str) -> BrowserResult<Option<String>> {
        let script = format!(
            "(() => {{ const el = document.querySelector({}); return el ? el.innerText : null; }})()",
            js_string(selector)
        );
        Ok(self.evaluate(&script).await?.as_str().map(|s| s.to_string()))
    }

    async fn page_text(&mut self) -> BrowserResult<String> {
        let value = self
            .evaluate("document.body ? document.body.innerText : ''")
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn current_url(&mut self) -> BrowserResult<String> {
        let value = self.evaluate("window.location.href").await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn cookies(&mut self) -> BrowserResult<String> {
        let value = self.evaluate("document.cookie").await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    /// 恢复保存的 cookie（document.cookie 逐条写入）
    async fn restore_cookies(&mut self, cookies: &str) -> BrowserResult<()> {
        for pair in cookies.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let script = format!("document.cookie = {}", js_string(pair));
            self.evaluate(&script).await?;
        }
        Ok(())
    }

    /// 依次检查选择器，返回第一个存在的
    async fn first_present(&mut self, selectors: &[&str]) -> BrowserResult<Option<String>> {
        for selector in selectors {
            if self.is_present(selector).await? {
                return Ok(Some((*selector).to_string()));
            }
        }
        Ok(None)
    }
}

/// 浏览器会话工厂：每次自动化运行打开一个新会话
#[async_trait]
pub trait BrowserFactory: Send + Sync {
    async fn open(&self, portal: &PortalProfile) -> BrowserResult<Box<dyn BrowserSession>>;
}

/// 未启用浏览器后端时的占位工厂
#[derive(Debug, Default)]
pub struct UnavailableBrowserFactory;

#[async_trait]
impl BrowserFactory for UnavailableBrowserFactory {
    async fn open(&self, portal: &PortalProfile) -> BrowserResult<Box<dyn BrowserSession>> {
        Err(BrowserError::Unavailable(format!(
            "no browser backend configured for {}",
            portal.display_name()
        )))
    }
}
