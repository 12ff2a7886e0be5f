//! Headless Chrome 后端
//!
//! 需启用 feature "browser" 且系统已安装 Chrome/Chromium。
//! headless_chrome 是同步 API，所有调用都放进 `spawn_blocking`。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, LaunchOptions, Tab};

use super::detect::typing_delay;
use super::{BrowserError, BrowserFactory, BrowserResult, BrowserSession, TypeOptions, WaitTarget};
use crate::config::PortalProfile;

fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

/// 一个 Chrome 标签页
pub struct ChromeBrowser {
    tab: Arc<Tab>,
    element_timeout: Duration,
    closed: bool,
}

impl ChromeBrowser {
    pub fn new(tab: Arc<Tab>, element_timeout: Duration) -> Self {
        Self {
            tab,
            element_timeout,
            closed: false,
        }
    }

    async fn blocking<T, F>(&self, f: F) -> BrowserResult<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Tab>, Duration) -> BrowserResult<T> + Send + 'static,
    {
        if self.closed {
            return Err(BrowserError::Closed);
        }
        let tab = Arc::clone(&self.tab);
        let timeout = self.element_timeout;
        tokio::task::spawn_blocking(move || f(tab, timeout))
            .await
            .map_err(|e| BrowserError::Unavailable(format!("Task join: {}", e)))?
    }
}

#[async_trait]
impl BrowserSession for ChromeBrowser {
    async fn navigate(&mut self, url: &str) -> BrowserResult<()> {
        let url = url.to_string();
        tracing::debug!(url = %url, "chrome navigate");
        self.blocking(move |tab, _| {
            tab.navigate_to(&url)
                .map_err(|e| BrowserError::Navigation(format!("{}: {}", url, e)))?;
            tab.wait_until_navigated()
                .map_err(|e| BrowserError::Navigation(format!("{}: {}", url, e)))?;
            Ok(())
        })
        .await
    }

    async fn fill(&mut self, selector: &str, value: &str) -> BrowserResult<()> {
        let script = format!(
            "(() => {{ const el = document.querySelector({sel}); if (!el) return false; \
             el.value = {val}; el.dispatchEvent(new Event('input', {{ bubbles: true }})); \
             el.dispatchEvent(new Event('change', {{ bubbles: true }})); return true; }})()",
            sel = js_string(selector),
            val = js_string(value)
        );
        let found = self.evaluate(&script).await?.as_bool().unwrap_or(false);
        if !found {
            return Err(BrowserError::ElementNotFound(selector.to_string()));
        }
        Ok(())
    }

    async fn click(&mut self, selector: &str) -> BrowserResult<()> {
        let selector = selector.to_string();
        self.blocking(move |tab, timeout| {
            let el = tab
                .wait_for_element_with_custom_timeout(&selector, timeout)
                .map_err(|_| BrowserError::ElementNotFound(selector.clone()))?;
            el.click()
                .map_err(|e| BrowserError::Evaluation(format!("click {}: {}", selector, e)))?;
            Ok(())
        })
        .await
    }

    async fn type_text(&mut self, selector: &str, text: &str, options: TypeOptions) -> BrowserResult<()> {
        let selector = selector.to_string();
        let text = text.to_string();
        self.blocking(move |tab, timeout| {
            let el = tab
                .wait_for_element_with_custom_timeout(&selector, timeout)
                .map_err(|_| BrowserError::ElementNotFound(selector.clone()))?;
            if options.clear {
                el.call_js_fn("function() { this.value = ''; }", vec![], false)
                    .map_err(|e| BrowserError::Evaluation(e.to_string()))?;
            }
            el.click()
                .map_err(|e| BrowserError::Evaluation(format!("focus {}: {}", selector, e)))?;
            match options.delay_ms {
                Some(range) => {
                    for c in text.chars() {
                        tab.type_str(&c.to_string())
                            .map_err(|e| BrowserError::Evaluation(e.to_string()))?;
                        std::thread::sleep(typing_delay(range));
                    }
                }
                None => {
                    el.type_into(&text)
                        .map_err(|e| BrowserError::Evaluation(e.to_string()))?;
                }
            }
            Ok(())
        })
        .await
    }

    async fn screenshot(&mut self) -> BrowserResult<Vec<u8>> {
        self.blocking(|tab, _| {
            tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)
                .map_err(|e| BrowserError::Evaluation(format!("screenshot: {}", e)))
        })
        .await
    }

    async fn evaluate(&mut self, script: &str) -> BrowserResult<serde_json::Value> {
        let script = script.to_string();
        self.blocking(move |tab, _| {
            let result = tab
                .evaluate(&script, false)
                .map_err(|e| BrowserError::Evaluation(e.to_string()))?;
            Ok(result.value.unwrap_or(serde_json::Value::Null))
        })
        .await
    }

    async fn wait_for(&mut self, target: &WaitTarget, timeout: Duration) -> BrowserResult<()> {
        let target = target.clone();
        self.blocking(move |tab, _| {
            let script = match &target {
                WaitTarget::Selector(sel) => {
                    return tab
                        .wait_for_element_with_custom_timeout(sel, timeout)
                        .map(|_| ())
                        .map_err(|_| BrowserError::Timeout(target.to_string()));
                }
                WaitTarget::Text(text) => format!(
                    "document.body && document.body.innerText.toLowerCase().includes({})",
                    js_string(&text.to_lowercase())
                ),
                WaitTarget::Predicate(p) => p.clone(),
            };
            let deadline = std::time::Instant::now() + timeout;
            loop {
                let ok = tab
                    .evaluate(&script, false)
                    .ok()
                    .and_then(|r| r.value)
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                if ok {
                    return Ok(());
                }
                if std::time::Instant::now() >= deadline {
                    return Err(BrowserError::Timeout(target.to_string()));
                }
                std::thread::sleep(Duration::from_millis(200));
            }
        })
        .await
    }

    async fn upload_file(&mut self, selector: &str, path: &str) -> BrowserResult<()> {
        let selector = selector.to_string();
        let path = path.to_string();
        self.blocking(move |tab, timeout| {
            let el = tab
                .wait_for_element_with_custom_timeout(&selector, timeout)
                .map_err(|_| BrowserError::ElementNotFound(selector.clone()))?;
            el.set_input_files(&[path.as_str()])
                .map_err(|e| BrowserError::Evaluation(format!("upload {}: {}", path, e)))?;
            Ok(())
        })
        .await
    }

    async fn close(&mut self) -> BrowserResult<()> {
        if self.closed {
            return Ok(());
        }
        let result = self
            .blocking(|tab, _| {
                tab.close(true)
                    .map(|_| ())
                    .map_err(|e| BrowserError::Connection(e.to_string()))
            })
            .await;
        self.closed = true;
        result
    }

    async fn current_url(&mut self) -> BrowserResult<String> {
        self.blocking(|tab, _| Ok(tab.get_url())).await
    }
}

/// 复用同一个 Chrome 进程，每次 open 新开一个标签页
pub struct ChromeBrowserFactory {
    browser: Arc<Mutex<Option<Browser>>>,
    headless: bool,
    element_timeout: Duration,
}

impl ChromeBrowserFactory {
    pub fn new(headless: bool, element_timeout: Duration) -> Self {
        Self {
            browser: Arc::new(Mutex::new(None)),
            headless,
            element_timeout,
        }
    }
}

#[async_trait]
impl BrowserFactory for ChromeBrowserFactory {
    async fn open(&self, portal: &PortalProfile) -> BrowserResult<Box<dyn BrowserSession>> {
        let browser_arc = Arc::clone(&self.browser);
        let headless = self.headless;
        tracing::info!(portal = %portal.display_name(), "opening chrome tab");

        let tab = tokio::task::spawn_blocking(move || {
            let mut guard = browser_arc
                .lock()
                .map_err(|e| BrowserError::Unavailable(e.to_string()))?;
            let browser = match guard.as_ref() {
                Some(b) => b.clone(),
                None => {
                    let options = LaunchOptions::default_builder()
                        .headless(headless)
                        .build()
                        .map_err(|e| BrowserError::Unavailable(format!("Chrome options: {}", e)))?;
                    let launched = Browser::new(options).map_err(|e| {
                        BrowserError::Unavailable(format!(
                            "Chrome launch failed: {}. Install Chrome/Chromium.",
                            e
                        ))
                    })?;
                    *guard = Some(launched.clone());
                    launched
                }
            };
            browser
                .new_tab()
                .map_err(|e| BrowserError::Connection(format!("Browser tab failed: {}", e)))
        })
        .await
        .map_err(|e| BrowserError::Unavailable(format!("Task join: {}", e)))??;

        Ok(Box::new(ChromeBrowser::new(tab, self.element_timeout)))
    }
}
