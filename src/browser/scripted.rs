//! 脚本化浏览器
//!
//! 用一个确定性的页面模型代替真实驱动：可见选择器集合、页面文本、元素文本、脚本返回值，
//! 点击 / 导航触发的页面变化（Reaction），以及按选择器或 URL 注入的失败。
//! 克隆体共享同一份状态，测试可在运行结束后检查动作记录与关闭情况。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{BrowserError, BrowserFactory, BrowserResult, BrowserSession, TypeOptions, WaitTarget};
use crate::config::PortalProfile;

/// 动作触发的页面变化
#[derive(Debug, Clone, PartialEq)]
pub enum Reaction {
    Show(String),
    Hide(String),
    SetPageText(String),
    AppendPageText(String),
    SetText { selector: String, text: String },
    SetUrl(String),
}

#[derive(Default)]
struct ScriptState {
    url: String,
    present: HashSet<String>,
    page_text: String,
    texts: HashMap<String, String>,
    evals: HashMap<String, serde_json::Value>,
    on_click: HashMap<String, Vec<Reaction>>,
    on_navigate: Vec<(String, Vec<Reaction>)>,
    failures: HashMap<String, VecDeque<BrowserError>>,
    panics: HashSet<String>,
    actions: Vec<String>,
    fields: HashMap<String, String>,
    uploads: Vec<(String, String)>,
    cookies: String,
    closed: bool,
    close_count: usize,
}

impl ScriptState {
    fn apply(&mut self, reactions: &[Reaction]) {
        for reaction in reactions {
            match reaction {
                Reaction::Show(sel) => {
                    self.present.insert(sel.clone());
                }
                Reaction::Hide(sel) => {
                    self.present.remove(sel);
                }
                Reaction::SetPageText(text) => self.page_text = text.clone(),
                Reaction::AppendPageText(text) => {
                    self.page_text.push('\n');
                    self.page_text.push_str(text);
                }
                Reaction::SetText { selector, text } => {
                    self.texts.insert(selector.clone(), text.clone());
                }
                Reaction::SetUrl(url) => self.url = url.clone(),
            }
        }
    }

    fn take_failure(&mut self, key: &str) -> Option<BrowserError> {
        self.failures.get_mut(key).and_then(|q| q.pop_front())
    }

    fn ensure_open(&self) -> BrowserResult<()> {
        if self.closed {
            return Err(BrowserError::Closed);
        }
        Ok(())
    }

    fn ensure_present(&self, selector: &str) -> BrowserResult<()> {
        if !self.present.contains(selector) {
            return Err(BrowserError::ElementNotFound(selector.to_string()));
        }
        Ok(())
    }
}

/// 脚本化浏览器会话
#[derive(Clone, Default)]
pub struct ScriptedBrowser {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 动作前检查：已关闭 / 注入 panic / 注入失败
    fn before(&self, key: &str, action: String) -> BrowserResult<MutexGuard<'_, ScriptState>> {
        let mut state = self.state();
        state.ensure_open()?;
        state.actions.push(action);
        if state.panics.contains(key) {
            drop(state);
            panic!("scripted panic on {}", key);
        }
        if let Some(err) = state.take_failure(key) {
            return Err(err);
        }
        Ok(state)
    }

    pub fn with_present(self, selector: &str) -> Self {
        self.state().present.insert(selector.to_string());
        self
    }

    pub fn with_page_text(self, text: &str) -> Self {
        self.state().page_text = text.to_string();
        self
    }

    pub fn with_text(self, selector: &str, text: &str) -> Self {
        self.state().texts.insert(selector.to_string(), text.to_string());
        self
    }

    pub fn with_eval(self, script: &str, value: serde_json::Value) -> Self {
        self.state().evals.insert(script.to_string(), value);
        self
    }

    pub fn on_click(self, selector: &str, reactions: Vec<Reaction>) -> Self {
        self.state()
            .on_click
            .entry(selector.to_string())
            .or_default()
            .extend(reactions);
        self
    }

    /// URL 包含 fragment 时触发
    pub fn on_navigate(self, fragment: &str, reactions: Vec<Reaction>) -> Self {
        self.state().on_navigate.push((fragment.to_string(), reactions));
        self
    }

    /// 前 n 次对 key（选择器、URL 或脚本）的操作返回 err
    pub fn fail_times(self, key: &str, n: usize, err: BrowserError) -> Self {
        self.state()
            .failures
            .entry(key.to_string())
            .or_default()
            .extend(std::iter::repeat(err).take(n));
        self
    }

    pub fn panic_on(self, key: &str) -> Self {
        self.state().panics.insert(key.to_string());
        self
    }

    pub fn actions(&self) -> Vec<String> {
        self.state().actions.clone()
    }

    pub fn field_value(&self, selector: &str) -> Option<String> {
        self.state().fields.get(selector).cloned()
    }

    pub fn uploads(&self) -> Vec<(String, String)> {
        self.state().uploads.clone()
    }

    pub fn url(&self) -> String {
        self.state().url.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn close_count(&self) -> usize {
        self.state().close_count
    }

    pub fn saved_cookies(&self) -> String {
        self.state().cookies.clone()
    }

    pub fn set_cookies(&self, cookies: &str) {
        self.state().cookies = cookies.to_string();
    }

    fn reopen(&self) {
        let mut state = self.state();
        state.closed = false;
        state.actions.push("open".to_string());
    }
}

#[async_trait]
impl BrowserSession for ScriptedBrowser {
    async fn navigate(&mut self, url: &str) -> BrowserResult<()> {
        let mut state = self.before(url, format!("navigate:{}", url))?;
        let failure = state
            .failures
            .iter_mut()
            .find(|(k, q)| !q.is_empty() && url.contains(k.as_str()))
            .and_then(|(_, q)| q.pop_front());
        if let Some(err) = failure {
            return Err(err);
        }
        state.url = url.to_string();
        let reactions: Vec<Reaction> = state
            .on_navigate
            .iter()
            .filter(|(fragment, _)| url.contains(fragment.as_str()))
            .flat_map(|(_, r)| r.clone())
            .collect();
        state.apply(&reactions);
        Ok(())
    }

    async fn fill(&mut self, selector: &str, value: &str) -> BrowserResult<()> {
        let mut state = self.before(selector, format!("fill:{}", selector))?;
        state.ensure_present(selector)?;
        state.fields.insert(selector.to_string(), value.to_string());
        Ok(())
    }

    async fn click(&mut self, selector: &str) -> BrowserResult<()> {
        let mut state = self.before(selector, format!("click:{}", selector))?;
        state.ensure_present(selector)?;
        if let Some(reactions) = state.on_click.get(selector).cloned() {
            state.apply(&reactions);
        }
        Ok(())
    }

    async fn type_text(&mut self, selector: &str, text: &str, _options: TypeOptions) -> BrowserResult<()> {
        let mut state = self.before(selector, format!("type:{}", selector))?;
        state.ensure_present(selector)?;
        state.fields.insert(selector.to_string(), text.to_string());
        Ok(())
    }

    async fn screenshot(&mut self) -> BrowserResult<Vec<u8>> {
        self.state().ensure_open()?;
        Ok(b"scripted-screenshot".to_vec())
    }

    async fn evaluate(&mut self, script: &str) -> BrowserResult<serde_json::Value> {
        let state = self.before(script, format!("evaluate:{}", script))?;
        Ok(state
            .evals
            .get(script)
            .cloned()
            .unwrap_or(serde_json::Value::Null))
    }

    async fn wait_for(&mut self, target: &WaitTarget, _timeout: Duration) -> BrowserResult<()> {
        let state = self.state();
        state.ensure_open()?;
        let satisfied = match target {
            WaitTarget::Selector(sel) => state.present.contains(sel),
            WaitTarget::Text(text) => state
                .page_text
                .to_lowercase()
                .contains(&text.to_lowercase()),
            WaitTarget::Predicate(script) => state
                .evals
                .get(script)
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        };
        if satisfied {
            Ok(())
        } else {
            Err(BrowserError::Timeout(target.to_string()))
        }
    }

    async fn upload_file(&mut self, selector: &str, path: &str) -> BrowserResult<()> {
        let mut state = self.before(selector, format!("upload:{}", selector))?;
        state.ensure_present(selector)?;
        state.uploads.push((selector.to_string(), path.to_string()));
        Ok(())
    }

    async fn close(&mut self) -> BrowserResult<()> {
        let mut state = self.state();
        state.closed = true;
        state.close_count += 1;
        state.actions.push("close".to_string());
        match state.take_failure("close") {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn is_present(&mut self, selector: &str) -> BrowserResult<bool> {
        let state = self.state();
        state.ensure_open()?;
        Ok(state.present.contains(selector))
    }

    async fn inner_text(&mut self, selector: &str) -> BrowserResult<Option<String>> {
        let state = self.state();
        state.ensure_open()?;
        Ok(state.texts.get(selector).cloned())
    }

    async fn page_text(&mut self) -> BrowserResult<String> {
        let state = self.state();
        state.ensure_open()?;
        Ok(state.page_text.clone())
    }

    async fn current_url(&mut self) -> BrowserResult<String> {
        let state = self.state();
        state.ensure_open()?;
        Ok(state.url.clone())
    }

    async fn cookies(&mut self) -> BrowserResult<String> {
        let state = self.state();
        state.ensure_open()?;
        Ok(state.cookies.clone())
    }

    async fn restore_cookies(&mut self, cookies: &str) -> BrowserResult<()> {
        let mut state = self.state();
        state.ensure_open()?;
        state.cookies = cookies.to_string();
        state.actions.push("restore_cookies".to_string());
        Ok(())
    }
}

/// 每次 open 返回共享状态的同一个脚本化页面
pub struct ScriptedBrowserFactory {
    browser: ScriptedBrowser,
    opened: AtomicUsize,
}

impl ScriptedBrowserFactory {
    pub fn new(browser: ScriptedBrowser) -> Self {
        Self {
            browser,
            opened: AtomicUsize::new(0),
        }
    }

    pub fn browser(&self) -> &ScriptedBrowser {
        &self.browser
    }

    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserFactory for ScriptedBrowserFactory {
    async fn open(&self, _portal: &PortalProfile) -> BrowserResult<Box<dyn BrowserSession>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.browser.reopen();
        Ok(Box::new(self.browser.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_click_reaction_reveals_element() {
        let mut browser = ScriptedBrowser::new()
            .with_present("#login")
            .on_click("#login", vec![Reaction::Show(".dashboard".to_string())]);
        assert!(!browser.is_present(".dashboard").await.unwrap());
        browser.click("#login").await.unwrap();
        assert!(browser.is_present(".dashboard").await.unwrap());
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let mut browser = ScriptedBrowser::new()
            .with_present("#go")
            .fail_times("#go", 2, BrowserError::Timeout("#go".to_string()));
        assert!(browser.click("#go").await.is_err());
        assert!(browser.click("#go").await.is_err());
        assert!(browser.click("#go").await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_browser_rejects_actions() {
        let mut browser = ScriptedBrowser::new().with_present("#a");
        browser.close().await.unwrap();
        assert_eq!(browser.click("#a").await.unwrap_err(), BrowserError::Closed);
        assert!(browser.is_closed());
    }

    #[tokio::test]
    async fn test_navigate_failure_by_url_fragment() {
        let mut browser = ScriptedBrowser::new().fail_times(
            "portal.test",
            1,
            BrowserError::Connection("connection reset".to_string()),
        );
        assert!(browser.navigate("https://portal.test/login").await.is_err());
        browser.navigate("https://portal.test/login").await.unwrap();
        assert_eq!(browser.url(), "https://portal.test/login");
    }
}
