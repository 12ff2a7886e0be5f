//! 时间源抽象
//!
//! 所有过期 / 年龄 / 不活跃判断都经过 Clock，测试用 ManualClock 推进时间，无需真实等待。

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

/// 毫秒级时间源
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// 系统时钟（chrono UTC 毫秒时间戳）
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// 手动时钟
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
        }
    }

    pub fn set(&self, ms: i64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn advance_secs(&self, secs: i64) {
        self.advance_ms(secs * 1000);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(chrono::Utc::now().timestamp_millis())
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// 嵌套等待的上限：自身超时与外层截止时间的剩余量取小
pub fn bounded(own: Duration, deadline: Option<Instant>) -> Duration {
    match deadline {
        Some(deadline) => own.min(deadline.saturating_duration_since(Instant::now())),
        None => own,
    }
}
