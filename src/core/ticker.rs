//! 周期任务抽象：ticker + CancellationToken
//!
//! 保活、锁清扫、工单超时扫描等后台循环都通过 `spawn_periodic` 启动，生命周期由取消令牌显式控制。

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// 启动一个周期任务：首个 tick 在一个周期之后；取消令牌触发后退出循环
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    every: Duration,
    token: CancellationToken,
    mut task: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + every;
        let mut ticker = tokio::time::interval_at(start, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::debug!(task = name, every_ms = every.as_millis() as u64, "periodic task started");
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!(task = name, "periodic task stopped");
                    break;
                }
                _ = ticker.tick() => {
                    task().await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_periodic_task_ticks_until_cancelled() {
        let count = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();

        let counter = Arc::clone(&count);
        let handle = spawn_periodic("test", Duration::from_secs(10), token.clone(), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        token.cancel();
        handle.await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
