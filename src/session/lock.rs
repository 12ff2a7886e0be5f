//! 会话锁管理
//!
//! 基于 RecordStore 的 CAS 原语实现跨 worker 互斥：
//! - 只有锁不存在或已过期时才能写入新锁（随机令牌 + 持有者 + 到期时间）
//! - 续期、释放都要求令牌匹配；释放别人的锁是空操作
//! - 本进程"认为持有"的锁只是缓存，续期失败立即丢弃

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::core::{Clock, PortalError, PortalResult};
use crate::store::{RecordStore, SessionLock};

struct LockInner {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    holder: String,
    poll_interval: Duration,
    default_ttl: Duration,
    held: RwLock<HashMap<String, SessionLock>>,
}

/// 会话锁管理器（可克隆，内部共享）
#[derive(Clone)]
pub struct SessionLockManager {
    inner: Arc<LockInner>,
}

impl SessionLockManager {
    pub fn new(
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        holder: impl Into<String>,
        default_ttl: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(LockInner {
                store,
                clock,
                holder: holder.into(),
                poll_interval,
                default_ttl,
                held: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn holder(&self) -> &str {
        &self.inner.holder
    }

    pub fn default_ttl(&self) -> Duration {
        self.inner.default_ttl
    }

    /// 轮询获取锁，超时返回 LockTimeout
    pub async fn acquire(
        &self,
        session_id: &str,
        ttl: Duration,
        timeout: Duration,
    ) -> PortalResult<LockGuard> {
        let started = tokio::time::Instant::now();
        loop {
            if let Some(lock) = self.try_acquire(session_id, ttl).await? {
                return Ok(LockGuard::new(self.clone(), lock));
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                tracing::debug!(session_id = %session_id, "lock acquisition timed out");
                return Err(PortalError::LockTimeout {
                    session_id: session_id.to_string(),
                    waited_ms: elapsed.as_millis() as u64,
                });
            }
            tokio::time::sleep(self.inner.poll_interval.min(timeout - elapsed)).await;
        }
    }

    /// 单次 CAS 尝试
    pub async fn try_acquire(
        &self,
        session_id: &str,
        ttl: Duration,
    ) -> PortalResult<Option<SessionLock>> {
        let now = self.inner.clock.now_ms();
        let lock = SessionLock {
            session_id: session_id.to_string(),
            token: format!("lock_{}", uuid::Uuid::new_v4().simple()),
            holder: self.inner.holder.clone(),
            expires_at: now + ttl.as_millis() as i64,
        };
        if !self.inner.store.try_acquire_lock(&lock, now).await? {
            return Ok(None);
        }
        tracing::debug!(session_id = %session_id, holder = %lock.holder, "session lock acquired");
        self.inner
            .held
            .write()
            .await
            .insert(session_id.to_string(), lock.clone());
        Ok(Some(lock))
    }

    /// 续期；成功时更新 lock.expires_at，失败时丢弃本地持有记录
    pub async fn renew(&self, lock: &mut SessionLock, ttl: Duration) -> PortalResult<bool> {
        let now = self.inner.clock.now_ms();
        let expires_at = now + ttl.as_millis() as i64;
        let renewed = self
            .inner
            .store
            .renew_lock(&lock.session_id, &lock.token, expires_at, now)
            .await;

        let mut held = self.inner.held.write().await;
        match renewed {
            Ok(true) => {
                lock.expires_at = expires_at;
                if let Some(entry) = held.get_mut(&lock.session_id) {
                    if entry.token == lock.token {
                        entry.expires_at = expires_at;
                    }
                }
                Ok(true)
            }
            Ok(false) => {
                tracing::warn!(session_id = %lock.session_id, "session lock renewal rejected, ownership lost");
                Self::forget(&mut held, lock);
                Ok(false)
            }
            Err(e) => {
                Self::forget(&mut held, lock);
                Err(e.into())
            }
        }
    }

    fn forget(held: &mut HashMap<String, SessionLock>, lock: &SessionLock) {
        if held
            .get(&lock.session_id)
            .map_or(false, |l| l.token == lock.token)
        {
            held.remove(&lock.session_id);
        }
    }

    /// 释放；令牌不匹配返回 false
    pub async fn release(&self, lock: &SessionLock) -> PortalResult<bool> {
        let released = self
            .inner
            .store
            .release_lock(&lock.session_id, &lock.token)
            .await?;
        Self::forget(&mut *self.inner.held.write().await, lock);
        if released {
            tracing::debug!(session_id = %lock.session_id, "session lock released");
        }
        Ok(released)
    }

    /// 清除所有过期锁（不论持有者），同时丢弃本地已过期的持有记录
    pub async fn sweep_expired(&self) -> PortalResult<usize> {
        let now = self.inner.clock.now_ms();
        let cleared = self.inner.store.clear_expired_locks(now).await?;
        self.inner
            .held
            .write()
            .await
            .retain(|_, lock| !lock.is_expired(now));
        if cleared > 0 {
            tracing::info!(cleared, "cleared expired session locks");
        }
        Ok(cleared)
    }

    /// 续期本进程持有的全部锁，返回丢失的数量
    pub async fn renew_held(&self) -> usize {
        let ttl = self.inner.default_ttl;
        let mut lost = 0;
        for mut lock in self.held_locks().await {
            match self.renew(&mut lock, ttl).await {
                Ok(true) => {}
                Ok(false) => lost += 1,
                Err(e) => {
                    tracing::warn!(session_id = %lock.session_id, "session lock renewal failed: {}", e);
                    lost += 1;
                }
            }
        }
        lost
    }

    pub async fn held_locks(&self) -> Vec<SessionLock> {
        self.inner.held.read().await.values().cloned().collect()
    }

    pub async fn is_held(&self, session_id: &str) -> bool {
        let now = self.inner.clock.now_ms();
        self.inner
            .held
            .read()
            .await
            .get(session_id)
            .map_or(false, |l| !l.is_expired(now))
    }

    /// 关闭时释放全部持有的锁
    pub async fn release_all(&self) -> PortalResult<usize> {
        let mut released = 0;
        for lock in self.held_locks().await {
            if self.release(&lock).await? {
                released += 1;
            }
        }
        Ok(released)
    }
}

/// 作用域锁：显式 `release().await`；未释放就被 drop 时异步补一次释放
pub struct LockGuard {
    manager: SessionLockManager,
    lock: SessionLock,
    released: bool,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("lock", &self.lock)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl LockGuard {
    fn new(manager: SessionLockManager, lock: SessionLock) -> Self {
        Self {
            manager,
            lock,
            released: false,
        }
    }

    pub fn lock(&self) -> &SessionLock {
        &self.lock
    }

    pub fn session_id(&self) -> &str {
        &self.lock.session_id
    }

    pub fn token(&self) -> &str {
        &self.lock.token
    }

    pub async fn renew(&mut self) -> PortalResult<bool> {
        let ttl = self.manager.default_ttl();
        self.manager.renew(&mut self.lock, ttl).await
    }

    pub async fn release(mut self) -> PortalResult<bool> {
        self.released = true;
        self.manager.release(&self.lock).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let manager = self.manager.clone();
        let lock = self.lock.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = manager.release(&lock).await {
                        tracing::warn!(session_id = %lock.session_id, "deferred lock release failed: {}", e);
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    session_id = %lock.session_id,
                    "lock guard dropped outside runtime, lock will expire by ttl"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ManualClock;
    use crate::store::{MemoryStore, PortalSession, SessionPolicy};

    async fn setup() -> (Arc<dyn RecordStore>, Arc<ManualClock>, String) {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let session = PortalSession::new("org", "anthem", "Anthem", "main", SessionPolicy::default(), 1_000_000);
        store.insert_session(&session).await.unwrap();
        (store, clock, session.id)
    }

    fn manager(store: &Arc<dyn RecordStore>, clock: &Arc<ManualClock>, holder: &str) -> SessionLockManager {
        SessionLockManager::new(
            store.clone(),
            clock.clone(),
            holder,
            Duration::from_secs(300),
            Duration::from_millis(250),
        )
    }

    #[tokio::test]
    async fn test_second_holder_blocked_until_expiry() {
        let (store, clock, id) = setup().await;
        let a = manager(&store, &clock, "worker-a");
        let b = manager(&store, &clock, "worker-b");

        let mut lock_a = a.try_acquire(&id, Duration::from_secs(60)).await.unwrap().unwrap();
        assert!(b.try_acquire(&id, Duration::from_secs(60)).await.unwrap().is_none());

        clock.advance_secs(60);
        let lock_b = b.try_acquire(&id, Duration::from_secs(60)).await.unwrap();
        assert!(lock_b.is_some());

        // a 的令牌已被替换：续期失败，本地记录被丢弃
        assert!(!a.renew(&mut lock_a, Duration::from_secs(60)).await.unwrap());
        assert!(!a.is_held(&id).await);
        assert!(b.is_held(&id).await);
    }

    #[tokio::test]
    async fn test_renew_extends_expiry() {
        let (store, clock, id) = setup().await;
        let a = manager(&store, &clock, "worker-a");
        let mut lock = a.try_acquire(&id, Duration::from_secs(60)).await.unwrap().unwrap();
        clock.advance_secs(30);
        assert!(a.renew(&mut lock, Duration::from_secs(60)).await.unwrap());
        assert_eq!(lock.expires_at, clock.now_ms() + 60_000);
    }

    #[tokio::test]
    async fn test_release_with_foreign_token_is_noop() {
        let (store, clock, id) = setup().await;
        let a = manager(&store, &clock, "worker-a");
        let b = manager(&store, &clock, "worker-b");
        let lock = a.try_acquire(&id, Duration::from_secs(60)).await.unwrap().unwrap();

        let forged = SessionLock {
            token: "lock_forged".to_string(),
            ..lock.clone()
        };
        assert!(!b.release(&forged).await.unwrap());
        assert!(b.try_acquire(&id, Duration::from_secs(60)).await.unwrap().is_none());

        assert!(a.release(&lock).await.unwrap());
        assert!(b.try_acquire(&id, Duration::from_secs(60)).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out() {
        let (store, clock, id) = setup().await;
        let a = manager(&store, &clock, "worker-a");
        let b = manager(&store, &clock, "worker-b");
        let _guard = a
            .acquire(&id, Duration::from_secs(60), Duration::from_secs(1))
            .await
            .unwrap();

        let err = b
            .acquire(&id, Duration::from_secs(60), Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PortalError::LockTimeout { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_acquire_single_winner() {
        let (store, clock, id) = setup().await;
        let mut handles = Vec::new();
        for i in 0..16 {
            let m = manager(&store, &clock, &format!("worker-{}", i));
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                m.try_acquire(&id, Duration::from_secs(60)).await.unwrap().is_some()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_dropped_guard_releases_lock() {
        let (store, clock, id) = setup().await;
        let a = manager(&store, &clock, "worker-a");
        let b = manager(&store, &clock, "worker-b");
        {
            let _guard = a
                .acquire(&id, Duration::from_secs(60), Duration::from_secs(1))
                .await
                .unwrap();
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(b.try_acquire(&id, Duration::from_secs(60)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sweep_and_renew_held() {
        let (store, clock, id) = setup().await;
        let a = manager(&store, &clock, "worker-a");
        a.try_acquire(&id, Duration::from_secs(10)).await.unwrap().unwrap();

        assert_eq!(a.renew_held().await, 0);
        clock.advance_secs(400);
        assert_eq!(a.sweep_expired().await.unwrap(), 1);
        assert!(a.held_locks().await.is_empty());
        assert_eq!(a.release_all().await.unwrap(), 0);
    }
}
