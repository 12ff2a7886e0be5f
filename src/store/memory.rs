//! 内存记录存储
//!
//! 每类记录一张 RwLock<HashMap>；锁 CAS 在同一把写锁内完成判断与写入。

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    FailedJobRecord, FailedJobStatus, InterventionTicket, OtpAttempt, OtpFilter, PortalSession,
    RecordStore, SessionLock, SessionStatus, StoreError, StoreResult, TicketFilter, WorkflowRun,
};

#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<String, PortalSession>>,
    otp_attempts: RwLock<HashMap<String, OtpAttempt>>,
    runs: RwLock<HashMap<String, WorkflowRun>>,
    tickets: RwLock<HashMap<String, InterventionTicket>>,
    failed_jobs: RwLock<HashMap<String, FailedJobRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn insert_unique<T: Clone>(map: &mut HashMap<String, T>, id: &str, value: &T) -> StoreResult<()> {
    if map.contains_key(id) {
        return Err(StoreError::Duplicate(id.to_string()));
    }
    map.insert(id.to_string(), value.clone());
    Ok(())
}

fn replace_existing<T: Clone>(map: &mut HashMap<String, T>, id: &str, value: &T) -> StoreResult<()> {
    match map.get_mut(id) {
        Some(slot) => {
            *slot = value.clone();
            Ok(())
        }
        None => Err(StoreError::NotFound(id.to_string())),
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert_session(&self, session: &PortalSession) -> StoreResult<()> {
        let mut sessions = self.sessions.write().await;
        insert_unique(&mut sessions, &session.id, session)
    }

    async fn get_session(&self, session_id: &str) -> StoreResult<Option<PortalSession>> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn find_sessions(
        &self,
        organization_id: &str,
        payer_id: &str,
    ) -> StoreResult<Vec<PortalSession>> {
        let sessions = self.sessions.read().await;
        let mut found: Vec<PortalSession> = sessions
            .values()
            .filter(|s| s.organization_id == organization_id && s.payer_id == payer_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(found)
    }

    async fn sessions_with_status(&self, status: SessionStatus) -> StoreResult<Vec<PortalSession>> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect())
    }

    async fn update_session(&self, session: &mut PortalSession) -> StoreResult<()> {
        let mut sessions = self.sessions.write().await;
        let stored = sessions
            .get_mut(&session.id)
            .ok_or_else(|| StoreError::NotFound(session.id.clone()))?;
        if stored.version != session.version {
            return Err(StoreError::VersionConflict(session.id.clone()));
        }
        let lock = stored.lock.clone();
        session.version += 1;
        *stored = session.clone();
        stored.lock = lock.clone();
        session.lock = lock;
        Ok(())
    }

    async fn try_acquire_lock(&self, lock: &SessionLock, now_ms: i64) -> StoreResult<bool> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&lock.session_id)
            .ok_or_else(|| StoreError::NotFound(lock.session_id.clone()))?;
        let free = session
            .lock
            .as_ref()
            .map_or(true, |existing| existing.is_expired(now_ms));
        if free {
            session.lock = Some(lock.clone());
        }
        Ok(free)
    }

    async fn renew_lock(
        &self,
        session_id: &str,
        token: &str,
        expires_at: i64,
        now_ms: i64,
    ) -> StoreResult<bool> {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(session_id) else {
            return Ok(false);
        };
        match session.lock.as_mut() {
            Some(lock) if lock.token == token && !lock.is_expired(now_ms) => {
                lock.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lock(&self, session_id: &str, token: &str) -> StoreResult<bool> {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(session_id) else {
            return Ok(false);
        };
        if session.lock.as_ref().map_or(false, |l| l.token == token) {
            session.lock = None;
            return Ok(true);
        }
        Ok(false)
    }

    async fn clear_expired_locks(&self, now_ms: i64) -> StoreResult<usize> {
        let mut sessions = self.sessions.write().await;
        let mut cleared = 0;
        for session in sessions.values_mut() {
            if session.lock.as_ref().map_or(false, |l| l.is_expired(now_ms)) {
                session.lock = None;
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    async fn insert_otp_attempt(&self, attempt: &OtpAttempt) -> StoreResult<()> {
        let mut attempts = self.otp_attempts.write().await;
        insert_unique(&mut attempts, &attempt.id, attempt)
    }

    async fn get_otp_attempt(&self, attempt_id: &str) -> StoreResult<Option<OtpAttempt>> {
        Ok(self.otp_attempts.read().await.get(attempt_id).cloned())
    }

    async fn update_otp_attempt(&self, attempt: &OtpAttempt) -> StoreResult<()> {
        let mut attempts = self.otp_attempts.write().await;
        replace_existing(&mut attempts, &attempt.id, attempt)
    }

    async fn list_otp_attempts(&self, filter: &OtpFilter) -> StoreResult<Vec<OtpAttempt>> {
        let attempts = self.otp_attempts.read().await;
        let mut found: Vec<OtpAttempt> = attempts
            .values()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(found)
    }

    async fn insert_run(&self, run: &WorkflowRun) -> StoreResult<()> {
        let mut runs = self.runs.write().await;
        insert_unique(&mut runs, &run.id, run)
    }

    async fn get_run(&self, run_id: &str) -> StoreResult<Option<WorkflowRun>> {
        Ok(self.runs.read().await.get(run_id).cloned())
    }

    async fn update_run(&self, run: &WorkflowRun) -> StoreResult<()> {
        let mut runs = self.runs.write().await;
        replace_existing(&mut runs, &run.id, run)
    }

    async fn runs_for_reference(&self, reference_id: &str) -> StoreResult<Vec<WorkflowRun>> {
        let runs = self.runs.read().await;
        let mut found: Vec<WorkflowRun> = runs
            .values()
            .filter(|r| r.reference_id == reference_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(found)
    }

    async fn insert_ticket(&self, ticket: &InterventionTicket) -> StoreResult<()> {
        let mut tickets = self.tickets.write().await;
        insert_unique(&mut tickets, &ticket.id, ticket)
    }

    async fn get_ticket(&self, ticket_id: &str) -> StoreResult<Option<InterventionTicket>> {
        Ok(self.tickets.read().await.get(ticket_id).cloned())
    }

    async fn update_ticket(&self, ticket: &InterventionTicket) -> StoreResult<()> {
        let mut tickets = self.tickets.write().await;
        replace_existing(&mut tickets, &ticket.id, ticket)
    }

    async fn list_tickets(&self, filter: &TicketFilter) -> StoreResult<Vec<InterventionTicket>> {
        let tickets = self.tickets.read().await;
        let mut found: Vec<InterventionTicket> = tickets
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(found)
    }

    async fn insert_failed_job(&self, job: &FailedJobRecord) -> StoreResult<()> {
        let mut jobs = self.failed_jobs.write().await;
        insert_unique(&mut jobs, &job.id, job)
    }

    async fn get_failed_job(&self, job_id: &str) -> StoreResult<Option<FailedJobRecord>> {
        Ok(self.failed_jobs.read().await.get(job_id).cloned())
    }

    async fn update_failed_job(&self, job: &FailedJobRecord) -> StoreResult<()> {
        let mut jobs = self.failed_jobs.write().await;
        replace_existing(&mut jobs, &job.id, job)
    }

    async fn delete_failed_job(&self, job_id: &str) -> StoreResult<bool> {
        Ok(self.failed_jobs.write().await.remove(job_id).is_some())
    }

    async fn claim_failed_job(
        &self,
        job_id: &str,
        from: FailedJobStatus,
        to: FailedJobStatus,
        now_ms: i64,
    ) -> StoreResult<bool> {
        let mut jobs = self.failed_jobs.write().await;
        match jobs.get_mut(job_id) {
            Some(job) if job.status == from => {
                job.status = to;
                job.updated_at = now_ms;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn due_failed_jobs(&self, now_ms: i64) -> StoreResult<Vec<FailedJobRecord>> {
        let jobs = self.failed_jobs.read().await;
        let mut due: Vec<FailedJobRecord> = jobs
            .values()
            .filter(|j| j.status == FailedJobStatus::Scheduled && j.is_due(now_ms))
            .cloned()
            .collect();
        due.sort_by_key(|j| j.next_retry_at.unwrap_or(i64::MAX));
        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SessionPolicy;

    fn session() -> PortalSession {
        PortalSession::new("org_1", "anthem", "Anthem", "main", SessionPolicy::default(), 0)
    }

    fn lock(session_id: &str, token: &str, expires_at: i64) -> SessionLock {
        SessionLock {
            session_id: session_id.to_string(),
            token: token.to_string(),
            holder: "worker-a".to_string(),
            expires_at,
        }
    }

    #[tokio::test]
    async fn test_lock_cas_respects_expiry() {
        let store = MemoryStore::new();
        let s = session();
        store.insert_session(&s).await.unwrap();

        assert!(store.try_acquire_lock(&lock(&s.id, "t1", 1_000), 0).await.unwrap());
        assert!(!store.try_acquire_lock(&lock(&s.id, "t2", 2_000), 500).await.unwrap());
        // 到期后可被替换
        assert!(store.try_acquire_lock(&lock(&s.id, "t2", 3_000), 1_000).await.unwrap());
        assert!(!store.renew_lock(&s.id, "t1", 5_000, 1_100).await.unwrap());
        assert!(store.renew_lock(&s.id, "t2", 5_000, 1_100).await.unwrap());
        assert!(!store.release_lock(&s.id, "t1").await.unwrap());
        assert!(store.release_lock(&s.id, "t2").await.unwrap());
    }

    #[tokio::test]
    async fn test_update_session_preserves_lock_and_checks_version() {
        let store = MemoryStore::new();
        let mut s = session();
        store.insert_session(&s).await.unwrap();
        store.try_acquire_lock(&lock(&s.id, "t1", 10_000), 0).await.unwrap();

        s.cookies = Some("sid=1".to_string());
        store.update_session(&mut s).await.unwrap();
        assert_eq!(s.version, 1);

        let stored = store.get_session(&s.id).await.unwrap().unwrap();
        assert_eq!(stored.cookies.as_deref(), Some("sid=1"));
        assert_eq!(stored.lock.clone().map(|l| l.token), Some("t1".to_string()));

        let mut stale = stored.clone();
        stale.version = 0;
        let err = store.update_session(&mut stale).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict(_)));
    }

    #[tokio::test]
    async fn test_clear_expired_locks() {
        let store = MemoryStore::new();
        let a = session();
        let b = session();
        store.insert_session(&a).await.unwrap();
        store.insert_session(&b).await.unwrap();
        store.try_acquire_lock(&lock(&a.id, "ta", 100), 0).await.unwrap();
        store.try_acquire_lock(&lock(&b.id, "tb", 10_000), 0).await.unwrap();

        assert_eq!(store.clear_expired_locks(200).await.unwrap(), 1);
        assert!(store.get_session(&a.id).await.unwrap().unwrap().lock.is_none());
        assert!(store.get_session(&b.id).await.unwrap().unwrap().lock.is_some());
    }

    #[tokio::test]
    async fn test_claim_failed_job_only_from_expected_status() {
        let store = MemoryStore::new();
        let job = FailedJobRecord::new("org_1", "anthem", serde_json::json!({}), 3, 0);
        store.insert_failed_job(&job).await.unwrap();

        assert!(store
            .claim_failed_job(&job.id, FailedJobStatus::Scheduled, FailedJobStatus::Retrying, 10)
            .await
            .unwrap());
        assert!(!store
            .claim_failed_job(&job.id, FailedJobStatus::Scheduled, FailedJobStatus::Retrying, 20)
            .await
            .unwrap());
        assert!(!store
            .claim_failed_job("job_missing", FailedJobStatus::Scheduled, FailedJobStatus::Retrying, 20)
            .await
            .unwrap());
        let stored = store.get_failed_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, FailedJobStatus::Retrying);
        assert_eq!(stored.updated_at, 10);
    }
}
