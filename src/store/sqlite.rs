//! SQLite 记录存储（rusqlite）
//!
//! 索引字段单独成列，其余字段以 JSON 存入 body。会话锁的获取、续期、释放、过期清理
//! 都是一条带条件的 `UPDATE ... WHERE`，由 SQLite 保证原子性，受影响行数即 CAS 结果。

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::de::DeserializeOwned;

use super::{
    FailedJobRecord, FailedJobStatus, InterventionTicket, OtpAttempt, OtpFilter, PortalSession,
    RecordStore, SessionLock, SessionStatus, StoreError, StoreResult, TicketFilter, WorkflowRun,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS portal_sessions (
    id TEXT PRIMARY KEY,
    organization_id TEXT NOT NULL,
    payer_id TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    lock_token TEXT,
    lock_holder TEXT,
    lock_expires_at INTEGER,
    version INTEGER NOT NULL DEFAULT 0,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_owner ON portal_sessions(organization_id, payer_id);
CREATE INDEX IF NOT EXISTS idx_sessions_status ON portal_sessions(status);

CREATE TABLE IF NOT EXISTS otp_attempts (
    id TEXT PRIMARY KEY,
    phone_hash TEXT NOT NULL,
    purpose TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_otp_phone ON otp_attempts(phone_hash, created_at);

CREATE TABLE IF NOT EXISTS workflow_runs (
    id TEXT PRIMARY KEY,
    reference_id TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_runs_reference ON workflow_runs(reference_id);

CREATE TABLE IF NOT EXISTS intervention_tickets (
    id TEXT PRIMARY KEY,
    organization_id TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tickets_org ON intervention_tickets(organization_id, status);

CREATE TABLE IF NOT EXISTS failed_jobs (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    next_retry_at INTEGER,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_failed_jobs_due ON failed_jobs(status, next_retry_at);
";

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation => {
                StoreError::Duplicate(e.to_string())
            }
            _ => StoreError::Backend(e.to_string()),
        }
    }
}

type SessionRow = (String, Option<String>, Option<String>, Option<i64>, i64);

const SESSION_COLUMNS: &str = "body, lock_token, lock_holder, lock_expires_at, version";

fn session_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn decode_session(raw: SessionRow) -> StoreResult<PortalSession> {
    let (body, token, holder, expires_at, version) = raw;
    let mut session: PortalSession = serde_json::from_str(&body)?;
    session.version = version;
    session.lock = match (token, holder, expires_at) {
        (Some(token), Some(holder), Some(expires_at)) => Some(SessionLock {
            session_id: session.id.clone(),
            token,
            holder,
            expires_at,
        }),
        _ => None,
    };
    Ok(session)
}

/// 锁字段不进 body，避免与列值不一致
fn session_body(session: &PortalSession) -> StoreResult<String> {
    let mut body = session.clone();
    body.lock = None;
    Ok(serde_json::to_string(&body)?)
}

fn decode_bodies<T: DeserializeOwned>(bodies: Vec<String>) -> StoreResult<Vec<T>> {
    bodies
        .iter()
        .map(|b| serde_json::from_str(b).map_err(StoreError::from))
        .collect()
}

/// SQLite 存储：单连接 + 互斥锁
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StoreError::Backend("sqlite connection poisoned".to_string()))?;
        f(&conn)
    }

    fn get_body<T: DeserializeOwned>(&self, table: &str, id: &str) -> StoreResult<Option<T>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT body FROM {table} WHERE id = ?1");
            let body: Option<String> = conn
                .query_row(&sql, params![id], |row| row.get(0))
                .optional()?;
            body.map(|b| serde_json::from_str(&b))
                .transpose()
                .map_err(StoreError::from)
        })
    }

    fn query_sessions(
        &self,
        where_clause: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> StoreResult<Vec<PortalSession>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {SESSION_COLUMNS} FROM portal_sessions WHERE {where_clause} ORDER BY created_at DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(args, session_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(decode_session).collect()
        })
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn insert_session(&self, session: &PortalSession) -> StoreResult<()> {
        let body = session_body(session)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO portal_sessions
                 (id, organization_id, payer_id, status, created_at, lock_token, lock_holder, lock_expires_at, version, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    session.id,
                    session.organization_id,
                    session.payer_id,
                    session.status.as_str(),
                    session.created_at,
                    session.lock.as_ref().map(|l| l.token.clone()),
                    session.lock.as_ref().map(|l| l.holder.clone()),
                    session.lock.as_ref().map(|l| l.expires_at),
                    session.version,
                    body,
                ],
            )?;
            Ok(())
        })
    }

    async fn get_session(&self, session_id: &str) -> StoreResult<Option<PortalSession>> {
        Ok(self
            .query_sessions("id = ?1", &[&session_id])?
            .into_iter()
            .next())
    }

    async fn find_sessions(
        &self,
        organization_id: &str,
        payer_id: &str,
    ) -> StoreResult<Vec<PortalSession>> {
        self.query_sessions(
            "organization_id = ?1 AND payer_id = ?2",
            &[&organization_id, &payer_id],
        )
    }

    async fn sessions_with_status(&self, status: SessionStatus) -> StoreResult<Vec<PortalSession>> {
        self.query_sessions("status = ?1", &[&status.as_str()])
    }

    async fn update_session(&self, session: &mut PortalSession) -> StoreResult<()> {
        let body = session_body(session)?;
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE portal_sessions SET status = ?1, body = ?2, version = version + 1
                 WHERE id = ?3 AND version = ?4",
                params![session.status.as_str(), body, session.id, session.version],
            )?;
            if updated == 0 {
                let exists: Option<i64> = conn
                    .query_row(
                        "SELECT 1 FROM portal_sessions WHERE id = ?1",
                        params![session.id],
                        |row| row.get(0),
                    )
                    .optional()?;
                return Err(match exists {
                    Some(_) => StoreError::VersionConflict(session.id.clone()),
                    None => StoreError::NotFound(session.id.clone()),
                });
            }
            session.version += 1;
            Ok(())
        })
    }

    async fn try_acquire_lock(&self, lock: &SessionLock, now_ms: i64) -> StoreResult<bool> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE portal_sessions
                 SET lock_token = ?1, lock_holder = ?2, lock_expires_at = ?3
                 WHERE id = ?4 AND (lock_token IS NULL OR lock_expires_at <= ?5)",
                params![lock.token, lock.holder, lock.expires_at, lock.session_id, now_ms],
            )?;
            if updated == 0 {
                let exists: Option<i64> = conn
                    .query_row(
                        "SELECT 1 FROM portal_sessions WHERE id = ?1",
                        params![lock.session_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if exists.is_none() {
                    return Err(StoreError::NotFound(lock.session_id.clone()));
                }
            }
            Ok(updated == 1)
        })
    }

    async fn renew_lock(
        &self,
        session_id: &str,
        token: &str,
        expires_at: i64,
        now_ms: i64,
    ) -> StoreResult<bool> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE portal_sessions SET lock_expires_at = ?1
                 WHERE id = ?2 AND lock_token = ?3 AND lock_expires_at > ?4",
                params![expires_at, session_id, token, now_ms],
            )?;
            Ok(updated == 1)
        })
    }

    async fn release_lock(&self, session_id: &str, token: &str) -> StoreResult<bool> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE portal_sessions
                 SET lock_token = NULL, lock_holder = NULL, lock_expires_at = NULL
                 WHERE id = ?1 AND lock_token = ?2",
                params![session_id, token],
            )?;
            Ok(updated == 1)
        })
    }

    async fn clear_expired_locks(&self, now_ms: i64) -> StoreResult<usize> {
        self.with_conn(|conn| {
            let cleared = conn.execute(
                "UPDATE portal_sessions
                 SET lock_token = NULL, lock_holder = NULL, lock_expires_at = NULL
                 WHERE lock_token IS NOT NULL AND lock_expires_at <= ?1",
                params![now_ms],
            )?;
            Ok(cleared)
        })
    }

    async fn insert_otp_attempt(&self, attempt: &OtpAttempt) -> StoreResult<()> {
        let body = serde_json::to_string(attempt)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO otp_attempts (id, phone_hash, purpose, status, created_at, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    attempt.id,
                    attempt.phone_hash,
                    attempt.purpose,
                    attempt.status.as_str(),
                    attempt.created_at,
                    body
                ],
            )?;
            Ok(())
        })
    }

    async fn get_otp_attempt(&self, attempt_id: &str) -> StoreResult<Option<OtpAttempt>> {
        self.get_body("otp_attempts", attempt_id)
    }

    async fn update_otp_attempt(&self, attempt: &OtpAttempt) -> StoreResult<()> {
        let body = serde_json::to_string(attempt)?;
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE otp_attempts SET status = ?1, body = ?2 WHERE id = ?3",
                params![attempt.status.as_str(), body, attempt.id],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(attempt.id.clone()));
            }
            Ok(())
        })
    }

    async fn list_otp_attempts(&self, filter: &OtpFilter) -> StoreResult<Vec<OtpAttempt>> {
        let bodies = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT body FROM otp_attempts
                 WHERE (?1 IS NULL OR phone_hash = ?1)
                   AND (?2 IS NULL OR purpose = ?2)
                   AND (?3 IS NULL OR status = ?3)
                   AND (?4 IS NULL OR created_at >= ?4)
                 ORDER BY created_at DESC",
            )?;
            let rows = stmt
                .query_map(
                    params![
                        filter.phone_hash,
                        filter.purpose,
                        filter.status.map(|s| s.as_str()),
                        filter.created_after
                    ],
                    |row| row.get::<_, String>(0),
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        decode_bodies(bodies)
    }

    async fn insert_run(&self, run: &WorkflowRun) -> StoreResult<()> {
        let body = serde_json::to_string(run)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO workflow_runs (id, reference_id, created_at, body) VALUES (?1, ?2, ?3, ?4)",
                params![run.id, run.reference_id, run.created_at, body],
            )?;
            Ok(())
        })
    }

    async fn get_run(&self, run_id: &str) -> StoreResult<Option<WorkflowRun>> {
        self.get_body("workflow_runs", run_id)
    }

    async fn update_run(&self, run: &WorkflowRun) -> StoreResult<()> {
        let body = serde_json::to_string(run)?;
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE workflow_runs SET body = ?1 WHERE id = ?2",
                params![body, run.id],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(run.id.clone()));
            }
            Ok(())
        })
    }

    async fn runs_for_reference(&self, reference_id: &str) -> StoreResult<Vec<WorkflowRun>> {
        let bodies = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT body FROM workflow_runs WHERE reference_id = ?1 ORDER BY created_at DESC",
            )?;
            let rows = stmt
                .query_map(params![reference_id], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        decode_bodies(bodies)
    }

    async fn insert_ticket(&self, ticket: &InterventionTicket) -> StoreResult<()> {
        let body = serde_json::to_string(ticket)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO intervention_tickets (id, organization_id, status, created_at, body)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    ticket.id,
                    ticket.organization_id,
                    ticket.status.as_str(),
                    ticket.created_at,
                    body
                ],
            )?;
            Ok(())
        })
    }

    async fn get_ticket(&self, ticket_id: &str) -> StoreResult<Option<InterventionTicket>> {
        self.get_body("intervention_tickets", ticket_id)
    }

    async fn update_ticket(&self, ticket: &InterventionTicket) -> StoreResult<()> {
        let body = serde_json::to_string(ticket)?;
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE intervention_tickets SET status = ?1, body = ?2 WHERE id = ?3",
                params![ticket.status.as_str(), body, ticket.id],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(ticket.id.clone()));
            }
            Ok(())
        })
    }

    async fn list_tickets(&self, filter: &TicketFilter) -> StoreResult<Vec<InterventionTicket>> {
        let bodies = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT body FROM intervention_tickets
                 WHERE (?1 IS NULL OR organization_id = ?1)
                 ORDER BY created_at ASC",
            )?;
            let rows = stmt
                .query_map(params![filter.organization_id], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        let tickets: Vec<InterventionTicket> = decode_bodies(bodies)?;
        Ok(tickets.into_iter().filter(|t| filter.matches(t)).collect())
    }

    async fn insert_failed_job(&self, job: &FailedJobRecord) -> StoreResult<()> {
        let body = serde_json::to_string(job)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO failed_jobs (id, status, next_retry_at, body) VALUES (?1, ?2, ?3, ?4)",
                params![job.id, job.status.as_str(), job.next_retry_at, body],
            )?;
            Ok(())
        })
    }

    async fn get_failed_job(&self, job_id: &str) -> StoreResult<Option<FailedJobRecord>> {
        self.get_body("failed_jobs", job_id)
    }

    async fn update_failed_job(&self, job: &FailedJobRecord) -> StoreResult<()> {
        let body = serde_json::to_string(job)?;
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE failed_jobs SET status = ?1, next_retry_at = ?2, body = ?3 WHERE id = ?4",
                params![job.status.as_str(), job.next_retry_at, body, job.id],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(job.id.clone()));
            }
            Ok(())
        })
    }

    async fn delete_failed_job(&self, job_id: &str) -> StoreResult<bool> {
        self.with_conn(|conn| {
            let deleted = conn.execute("DELETE FROM failed_jobs WHERE id = ?1", params![job_id])?;
            Ok(deleted == 1)
        })
    }

    async fn claim_failed_job(
        &self,
        job_id: &str,
        from: FailedJobStatus,
        to: FailedJobStatus,
        now_ms: i64,
    ) -> StoreResult<bool> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE failed_jobs
                 SET status = ?1, body = json_set(body, '$.status', ?1, '$.updated_at', ?2)
                 WHERE id = ?3 AND status = ?4",
                params![to.as_str(), now_ms, job_id, from.as_str()],
            )?;
            Ok(updated == 1)
        })
    }

    async fn due_failed_jobs(&self, now_ms: i64) -> StoreResult<Vec<FailedJobRecord>> {
        let bodies = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT body FROM failed_jobs
                 WHERE status = 'scheduled' AND next_retry_at IS NOT NULL AND next_retry_at <= ?1
                 ORDER BY next_retry_at ASC",
            )?;
            let rows = stmt
                .query_map(params![now_ms], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        decode_bodies(bodies)
    }
}
