//! SQLite-backed job queue.

use chrono::Duration;
use coursehub_core::time::{fmt_ts, parse_opt_ts, parse_ts};
use coursehub_core::{Clock, CourseHubError, Result};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params, params_from_iter};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::job::{
    CleanReport, EnqueueOptions, FailOutcome, Job, JobStatus, QueueStats, RetentionPolicy, RetryPolicy,
};

const JOB_SELECT: &str = "SELECT id, job_type, payload, priority, status, attempts, max_attempts, run_at, \
     progress, last_error, result, dedup_key, locked_by, locked_at, created_at, updated_at, finished_at \
     FROM notification_jobs";

struct JobRow {
    id: String,
    job_type: String,
    payload: String,
    priority: i32,
    status: String,
    attempts: u32,
    max_attempts: u32,
    run_at: String,
    progress: u8,
    last_error: Option<String>,
    result: Option<String>,
    dedup_key: Option<String>,
    locked_by: Option<String>,
    locked_at: Option<String>,
    created_at: String,
    updated_at: String,
    finished_at: Option<String>,
}

fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        id: row.get(0)?,
        job_type: row.get(1)?,
        payload: row.get(2)?,
        priority: row.get(3)?,
        status: row.get(4)?,
        attempts: row.get(5)?,
        max_attempts: row.get(6)?,
        run_at: row.get(7)?,
        progress: row.get(8)?,
        last_error: row.get(9)?,
        result: row.get(10)?,
        dedup_key: row.get(11)?,
        locked_by: row.get(12)?,
        locked_at: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
        finished_at: row.get(16)?,
    })
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        Ok(Job {
            payload: serde_json::from_str(&self.payload)?,
            status: JobStatus::parse(&self.status)
                .map_err(|e| CourseHubError::Database(e.to_string()))?,
            run_at: parse_ts(&self.run_at)?,
            result: self.result.as_deref().map(serde_json::from_str).transpose()?,
            locked_at: parse_opt_ts(self.locked_at)?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            finished_at: parse_opt_ts(self.finished_at)?,
            id: self.id,
            job_type: self.job_type,
            priority: self.priority,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            progress: self.progress,
            last_error: self.last_error,
            dedup_key: self.dedup_key,
            locked_by: self.locked_by,
        })
    }
}

/// Durable queue of jobs, shared by producers and workers.
pub struct JobQueue {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl JobQueue {
    /// Open or create the queue database.
    pub fn open(path: &Path, clock: Arc<dyn Clock>, retry: RetryPolicy) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| CourseHubError::Database(format!("DB open error: {e}")))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|e| CourseHubError::Database(format!("DB pragma error: {e}")))?;
        let queue = Self {
            conn: Mutex::new(conn),
            clock,
            retry,
        };
        queue.migrate()?;
        Ok(queue)
    }

    pub fn in_memory(clock: Arc<dyn Clock>, retry: RetryPolicy) -> Result<Self> {
        Self::open(Path::new(":memory:"), clock, retry)
    }

    fn migrate(&self) -> Result<()> {
        self.lock()?
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS notification_jobs (
                id TEXT PRIMARY KEY,
                job_type TEXT NOT NULL,
                payload TEXT NOT NULL,            -- JSON
                priority INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'waiting',  -- waiting, active, completed, failed
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 3,
                run_at TEXT NOT NULL,
                progress INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                result TEXT,                      -- JSON
                dedup_key TEXT,
                locked_by TEXT,
                locked_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                finished_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_claim ON notification_jobs (status, job_type, run_at);
            CREATE INDEX IF NOT EXISTS idx_jobs_dedup ON notification_jobs (dedup_key);
            CREATE UNIQUE INDEX IF NOT EXISTS unique_open_dedup ON notification_jobs (dedup_key)
                WHERE dedup_key IS NOT NULL AND status IN ('waiting', 'active');
            ",
            )
            .map_err(|e| CourseHubError::Database(format!("Migration: {e}")))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CourseHubError::Database("queue connection poisoned".into()))
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    // ─── Producers ───────────────────────────────────────

    /// Add a job. `Conflict` if its dedup key already has an open job.
    pub fn enqueue(&self, job_type: &str, payload: serde_json::Value, opts: EnqueueOptions) -> Result<Job> {
        let job = self.new_job(job_type, payload, opts);
        insert_job(&*self.lock()?, &job).map_err(|e| {
            if is_unique_violation(&e) {
                CourseHubError::Conflict(format!(
                    "Job already open for {}",
                    job.dedup_key.as_deref().unwrap_or_default()
                ))
            } else {
                CourseHubError::Database(format!("Enqueue: {e}"))
            }
        })?;
        debug!(
            "Enqueued {} job {} (priority {}, runs at {})",
            job.job_type, job.id, job.priority, job.run_at
        );
        Ok(job)
    }

    /// Add a job unless one is already waiting or active under `dedup_key`.
    /// The check and the insert run in one transaction.
    pub fn enqueue_unique(
        &self,
        job_type: &str,
        dedup_key: &str,
        payload: serde_json::Value,
        opts: EnqueueOptions,
    ) -> Result<Option<Job>> {
        let job = self.new_job(job_type, payload, opts.dedup_key(dedup_key));
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| CourseHubError::Database(format!("Begin: {e}")))?;
        if let Some(open) = find_open_job(&tx, dedup_key)? {
            debug!("{job_type} job {} already open under {dedup_key}", open.id);
            return Ok(None);
        }
        match insert_job(&tx, &job) {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => return Ok(None),
            Err(e) => return Err(CourseHubError::Database(format!("Enqueue: {e}"))),
        }
        tx.commit()
            .map_err(|e| CourseHubError::Database(format!("Commit: {e}")))?;
        debug!(
            "Enqueued {} job {} (priority {}, runs at {})",
            job.job_type, job.id, job.priority, job.run_at
        );
        Ok(Some(job))
    }

    fn new_job(&self, job_type: &str, payload: serde_json::Value, opts: EnqueueOptions) -> Job {
        let now = self.clock.now();
        Job {
            id: uuid::Uuid::new_v4().to_string(),
            job_type: job_type.to_string(),
            payload,
            priority: opts.priority,
            status: JobStatus::Waiting,
            attempts: 0,
            max_attempts: opts.max_attempts.unwrap_or(self.retry.max_attempts).max(1),
            run_at: opts.eligible_at(now),
            progress: 0,
            last_error: None,
            result: None,
            dedup_key: opts.dedup_key,
            locked_by: None,
            locked_at: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// A waiting or active job carrying `dedup_key`, if any.
    pub fn find_open(&self, dedup_key: &str) -> Result<Option<Job>> {
        find_open_job(&*self.lock()?, dedup_key)
    }

    // ─── Workers ─────────────────────────────────────────

    /// Lock the next eligible job of one of `job_types`: highest priority,
    /// then earliest `run_at`, then oldest.
    pub fn claim_next(&self, job_types: &[String], worker_id: &str) -> Result<Option<Job>> {
        if job_types.is_empty() {
            return Ok(None);
        }
        let now = self.clock.now();
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| CourseHubError::Database(format!("Begin: {e}")))?;

        let mut values = vec![Value::Text(fmt_ts(now))];
        let marks: Vec<String> = job_types
            .iter()
            .map(|t| {
                values.push(Value::Text(t.clone()));
                format!("?{}", values.len())
            })
            .collect();
        let sql = format!(
            "{JOB_SELECT} WHERE status = 'waiting' AND run_at <= ?1 AND job_type IN ({}) \
             ORDER BY priority DESC, run_at ASC, created_at ASC LIMIT 1",
            marks.join(", ")
        );
        let row = tx
            .query_row(&sql, params_from_iter(values.iter()), row_to_job)
            .optional()
            .map_err(|e| CourseHubError::Database(format!("Claim: {e}")))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut job = row.into_job()?;

        tx.execute(
            "UPDATE notification_jobs SET status = 'active', attempts = attempts + 1, locked_by = ?2, \
             locked_at = ?3, updated_at = ?3 WHERE id = ?1",
            params![job.id, worker_id, fmt_ts(now)],
        )
        .map_err(|e| CourseHubError::Database(format!("Claim: {e}")))?;
        tx.commit()
            .map_err(|e| CourseHubError::Database(format!("Commit: {e}")))?;

        job.status = JobStatus::Active;
        job.attempts += 1;
        job.locked_by = Some(worker_id.to_string());
        job.locked_at = Some(now);
        job.updated_at = now;
        Ok(Some(job))
    }

    /// Record success. `Conflict` if `worker_id` no longer holds the job.
    pub fn complete(&self, id: &str, worker_id: &str, result: &serde_json::Value) -> Result<()> {
        let now = fmt_ts(self.clock.now());
        let changed = self
            .lock()?
            .execute(
                "UPDATE notification_jobs SET status = 'completed', progress = 100, result = ?3, \
                 locked_by = NULL, locked_at = NULL, finished_at = ?4, updated_at = ?4 \
                 WHERE id = ?1 AND status = 'active' AND locked_by = ?2",
                params![id, worker_id, serde_json::to_string(result)?, now],
            )
            .map_err(|e| CourseHubError::Database(format!("Complete job: {e}")))?;
        if changed == 0 {
            return Err(lost_lock(id, worker_id));
        }
        Ok(())
    }

    /// Record a failed attempt: schedule a retry with backoff, or mark the
    /// job failed once its attempts are used up. `Conflict` if `worker_id`
    /// no longer holds the job.
    pub fn fail(&self, id: &str, worker_id: &str, error: &str) -> Result<FailOutcome> {
        let now = self.clock.now();
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| CourseHubError::Database(format!("Begin: {e}")))?;
        let (attempts, max_attempts, status, locked_by): (u32, u32, String, Option<String>) = tx
            .query_row(
                "SELECT attempts, max_attempts, status, locked_by FROM notification_jobs WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()
            .map_err(|e| CourseHubError::Database(format!("Fail job: {e}")))?
            .ok_or_else(|| CourseHubError::NotFound(format!("Job {id}")))?;
        if status != "active" || locked_by.as_deref() != Some(worker_id) {
            return Err(lost_lock(id, worker_id));
        }

        let outcome = if attempts < max_attempts {
            let next_run_at = now + self.retry.backoff(attempts);
            tx.execute(
                "UPDATE notification_jobs SET status = 'waiting', run_at = ?2, last_error = ?3, \
                 locked_by = NULL, locked_at = NULL, updated_at = ?4 WHERE id = ?1",
                params![id, fmt_ts(next_run_at), error, fmt_ts(now)],
            )
            .map_err(|e| CourseHubError::Database(format!("Fail job: {e}")))?;
            FailOutcome::Retrying { next_run_at }
        } else {
            tx.execute(
                "UPDATE notification_jobs SET status = 'failed', last_error = ?2, locked_by = NULL, \
                 locked_at = NULL, finished_at = ?3, updated_at = ?3 WHERE id = ?1",
                params![id, error, fmt_ts(now)],
            )
            .map_err(|e| CourseHubError::Database(format!("Fail job: {e}")))?;
            FailOutcome::Exhausted
        };
        tx.commit()
            .map_err(|e| CourseHubError::Database(format!("Commit: {e}")))?;
        Ok(outcome)
    }

    /// Mark a job failed without further attempts. `Conflict` if `worker_id`
    /// no longer holds the job.
    pub fn fail_permanently(&self, id: &str, worker_id: &str, error: &str) -> Result<()> {
        let now = fmt_ts(self.clock.now());
        let changed = self
            .lock()?
            .execute(
                "UPDATE notification_jobs SET status = 'failed', last_error = ?3, locked_by = NULL, \
                 locked_at = NULL, finished_at = ?4, updated_at = ?4 \
                 WHERE id = ?1 AND status = 'active' AND locked_by = ?2",
                params![id, worker_id, error, now],
            )
            .map_err(|e| CourseHubError::Database(format!("Fail job: {e}")))?;
        if changed == 0 {
            return Err(lost_lock(id, worker_id));
        }
        Ok(())
    }

    /// Report handler progress, clamped to 0..=100.
    pub fn set_progress(&self, id: &str, progress: u8) -> Result<()> {
        self.lock()?
            .execute(
                "UPDATE notification_jobs SET progress = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, progress.min(100), fmt_ts(self.clock.now())],
            )
            .map_err(|e| CourseHubError::Database(format!("Set progress: {e}")))?;
        Ok(())
    }

    /// Return active jobs locked for longer than `timeout` to the waiting
    /// state. The interrupted run does not count as an attempt.
    pub fn requeue_stalled(&self, timeout: Duration) -> Result<Vec<String>> {
        let now = self.clock.now();
        let cutoff = fmt_ts(now - timeout);
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| CourseHubError::Database(format!("Begin: {e}")))?;
        let ids: Vec<String> = {
            let mut stmt = tx
                .prepare("SELECT id FROM notification_jobs WHERE status = 'active' AND locked_at < ?1")
                .map_err(|e| CourseHubError::Database(format!("Prepare: {e}")))?;
            stmt.query_map(params![cutoff], |row| row.get(0))
                .map_err(|e| CourseHubError::Database(format!("Query: {e}")))?
                .collect::<rusqlite::Result<Vec<String>>>()
                .map_err(|e| CourseHubError::Database(format!("Row: {e}")))?
        };
        for id in &ids {
            tx.execute(
                "UPDATE notification_jobs SET status = 'waiting', attempts = MAX(attempts - 1, 0), \
                 locked_by = NULL, locked_at = NULL, run_at = ?2, updated_at = ?2 WHERE id = ?1",
                params![id, fmt_ts(now)],
            )
            .map_err(|e| CourseHubError::Database(format!("Requeue: {e}")))?;
            warn!("⚠️ Job {id} stalled, returned to the queue");
        }
        tx.commit()
            .map_err(|e| CourseHubError::Database(format!("Commit: {e}")))?;
        Ok(ids)
    }

    // ─── Introspection ───────────────────────────────────

    pub fn get(&self, id: &str) -> Result<Job> {
        let conn = self.lock()?;
        let row = conn
            .query_row(&format!("{JOB_SELECT} WHERE id = ?1"), params![id], row_to_job)
            .optional()
            .map_err(|e| CourseHubError::Database(format!("Get job: {e}")))?;
        row.map(JobRow::into_job)
            .transpose()?
            .ok_or_else(|| CourseHubError::NotFound(format!("Job {id}")))
    }

    /// Most recently updated jobs, optionally of one status.
    pub fn list(&self, status: Option<JobStatus>, limit: u32) -> Result<Vec<Job>> {
        let conn = self.lock()?;
        let (sql, values) = match status {
            Some(s) => (
                format!("{JOB_SELECT} WHERE status = ?1 ORDER BY updated_at DESC LIMIT ?2"),
                vec![Value::Text(s.as_str().into()), Value::Integer(i64::from(limit))],
            ),
            None => (
                format!("{JOB_SELECT} ORDER BY updated_at DESC LIMIT ?1"),
                vec![Value::Integer(i64::from(limit))],
            ),
        };
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| CourseHubError::Database(format!("Prepare: {e}")))?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), row_to_job)
            .map_err(|e| CourseHubError::Database(format!("Query: {e}")))?;
        let mut jobs = Vec::new();
        for row in rows {
            let row = row.map_err(|e| CourseHubError::Database(format!("Row: {e}")))?;
            jobs.push(row.into_job()?);
        }
        Ok(jobs)
    }

    pub fn stats(&self) -> Result<QueueStats> {
        let now = fmt_ts(self.clock.now());
        let conn = self.lock()?;
        conn.query_row(
            "SELECT
                COALESCE(SUM(status = 'waiting' AND run_at <= ?1), 0),
                COALESCE(SUM(status = 'active'), 0),
                COALESCE(SUM(status = 'completed'), 0),
                COALESCE(SUM(status = 'failed'), 0),
                COALESCE(SUM(status = 'waiting' AND run_at > ?1), 0)
             FROM notification_jobs",
            params![now],
            |row| {
                Ok(QueueStats {
                    waiting: row.get::<_, i64>(0)? as u64,
                    active: row.get::<_, i64>(1)? as u64,
                    completed: row.get::<_, i64>(2)? as u64,
                    failed: row.get::<_, i64>(3)? as u64,
                    delayed: row.get::<_, i64>(4)? as u64,
                })
            },
        )
        .map_err(|e| CourseHubError::Database(format!("Queue stats: {e}")))
    }

    /// Apply the retention policy.
    pub fn clean(&self, policy: &RetentionPolicy) -> Result<CleanReport> {
        let now = self.clock.now();
        let conn = self.lock()?;
        let aged_completed = conn
            .execute(
                "DELETE FROM notification_jobs WHERE status = 'completed' AND finished_at < ?1",
                params![fmt_ts(now - policy.completed_max_age)],
            )
            .map_err(|e| CourseHubError::Database(format!("Clean completed: {e}")))?;
        let surplus_completed = conn
            .execute(
                "DELETE FROM notification_jobs WHERE status = 'completed' AND id NOT IN (
                    SELECT id FROM notification_jobs WHERE status = 'completed'
                    ORDER BY finished_at DESC LIMIT ?1)",
                params![policy.keep_completed],
            )
            .map_err(|e| CourseHubError::Database(format!("Clean completed: {e}")))?;
        let failed = conn
            .execute(
                "DELETE FROM notification_jobs WHERE status = 'failed' AND finished_at < ?1",
                params![fmt_ts(now - policy.failed_max_age)],
            )
            .map_err(|e| CourseHubError::Database(format!("Clean failed: {e}")))?;
        let report = CleanReport {
            completed_removed: aged_completed + surplus_completed,
            failed_removed: failed,
        };
        if report.completed_removed + report.failed_removed > 0 {
            info!(
                "🧹 Queue cleanup: {} completed, {} failed jobs removed",
                report.completed_removed, report.failed_removed
            );
        }
        Ok(report)
    }
}

fn insert_job(conn: &Connection, job: &Job) -> rusqlite::Result<usize> {
    let payload = serde_json::to_string(&job.payload)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
    conn.execute(
        "INSERT INTO notification_jobs (id, job_type, payload, priority, status, attempts, max_attempts, \
         run_at, progress, dedup_key, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, 'waiting', 0, ?5, ?6, 0, ?7, ?8, ?8)",
        params![
            job.id,
            job.job_type,
            payload,
            job.priority,
            job.max_attempts,
            fmt_ts(job.run_at),
            job.dedup_key,
            fmt_ts(job.created_at),
        ],
    )
}

fn find_open_job(conn: &Connection, dedup_key: &str) -> Result<Option<Job>> {
    let row = conn
        .query_row(
            &format!(
                "{JOB_SELECT} WHERE dedup_key = ?1 AND status IN ('waiting', 'active') \
                 ORDER BY created_at DESC LIMIT 1"
            ),
            params![dedup_key],
            row_to_job,
        )
        .optional()
        .map_err(|e| CourseHubError::Database(format!("Find job: {e}")))?;
    row.map(JobRow::into_job).transpose()
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn lost_lock(id: &str, worker_id: &str) -> CourseHubError {
    CourseHubError::Conflict(format!("Job {id} is no longer held by {worker_id}"))
}
