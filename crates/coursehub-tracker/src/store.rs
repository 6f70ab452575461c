//! SQLite persistence for activity logs.
//!
//! Every write that touches task statuses or attendance runs inside an
//! IMMEDIATE transaction: the row is read, changed, re-derived and written back
//! while holding the write lock, so concurrent edits of one log cannot leave
//! `is_submitted` out of step with its content.

use chrono::{DateTime, Duration, Utc};
use coursehub_core::time::{fmt_ts, parse_opt_ts, parse_ts};
use coursehub_core::{CourseHubError, Result};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params, params_from_iter};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::model::{
    ATTENDANCE_DAYS, ActivityLog, SubmissionTransition, TaskStatus, TaskStatuses,
    recompute_derived_state,
};

const LOG_SELECT: &str = "SELECT id, course_offering_id, facilitator_id, week_number, academic_year, trimester, \
     attendance, formative_one_grading, formative_two_grading, summative_grading, course_moderation, \
     intranet_sync, grade_book_status, notes, due_date, is_submitted, submitted_at, reminder_sent, \
     reminder_sent_at, overdue_alert_sent, overdue_alert_sent_at, created_at, updated_at \
     FROM activity_logs";

/// Row as stored; decoded into an [`ActivityLog`] by [`LogRow::into_log`].
struct LogRow {
    id: String,
    course_offering_id: String,
    facilitator_id: String,
    week_number: u32,
    academic_year: i32,
    trimester: u8,
    attendance: String,
    tasks: [String; 6],
    notes: Option<String>,
    due_date: String,
    is_submitted: bool,
    submitted_at: Option<String>,
    reminder_sent: bool,
    reminder_sent_at: Option<String>,
    overdue_alert_sent: bool,
    overdue_alert_sent_at: Option<String>,
    created_at: String,
    updated_at: String,
}

fn row_to_log(row: &rusqlite::Row) -> rusqlite::Result<LogRow> {
    Ok(LogRow {
        id: row.get(0)?,
        course_offering_id: row.get(1)?,
        facilitator_id: row.get(2)?,
        week_number: row.get(3)?,
        academic_year: row.get(4)?,
        trimester: row.get(5)?,
        attendance: row.get(6)?,
        tasks: [
            row.get(7)?,
            row.get(8)?,
            row.get(9)?,
            row.get(10)?,
            row.get(11)?,
            row.get(12)?,
        ],
        notes: row.get(13)?,
        due_date: row.get(14)?,
        is_submitted: row.get(15)?,
        submitted_at: row.get(16)?,
        reminder_sent: row.get(17)?,
        reminder_sent_at: row.get(18)?,
        overdue_alert_sent: row.get(19)?,
        overdue_alert_sent_at: row.get(20)?,
        created_at: row.get(21)?,
        updated_at: row.get(22)?,
    })
}

impl LogRow {
    fn into_log(self) -> Result<ActivityLog> {
        let attendance: Vec<bool> = serde_json::from_str(&self.attendance)?;
        let attendance = <[bool; ATTENDANCE_DAYS]>::try_from(attendance.as_slice()).map_err(|_| {
            CourseHubError::Database(format!("Log {} has malformed attendance", self.id))
        })?;
        let [t1, t2, t3, t4, t5, t6] = &self.tasks;
        Ok(ActivityLog {
            tasks: TaskStatuses {
                formative_one_grading: TaskStatus::parse(t1)?,
                formative_two_grading: TaskStatus::parse(t2)?,
                summative_grading: TaskStatus::parse(t3)?,
                course_moderation: TaskStatus::parse(t4)?,
                intranet_sync: TaskStatus::parse(t5)?,
                grade_book_status: TaskStatus::parse(t6)?,
            },
            attendance,
            due_date: parse_ts(&self.due_date)?,
            submitted_at: parse_opt_ts(self.submitted_at)?,
            reminder_sent_at: parse_opt_ts(self.reminder_sent_at)?,
            overdue_alert_sent_at: parse_opt_ts(self.overdue_alert_sent_at)?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            id: self.id,
            course_offering_id: self.course_offering_id,
            facilitator_id: self.facilitator_id,
            week_number: self.week_number,
            academic_year: self.academic_year,
            trimester: self.trimester,
            notes: self.notes,
            is_submitted: self.is_submitted,
            reminder_sent: self.reminder_sent,
            overdue_alert_sent: self.overdue_alert_sent,
        })
    }
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _) if f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

// ─── Query types ─────────────────────────────────────────

/// Filters shared by listing, reporting and statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFilter {
    pub course_offering_id: Option<String>,
    pub facilitator_id: Option<String>,
    pub week_number: Option<u32>,
    pub academic_year: Option<i32>,
    pub trimester: Option<u8>,
    pub is_submitted: Option<bool>,
    /// Unsubmitted and past due at query time.
    pub is_overdue: Option<bool>,
    /// Restrict to these facilitators. `Some(vec![])` matches nothing.
    #[serde(skip)]
    pub facilitator_scope: Option<Vec<String>>,
}

/// Result ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOrder {
    /// Week, then year, then creation time; newest first.
    Recent,
    /// Week, then due date; newest first.
    Compliance,
    /// Oldest due date first.
    DueSoonest,
}

impl LogOrder {
    fn sql(&self) -> &'static str {
        match self {
            Self::Recent => "ORDER BY week_number DESC, academic_year DESC, created_at DESC",
            Self::Compliance => "ORDER BY week_number DESC, due_date DESC",
            Self::DueSoonest => "ORDER BY due_date ASC",
        }
    }
}

/// 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub page: u32,
    pub limit: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self { page: 1, limit: 10 }
    }
}

impl Page {
    pub fn new(page: Option<u32>, limit: Option<u32>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            limit: limit.unwrap_or(10).clamp(1, 100),
        }
    }

    fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.limit)
    }
}

/// Pagination block returned alongside a page of results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub current_page: u32,
    pub total_pages: u32,
    pub total_items: u64,
    pub items_per_page: u32,
}

impl Pagination {
    pub fn new(page: Page, total_items: u64) -> Self {
        Self {
            current_page: page.page,
            total_pages: total_items.div_ceil(u64::from(page.limit.max(1))) as u32,
            total_items,
            items_per_page: page.limit,
        }
    }
}

fn where_clause(filter: &LogFilter, now: DateTime<Utc>) -> (String, Vec<Value>) {
    let mut clauses: Vec<String> = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    if let Some(co) = &filter.course_offering_id {
        values.push(Value::Text(co.clone()));
        clauses.push(format!("course_offering_id = ?{}", values.len()));
    }
    if let Some(f) = &filter.facilitator_id {
        values.push(Value::Text(f.clone()));
        clauses.push(format!("facilitator_id = ?{}", values.len()));
    }
    if let Some(w) = filter.week_number {
        values.push(Value::Integer(i64::from(w)));
        clauses.push(format!("week_number = ?{}", values.len()));
    }
    if let Some(y) = filter.academic_year {
        values.push(Value::Integer(i64::from(y)));
        clauses.push(format!("academic_year = ?{}", values.len()));
    }
    if let Some(t) = filter.trimester {
        values.push(Value::Integer(i64::from(t)));
        clauses.push(format!("trimester = ?{}", values.len()));
    }
    if let Some(s) = filter.is_submitted {
        values.push(Value::Integer(i64::from(s)));
        clauses.push(format!("is_submitted = ?{}", values.len()));
    }
    if let Some(overdue) = filter.is_overdue {
        values.push(Value::Text(fmt_ts(now)));
        let n = values.len();
        if overdue {
            clauses.push(format!("(is_submitted = 0 AND due_date < ?{n})"));
        } else {
            clauses.push(format!("(is_submitted = 1 OR due_date >= ?{n})"));
        }
    }
    if let Some(scope) = &filter.facilitator_scope {
        if scope.is_empty() {
            clauses.push("1 = 0".into());
        } else {
            let mut marks = Vec::with_capacity(scope.len());
            for id in scope {
                values.push(Value::Text(id.clone()));
                marks.push(format!("?{}", values.len()));
            }
            clauses.push(format!("facilitator_id IN ({})", marks.join(", ")));
        }
    }

    if clauses.is_empty() {
        (String::new(), values)
    } else {
        (format!(" WHERE {}", clauses.join(" AND ")), values)
    }
}

// ─── Store ───────────────────────────────────────────────

/// Activity log store.
pub struct TrackerDb {
    conn: Mutex<Connection>,
}

impl TrackerDb {
    /// Open or create the tracker database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| CourseHubError::Database(format!("DB open error: {e}")))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|e| CourseHubError::Database(format!("DB pragma error: {e}")))?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    /// In-memory database.
    pub fn in_memory() -> Result<Self> {
        Self::open(Path::new(":memory:"))
    }

    fn migrate(&self) -> Result<()> {
        self.lock()?
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS activity_logs (
                id TEXT PRIMARY KEY,
                course_offering_id TEXT NOT NULL,
                facilitator_id TEXT NOT NULL,
                week_number INTEGER NOT NULL CHECK (week_number BETWEEN 1 AND 52),
                academic_year INTEGER NOT NULL,
                trimester INTEGER NOT NULL CHECK (trimester BETWEEN 1 AND 3),
                attendance TEXT NOT NULL DEFAULT '[false,false,false,false,false]',
                formative_one_grading TEXT NOT NULL DEFAULT 'Not Started',
                formative_two_grading TEXT NOT NULL DEFAULT 'Not Started',
                summative_grading TEXT NOT NULL DEFAULT 'Not Started',
                course_moderation TEXT NOT NULL DEFAULT 'Not Started',
                intranet_sync TEXT NOT NULL DEFAULT 'Not Started',
                grade_book_status TEXT NOT NULL DEFAULT 'Not Started',
                notes TEXT,
                due_date TEXT NOT NULL,
                is_submitted INTEGER NOT NULL DEFAULT 0,
                submitted_at TEXT,
                reminder_sent INTEGER NOT NULL DEFAULT 0,
                reminder_sent_at TEXT,
                overdue_alert_sent INTEGER NOT NULL DEFAULT 0,
                overdue_alert_sent_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            DROP INDEX IF EXISTS unique_weekly_log;
            CREATE UNIQUE INDEX IF NOT EXISTS unique_weekly_log_term
                ON activity_logs (course_offering_id, facilitator_id, week_number, academic_year, trimester);
            CREATE INDEX IF NOT EXISTS idx_logs_due ON activity_logs (due_date);
            CREATE INDEX IF NOT EXISTS idx_logs_submitted ON activity_logs (is_submitted);
            CREATE INDEX IF NOT EXISTS idx_logs_facilitator ON activity_logs (facilitator_id);
            CREATE INDEX IF NOT EXISTS idx_logs_week ON activity_logs (week_number, academic_year);
            ",
            )
            .map_err(|e| CourseHubError::Database(format!("Migration: {e}")))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CourseHubError::Database("tracker connection poisoned".into()))
    }

    // ─── Logs ────────────────────────────────────────────

    /// Insert a new log. `Conflict` if the (course offering, facilitator,
    /// week, year, trimester) slot is already taken.
    pub fn insert(&self, log: &ActivityLog) -> Result<()> {
        let conn = self.lock()?;
        let attendance = serde_json::to_string(&log.attendance)?;
        let t = log.tasks.as_array();
        conn.execute(
            "INSERT INTO activity_logs (id, course_offering_id, facilitator_id, week_number, academic_year, \
             trimester, attendance, formative_one_grading, formative_two_grading, summative_grading, \
             course_moderation, intranet_sync, grade_book_status, notes, due_date, is_submitted, submitted_at, \
             reminder_sent, reminder_sent_at, overdue_alert_sent, overdue_alert_sent_at, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)",
            params![
                log.id,
                log.course_offering_id,
                log.facilitator_id,
                log.week_number,
                log.academic_year,
                log.trimester,
                attendance,
                t[0].as_str(),
                t[1].as_str(),
                t[2].as_str(),
                t[3].as_str(),
                t[4].as_str(),
                t[5].as_str(),
                log.notes,
                fmt_ts(log.due_date),
                log.is_submitted,
                log.submitted_at.map(fmt_ts),
                log.reminder_sent,
                log.reminder_sent_at.map(fmt_ts),
                log.overdue_alert_sent,
                log.overdue_alert_sent_at.map(fmt_ts),
                fmt_ts(log.created_at),
                fmt_ts(log.updated_at),
            ],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                CourseHubError::Conflict(format!(
                    "Activity log already exists for week {} of {} trimester {}",
                    log.week_number, log.academic_year, log.trimester
                ))
            } else {
                CourseHubError::Database(format!("Insert log: {e}"))
            }
        })?;
        Ok(())
    }

    /// Fetch one log.
    pub fn get(&self, id: &str) -> Result<ActivityLog> {
        let conn = self.lock()?;
        find_log(&conn, id)?
            .ok_or_else(|| CourseHubError::NotFound(format!("Activity log {id}")))
    }

    /// Whether a log already exists for this slot.
    pub fn exists_for_week(
        &self,
        course_offering_id: &str,
        facilitator_id: &str,
        week_number: u32,
        academic_year: i32,
        trimester: u8,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let found: Option<String> = conn
            .query_row(
                "SELECT id FROM activity_logs WHERE course_offering_id = ?1 AND facilitator_id = ?2 \
                 AND week_number = ?3 AND academic_year = ?4 AND trimester = ?5",
                params![course_offering_id, facilitator_id, week_number, academic_year, trimester],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| CourseHubError::Database(format!("Lookup log: {e}")))?;
        Ok(found.is_some())
    }

    /// Read-modify-write one log atomically.
    ///
    /// `change` may reject the edit (ownership checks live there); the
    /// transaction is then rolled back. Derived submission state is recomputed
    /// from the changed content before writing.
    pub fn update_with<F>(
        &self,
        id: &str,
        now: DateTime<Utc>,
        change: F,
    ) -> Result<(ActivityLog, SubmissionTransition)>
    where
        F: FnOnce(&mut ActivityLog) -> Result<()>,
    {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| CourseHubError::Database(format!("Begin: {e}")))?;

        let mut log = find_log(&tx, id)?
            .ok_or_else(|| CourseHubError::NotFound(format!("Activity log {id}")))?;
        change(&mut log)?;
        log.updated_at = now;
        let (log, transition) = recompute_derived_state(log, now);

        let attendance = serde_json::to_string(&log.attendance)?;
        let t = log.tasks.as_array();
        tx.execute(
            "UPDATE activity_logs SET attendance = ?2, formative_one_grading = ?3, formative_two_grading = ?4, \
             summative_grading = ?5, course_moderation = ?6, intranet_sync = ?7, grade_book_status = ?8, \
             notes = ?9, due_date = ?10, is_submitted = ?11, submitted_at = ?12, updated_at = ?13 WHERE id = ?1",
            params![
                log.id,
                attendance,
                t[0].as_str(),
                t[1].as_str(),
                t[2].as_str(),
                t[3].as_str(),
                t[4].as_str(),
                t[5].as_str(),
                log.notes,
                fmt_ts(log.due_date),
                log.is_submitted,
                log.submitted_at.map(fmt_ts),
                fmt_ts(log.updated_at),
            ],
        )
        .map_err(|e| CourseHubError::Database(format!("Update log: {e}")))?;
        tx.commit()
            .map_err(|e| CourseHubError::Database(format!("Commit: {e}")))?;
        Ok((log, transition))
    }

    /// Delete a log after `check` approves it, atomically.
    pub fn delete_with<F>(&self, id: &str, check: F) -> Result<()>
    where
        F: FnOnce(&ActivityLog) -> Result<()>,
    {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| CourseHubError::Database(format!("Begin: {e}")))?;
        let log = find_log(&tx, id)?
            .ok_or_else(|| CourseHubError::NotFound(format!("Activity log {id}")))?;
        check(&log)?;
        tx.execute("DELETE FROM activity_logs WHERE id = ?1", params![id])
            .map_err(|e| CourseHubError::Database(format!("Delete log: {e}")))?;
        tx.commit()
            .map_err(|e| CourseHubError::Database(format!("Commit: {e}")))?;
        Ok(())
    }

    /// One page of matching logs plus the total match count.
    pub fn list(
        &self,
        filter: &LogFilter,
        order: LogOrder,
        page: Page,
        now: DateTime<Utc>,
    ) -> Result<(Vec<ActivityLog>, u64)> {
        let (where_sql, mut values) = where_clause(filter, now);
        let conn = self.lock()?;
        let total: i64 = conn
            .query_row(
                &format!("SELECT COUNT(*) FROM activity_logs{where_sql}"),
                params_from_iter(values.iter()),
                |row| row.get(0),
            )
            .map_err(|e| CourseHubError::Database(format!("Count logs: {e}")))?;

        values.push(Value::Integer(i64::from(page.limit)));
        let limit_idx = values.len();
        values.push(Value::Integer(page.offset() as i64));
        let offset_idx = values.len();
        let sql = format!(
            "{LOG_SELECT}{where_sql} {} LIMIT ?{limit_idx} OFFSET ?{offset_idx}",
            order.sql()
        );
        let logs = query_logs(&conn, &sql, &values)?;
        Ok((logs, total.max(0) as u64))
    }

    /// All matching logs, unpaginated.
    pub fn list_all(
        &self,
        filter: &LogFilter,
        order: LogOrder,
        now: DateTime<Utc>,
    ) -> Result<Vec<ActivityLog>> {
        let (where_sql, values) = where_clause(filter, now);
        let conn = self.lock()?;
        query_logs(&conn, &format!("{LOG_SELECT}{where_sql} {}", order.sql()), &values)
    }

    /// Unsubmitted logs past due, oldest due date first. `None` means all
    /// facilitators.
    pub fn list_overdue(
        &self,
        facilitator_ids: Option<&[String]>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ActivityLog>> {
        let filter = LogFilter {
            is_overdue: Some(true),
            facilitator_scope: facilitator_ids.map(<[String]>::to_vec),
            ..Default::default()
        };
        self.list_all(&filter, LogOrder::DueSoonest, now)
    }

    /// Unsubmitted logs without a reminder, due within `lead` from now.
    pub fn pending_reminders(&self, now: DateTime<Utc>, lead: Duration) -> Result<Vec<ActivityLog>> {
        let conn = self.lock()?;
        query_logs(
            &conn,
            &format!(
                "{LOG_SELECT} WHERE is_submitted = 0 AND reminder_sent = 0 \
                 AND due_date > ?1 AND due_date <= ?2 ORDER BY due_date ASC"
            ),
            &[Value::Text(fmt_ts(now)), Value::Text(fmt_ts(now + lead))],
        )
    }

    /// Unsubmitted, past-due logs with no overdue alert yet.
    pub fn overdue_unalerted(&self, now: DateTime<Utc>) -> Result<Vec<ActivityLog>> {
        let conn = self.lock()?;
        query_logs(
            &conn,
            &format!(
                "{LOG_SELECT} WHERE is_submitted = 0 AND overdue_alert_sent = 0 \
                 AND due_date < ?1 ORDER BY due_date ASC"
            ),
            &[Value::Text(fmt_ts(now))],
        )
    }

    /// Set `reminder_sent` once. Returns false if it was already set.
    pub fn mark_reminder_sent(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        self.mark_once(id, "reminder_sent", "reminder_sent_at", now)
    }

    /// Set `overdue_alert_sent` once. Returns false if it was already set.
    pub fn mark_overdue_alert_sent(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        self.mark_once(id, "overdue_alert_sent", "overdue_alert_sent_at", now)
    }

    /// Clear `reminder_sent` after a claimed delivery failed.
    pub fn release_reminder(&self, id: &str) -> Result<()> {
        self.unmark(id, "reminder_sent", "reminder_sent_at")
    }

    /// Clear `overdue_alert_sent` after a claimed delivery failed.
    pub fn release_overdue_alert(&self, id: &str) -> Result<()> {
        self.unmark(id, "overdue_alert_sent", "overdue_alert_sent_at")
    }

    fn unmark(&self, id: &str, flag: &str, stamp: &str) -> Result<()> {
        self.lock()?
            .execute(
                &format!("UPDATE activity_logs SET {flag} = 0, {stamp} = NULL WHERE id = ?1"),
                params![id],
            )
            .map_err(|e| CourseHubError::Database(format!("Clear {flag}: {e}")))?;
        Ok(())
    }

    fn mark_once(&self, id: &str, flag: &str, stamp: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                &format!("UPDATE activity_logs SET {flag} = 1, {stamp} = ?2 WHERE id = ?1 AND {flag} = 0"),
                params![id, fmt_ts(now)],
            )
            .map_err(|e| CourseHubError::Database(format!("Mark {flag}: {e}")))?;
        if changed > 0 {
            return Ok(true);
        }
        if find_log(&conn, id)?.is_none() {
            return Err(CourseHubError::NotFound(format!("Activity log {id}")));
        }
        Ok(false)
    }
}

fn find_log(conn: &Connection, id: &str) -> Result<Option<ActivityLog>> {
    let row = conn
        .query_row(&format!("{LOG_SELECT} WHERE id = ?1"), params![id], row_to_log)
        .optional()
        .map_err(|e| CourseHubError::Database(format!("Get log: {e}")))?;
    row.map(LogRow::into_log).transpose()
}

fn query_logs(conn: &Connection, sql: &str, values: &[Value]) -> Result<Vec<ActivityLog>> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| CourseHubError::Database(format!("Prepare: {e}")))?;
    let rows = stmt
        .query_map(params_from_iter(values.iter()), row_to_log)
        .map_err(|e| CourseHubError::Database(format!("Query: {e}")))?;
    let mut logs = Vec::new();
    for row in rows {
        let row = row.map_err(|e| CourseHubError::Database(format!("Row: {e}")))?;
        logs.push(row.into_log()?);
    }
    Ok(logs)
}
