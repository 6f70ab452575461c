//! Activity log data model and the submission state machine.
//!
//! `is_submitted` and `submitted_at` are never written by callers. Every write
//! path runs [`recompute_derived_state`] after applying its changes, so a log is
//! submitted exactly when all six tasks are `Done` and at least one attendance
//! day is marked.

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc};
use coursehub_core::{CourseHubError, Result};
use serde::{Deserialize, Serialize};

/// Mon–Fri.
pub const ATTENDANCE_DAYS: usize = 5;
/// Graded/administrative tasks tracked per week.
pub const TASK_COUNT: usize = 6;

/// Progress of one weekly task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TaskStatus {
    #[default]
    #[serde(rename = "Not Started", alias = "NotStarted")]
    NotStarted,
    Pending,
    Done,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "Not Started",
            Self::Pending => "Pending",
            Self::Done => "Done",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "Not Started" | "NotStarted" => Ok(Self::NotStarted),
            "Pending" => Ok(Self::Pending),
            "Done" => Ok(Self::Done),
            other => Err(CourseHubError::Validation(format!(
                "Invalid task status '{other}' (expected Not Started, Pending or Done)"
            ))),
        }
    }
}

/// The six task statuses of a weekly log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatuses {
    pub formative_one_grading: TaskStatus,
    pub formative_two_grading: TaskStatus,
    pub summative_grading: TaskStatus,
    pub course_moderation: TaskStatus,
    pub intranet_sync: TaskStatus,
    pub grade_book_status: TaskStatus,
}

impl TaskStatuses {
    pub fn all(status: TaskStatus) -> Self {
        Self {
            formative_one_grading: status,
            formative_two_grading: status,
            summative_grading: status,
            course_moderation: status,
            intranet_sync: status,
            grade_book_status: status,
        }
    }

    pub fn as_array(&self) -> [TaskStatus; TASK_COUNT] {
        [
            self.formative_one_grading,
            self.formative_two_grading,
            self.summative_grading,
            self.course_moderation,
            self.intranet_sync,
            self.grade_book_status,
        ]
    }

    pub fn done_count(&self) -> usize {
        self.as_array()
            .iter()
            .filter(|s| **s == TaskStatus::Done)
            .count()
    }

    pub fn all_done(&self) -> bool {
        self.done_count() == TASK_COUNT
    }
}

/// One facilitator's compliance record for one course offering and week.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityLog {
    pub id: String,
    pub course_offering_id: String,
    pub facilitator_id: String,
    pub week_number: u32,
    pub academic_year: i32,
    pub trimester: u8,
    pub attendance: [bool; ATTENDANCE_DAYS],
    #[serde(flatten)]
    pub tasks: TaskStatuses,
    pub notes: Option<String>,
    pub due_date: DateTime<Utc>,
    pub is_submitted: bool,
    pub submitted_at: Option<DateTime<Utc>>,
    pub reminder_sent: bool,
    pub reminder_sent_at: Option<DateTime<Utc>>,
    pub overdue_alert_sent: bool,
    pub overdue_alert_sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of re-deriving submission state after a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionTransition {
    Unchanged,
    /// false → true; the manager gets a submission notification.
    Submitted,
    /// true → false; silent.
    Reverted,
}

impl ActivityLog {
    /// A fresh log with all defaults applied.
    pub fn new(
        course_offering_id: &str,
        facilitator_id: &str,
        week_number: u32,
        academic_year: i32,
        trimester: u8,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_log_id(),
            course_offering_id: course_offering_id.to_string(),
            facilitator_id: facilitator_id.to_string(),
            week_number,
            academic_year,
            trimester,
            attendance: [false; ATTENDANCE_DAYS],
            tasks: TaskStatuses::default(),
            notes: None,
            due_date: end_of_week(now),
            is_submitted: false,
            submitted_at: None,
            reminder_sent: false,
            reminder_sent_at: None,
            overdue_alert_sent: false,
            overdue_alert_sent_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn attendance_recorded(&self) -> bool {
        self.attendance.iter().any(|d| *d)
    }

    /// All tasks done and at least one attendance day marked.
    pub fn meets_submission_criteria(&self) -> bool {
        self.tasks.all_done() && self.attendance_recorded()
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        !self.is_submitted && now > self.due_date
    }

    /// Done tasks out of seven slots, where the seventh is "attendance recorded".
    pub fn completion_percentage(&self) -> u8 {
        let done = self.tasks.done_count() + usize::from(self.attendance_recorded());
        ((done as f64 / (TASK_COUNT + 1) as f64) * 100.0).round() as u8
    }

    pub fn submitted_on_time(&self) -> bool {
        self.is_submitted && self.submitted_at.is_some_and(|at| at <= self.due_date)
    }

    /// Serializable view including the read-time fields.
    pub fn view(&self, now: DateTime<Utc>) -> ActivityLogView {
        ActivityLogView {
            is_overdue: self.is_overdue(now),
            completion_percentage: self.completion_percentage(),
            log: self.clone(),
        }
    }
}

/// Re-derive `is_submitted`/`submitted_at` from the content fields.
pub fn recompute_derived_state(
    mut log: ActivityLog,
    now: DateTime<Utc>,
) -> (ActivityLog, SubmissionTransition) {
    let complete = log.meets_submission_criteria();
    let transition = if complete && !log.is_submitted {
        log.is_submitted = true;
        log.submitted_at = Some(now);
        SubmissionTransition::Submitted
    } else if !complete && log.is_submitted {
        log.is_submitted = false;
        log.submitted_at = None;
        SubmissionTransition::Reverted
    } else {
        SubmissionTransition::Unchanged
    };
    (log, transition)
}

/// An activity log as returned to API callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityLogView {
    #[serde(flatten)]
    pub log: ActivityLog,
    pub is_overdue: bool,
    pub completion_percentage: u8,
}

/// Next Sunday 23:59:59.999 UTC. On a Sunday this is the following Sunday.
pub fn end_of_week(now: DateTime<Utc>) -> DateTime<Utc> {
    let days_ahead = 7 - i64::from(now.weekday().num_days_from_sunday());
    let date = now.date_naive() + Duration::days(days_ahead);
    let last_ms = NaiveTime::from_hms_milli_opt(23, 59, 59, 999).unwrap_or(NaiveTime::MIN);
    date.and_time(last_ms).and_utc()
}

fn new_log_id() -> String {
    format!("AT-{}", uuid::Uuid::new_v4().simple())
}

fn parse_attendance(days: &[bool]) -> Result<[bool; ATTENDANCE_DAYS]> {
    <[bool; ATTENDANCE_DAYS]>::try_from(days).map_err(|_| {
        CourseHubError::Validation(format!(
            "Attendance must have exactly {ATTENDANCE_DAYS} entries (Mon-Fri), got {}",
            days.len()
        ))
    })
}

fn validate_week(week: u32) -> Result<()> {
    if (1..=52).contains(&week) {
        Ok(())
    } else {
        Err(CourseHubError::Validation(format!(
            "Week number must be between 1 and 52, got {week}"
        )))
    }
}

fn validate_trimester(trimester: u8) -> Result<()> {
    if (1..=3).contains(&trimester) {
        Ok(())
    } else {
        Err(CourseHubError::Validation(format!(
            "Trimester must be between 1 and 3, got {trimester}"
        )))
    }
}

// ─── Inputs ──────────────────────────────────────────────

/// Fields a facilitator may supply when creating a log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewActivityLog {
    pub course_offering_id: String,
    pub week_number: u32,
    pub academic_year: i32,
    pub trimester: u8,
    #[serde(default)]
    pub attendance: Option<Vec<bool>>,
    #[serde(default)]
    pub formative_one_grading: Option<TaskStatus>,
    #[serde(default)]
    pub formative_two_grading: Option<TaskStatus>,
    #[serde(default)]
    pub summative_grading: Option<TaskStatus>,
    #[serde(default)]
    pub course_moderation: Option<TaskStatus>,
    #[serde(default)]
    pub intranet_sync: Option<TaskStatus>,
    #[serde(default)]
    pub grade_book_status: Option<TaskStatus>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
}

impl NewActivityLog {
    pub fn for_week(course_offering_id: &str, week_number: u32, academic_year: i32, trimester: u8) -> Self {
        Self {
            course_offering_id: course_offering_id.to_string(),
            week_number,
            academic_year,
            trimester,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.course_offering_id.trim().is_empty() {
            return Err(CourseHubError::Validation("courseOfferingId is required".into()));
        }
        validate_week(self.week_number)?;
        validate_trimester(self.trimester)?;
        if let Some(days) = &self.attendance {
            parse_attendance(days)?;
        }
        Ok(())
    }

    /// Build the record, applying defaults and the derived state.
    pub fn into_log(self, facilitator_id: &str, now: DateTime<Utc>) -> Result<ActivityLog> {
        self.validate()?;
        let mut log = ActivityLog::new(
            &self.course_offering_id,
            facilitator_id,
            self.week_number,
            self.academic_year,
            self.trimester,
            now,
        );
        if let Some(days) = &self.attendance {
            log.attendance = parse_attendance(days)?;
        }
        let t = &mut log.tasks;
        t.formative_one_grading = self.formative_one_grading.unwrap_or_default();
        t.formative_two_grading = self.formative_two_grading.unwrap_or_default();
        t.summative_grading = self.summative_grading.unwrap_or_default();
        t.course_moderation = self.course_moderation.unwrap_or_default();
        t.intranet_sync = self.intranet_sync.unwrap_or_default();
        t.grade_book_status = self.grade_book_status.unwrap_or_default();
        log.notes = self.notes;
        if let Some(due) = self.due_date {
            log.due_date = due;
        }
        let (log, _) = recompute_derived_state(log, now);
        Ok(log)
    }
}

/// Content changes a facilitator may apply to an existing log. The due date
/// is fixed at creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogPatch {
    #[serde(default)]
    pub attendance: Option<Vec<bool>>,
    #[serde(default)]
    pub formative_one_grading: Option<TaskStatus>,
    #[serde(default)]
    pub formative_two_grading: Option<TaskStatus>,
    #[serde(default)]
    pub summative_grading: Option<TaskStatus>,
    #[serde(default)]
    pub course_moderation: Option<TaskStatus>,
    #[serde(default)]
    pub intranet_sync: Option<TaskStatus>,
    #[serde(default)]
    pub grade_book_status: Option<TaskStatus>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl LogPatch {
    /// Patch that sets every task to the same status.
    pub fn all_tasks(status: TaskStatus) -> Self {
        Self {
            formative_one_grading: Some(status),
            formative_two_grading: Some(status),
            summative_grading: Some(status),
            course_moderation: Some(status),
            intranet_sync: Some(status),
            grade_book_status: Some(status),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(days) = &self.attendance {
            parse_attendance(days)?;
        }
        Ok(())
    }

    /// Apply to a log. Derived fields are left for `recompute_derived_state`.
    pub fn apply(&self, log: &mut ActivityLog) -> Result<()> {
        if let Some(days) = &self.attendance {
            log.attendance = parse_attendance(days)?;
        }
        let t = &mut log.tasks;
        if let Some(s) = self.formative_one_grading {
            t.formative_one_grading = s;
        }
        if let Some(s) = self.formative_two_grading {
            t.formative_two_grading = s;
        }
        if let Some(s) = self.summative_grading {
            t.summative_grading = s;
        }
        if let Some(s) = self.course_moderation {
            t.course_moderation = s;
        }
        if let Some(s) = self.intranet_sync {
            t.intranet_sync = s;
        }
        if let Some(s) = self.grade_book_status {
            t.grade_book_status = s;
        }
        if let Some(notes) = &self.notes {
            log.notes = Some(notes.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike, Weekday};

    fn wednesday() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 5, 10, 0, 0).unwrap()
    }

    fn sample() -> ActivityLog {
        ActivityLog::new("CO-1", "FAC-1", 10, 2025, 1, wednesday())
    }

    #[test]
    fn test_end_of_week_is_next_sunday() {
        let due = end_of_week(wednesday());
        assert_eq!(due.weekday(), Weekday::Sun);
        assert_eq!(due.date_naive(), chrono::NaiveDate::from_ymd_opt(2025, 3, 9).unwrap());
        assert_eq!((due.hour(), due.minute(), due.second()), (23, 59, 59));
        assert_eq!(due.timestamp_subsec_millis(), 999);
    }

    #[test]
    fn test_end_of_week_on_sunday_rolls_forward() {
        let sunday = Utc.with_ymd_and_hms(2025, 3, 9, 8, 0, 0).unwrap();
        assert_eq!(
            end_of_week(sunday).date_naive(),
            chrono::NaiveDate::from_ymd_opt(2025, 3, 16).unwrap()
        );
    }

    #[test]
    fn test_defaults() {
        let log = sample();
        assert!(log.id.starts_with("AT-"));
        assert_eq!(log.attendance, [false; 5]);
        assert_eq!(log.tasks, TaskStatuses::all(TaskStatus::NotStarted));
        assert!(!log.is_submitted);
        assert_eq!(log.completion_percentage(), 0);
        assert!(!log.is_overdue(wednesday()));
    }

    #[test]
    fn test_completion_percentage_counts_attendance_slot() {
        let mut log = sample();
        log.attendance[0] = true;
        assert_eq!(log.completion_percentage(), 14);
        log.tasks.summative_grading = TaskStatus::Done;
        assert_eq!(log.completion_percentage(), 29);
        log.tasks = TaskStatuses::all(TaskStatus::Done);
        assert_eq!(log.completion_percentage(), 100);
        log.attendance = [false; 5];
        assert_eq!(log.completion_percentage(), 86);
    }

    #[test]
    fn test_completion_is_monotonic_for_forward_edits() {
        let mut log = sample();
        let mut last = log.completion_percentage();
        for step in [TaskStatus::Pending, TaskStatus::Done] {
            for i in 0..TASK_COUNT {
                let t = &mut log.tasks;
                let slot = match i {
                    0 => &mut t.formative_one_grading,
                    1 => &mut t.formative_two_grading,
                    2 => &mut t.summative_grading,
                    3 => &mut t.course_moderation,
                    4 => &mut t.intranet_sync,
                    _ => &mut t.grade_book_status,
                };
                *slot = step;
                let pct = log.completion_percentage();
                assert!(pct >= last, "{pct} < {last}");
                last = pct;
            }
        }
        assert_eq!(last, 86);
    }

    #[test]
    fn test_submission_transitions() {
        let now = wednesday();
        let mut log = sample();
        log.tasks = TaskStatuses::all(TaskStatus::Done);
        let (log, t) = recompute_derived_state(log, now);
        assert_eq!(t, SubmissionTransition::Unchanged);
        assert!(!log.is_submitted, "no attendance yet");

        let mut log = log;
        log.attendance[2] = true;
        let (log, t) = recompute_derived_state(log, now);
        assert_eq!(t, SubmissionTransition::Submitted);
        assert!(log.is_submitted);
        assert_eq!(log.submitted_at, Some(now));
        assert!(log.submitted_on_time());

        let later = now + Duration::hours(1);
        let (log, t) = recompute_derived_state(log, later);
        assert_eq!(t, SubmissionTransition::Unchanged);
        assert_eq!(log.submitted_at, Some(now), "stamp kept while still complete");

        let mut log = log;
        log.tasks.intranet_sync = TaskStatus::Pending;
        let (log, t) = recompute_derived_state(log, later);
        assert_eq!(t, SubmissionTransition::Reverted);
        assert!(!log.is_submitted);
        assert!(log.submitted_at.is_none());
    }

    fn check_derived(log: &ActivityLog, now: DateTime<Utc>) {
        let complete = log.tasks.all_done() && log.attendance.iter().any(|d| *d);
        assert_eq!(log.is_submitted, complete, "submitted iff complete");
        assert_eq!(log.submitted_at.is_some(), log.is_submitted);
        assert_eq!(log.is_overdue(now), !log.is_submitted && now > log.due_date);
        let done = log.tasks.done_count() + usize::from(log.attendance_recorded());
        assert_eq!(
            log.completion_percentage(),
            ((done as f64 / 7.0) * 100.0).round() as u8
        );
    }

    #[test]
    fn test_derived_state_holds_across_edit_sequence() {
        let start = wednesday();
        let mut log = sample();
        check_derived(&log, start);

        let attend = LogPatch {
            attendance: Some(vec![false, true, false, false, false]),
            ..Default::default()
        };
        let no_attendance = LogPatch {
            attendance: Some(vec![false; 5]),
            ..Default::default()
        };
        let regress = LogPatch {
            summative_grading: Some(TaskStatus::Pending),
            ..Default::default()
        };
        let redo = LogPatch {
            summative_grading: Some(TaskStatus::Done),
            ..Default::default()
        };
        let steps: Vec<(LogPatch, SubmissionTransition, u8)> = vec![
            (LogPatch::all_tasks(TaskStatus::Pending), SubmissionTransition::Unchanged, 0),
            (attend.clone(), SubmissionTransition::Unchanged, 14),
            (LogPatch::all_tasks(TaskStatus::Done), SubmissionTransition::Submitted, 100),
            (regress, SubmissionTransition::Reverted, 86),
            (redo, SubmissionTransition::Submitted, 100),
            (no_attendance, SubmissionTransition::Reverted, 86),
            (attend, SubmissionTransition::Submitted, 100),
            (LogPatch::all_tasks(TaskStatus::NotStarted), SubmissionTransition::Reverted, 14),
        ];

        for (i, (patch, expected, pct)) in steps.into_iter().enumerate() {
            let now = start + Duration::days(i as i64);
            patch.apply(&mut log).unwrap();
            let (next, t) = recompute_derived_state(log, now);
            log = next;
            assert_eq!(t, expected, "step {i}");
            assert_eq!(log.completion_percentage(), pct, "step {i}");
            check_derived(&log, now);
            check_derived(&log, log.due_date + Duration::days(1));
        }
    }

    #[test]
    fn test_patch_ignores_due_date() {
        let mut log = sample();
        let due = log.due_date;
        let patch: LogPatch =
            serde_json::from_str(r#"{"dueDate":"2030-01-01T00:00:00Z","notes":"moved?"}"#).unwrap();
        patch.apply(&mut log).unwrap();
        assert_eq!(log.due_date, due);
        assert_eq!(log.notes.as_deref(), Some("moved?"));
    }

    #[test]
    fn test_overdue_only_when_unsubmitted() {
        let mut log = sample();
        let after_due = log.due_date + Duration::seconds(1);
        assert!(log.is_overdue(after_due));
        assert!(!log.is_overdue(log.due_date));
        log.is_submitted = true;
        assert!(!log.is_overdue(after_due));
    }

    #[test]
    fn test_new_log_validation() {
        let now = wednesday();
        let mut input = NewActivityLog::for_week("CO-1", 53, 2025, 1);
        assert!(matches!(input.clone().into_log("FAC-1", now), Err(CourseHubError::Validation(_))));
        input.week_number = 4;
        input.trimester = 4;
        assert!(input.validate().is_err());
        input.trimester = 2;
        input.attendance = Some(vec![true, false]);
        assert!(input.validate().is_err());
        input.attendance = Some(vec![true, false, false, false, false]);
        let log = input.into_log("FAC-1", now).unwrap();
        assert!(log.attendance_recorded());
        assert_eq!(log.due_date, end_of_week(now));
    }

    #[test]
    fn test_new_log_fully_complete_is_submitted_at_creation() {
        let now = wednesday();
        let mut input = NewActivityLog::for_week("CO-1", 2, 2025, 1);
        input.attendance = Some(vec![true; 5]);
        input.formative_one_grading = Some(TaskStatus::Done);
        input.formative_two_grading = Some(TaskStatus::Done);
        input.summative_grading = Some(TaskStatus::Done);
        input.course_moderation = Some(TaskStatus::Done);
        input.intranet_sync = Some(TaskStatus::Done);
        input.grade_book_status = Some(TaskStatus::Done);
        let log = input.into_log("FAC-1", now).unwrap();
        assert!(log.is_submitted);
        assert_eq!(log.submitted_at, Some(now));
    }

    #[test]
    fn test_status_serde_names() {
        let json = serde_json::to_value(TaskStatus::NotStarted).unwrap();
        assert_eq!(json, "Not Started");
        let parsed: TaskStatus = serde_json::from_str("\"NotStarted\"").unwrap();
        assert_eq!(parsed, TaskStatus::NotStarted);
        assert!(TaskStatus::parse("Finished").is_err());
    }

    #[test]
    fn test_view_serializes_flat_camel_case() {
        let log = sample();
        let v = serde_json::to_value(log.view(wednesday())).unwrap();
        assert_eq!(v["weekNumber"], 10);
        assert_eq!(v["formativeOneGrading"], "Not Started");
        assert_eq!(v["isOverdue"], false);
        assert_eq!(v["completionPercentage"], 0);
    }
}
