//! Plain-text notification messages.

use chrono::{DateTime, Utc};
use coursehub_core::directory::{Assignment, Contact};
use coursehub_tracker::ActivityLog;

/// A rendered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub body: String,
}

fn fmt_when(ts: DateTime<Utc>) -> String {
    ts.format("%A, %B %-d, %Y at %H:%M UTC").to_string()
}

fn footer() -> &'static str {
    "\n--\nThis is an automated message from the Course Management Platform.\n"
}

/// Whole days past due, rounded up, at least 1.
pub fn days_overdue(due: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let secs = (now - due).num_seconds();
    ((secs as f64) / 86_400.0).ceil().max(1.0) as i64
}

/// To the facilitator, before the due date.
pub fn reminder(
    facilitator: &Contact,
    assignment: &Assignment,
    log: &ActivityLog,
    frontend_url: &str,
) -> RenderedEmail {
    let subject = format!(
        "Reminder: Weekly Activity Log Due - {} Week {}",
        assignment.module_code, log.week_number
    );
    let body = format!(
        "Dear {name},\n\n\
         This is a friendly reminder that your weekly activity log is due soon.\n\n\
         Module:   {module}\n\
         Week:     {week} ({year}, trimester {tri})\n\
         Due date: {due}\n\n\
         Please make sure you have:\n\
         - Marked daily attendance\n\
         - Updated formative assessment grading status\n\
         - Updated summative assessment grading status\n\
         - Completed course moderation\n\
         - Synced with the intranet\n\
         - Updated the gradebook status\n\n\
         Submit your log at {link}\n{footer}",
        name = facilitator.name,
        module = assignment.module_label(),
        week = log.week_number,
        year = log.academic_year,
        tri = log.trimester,
        due = fmt_when(log.due_date),
        link = format!("{}/activity-logs", frontend_url.trim_end_matches('/')),
        footer = footer(),
    );
    RenderedEmail { subject, body }
}

/// To the manager, once the due date has passed without a submission.
pub fn overdue_alert(
    manager: &Contact,
    facilitator: &Contact,
    assignment: &Assignment,
    log: &ActivityLog,
    now: DateTime<Utc>,
    frontend_url: &str,
) -> RenderedEmail {
    let subject = format!(
        "🚨 OVERDUE: Activity Log Missing - {} - {} Week {}",
        facilitator.name, assignment.module_code, log.week_number
    );
    let days = days_overdue(log.due_date, now);
    let body = format!(
        "Dear {manager},\n\n\
         A weekly activity log is overdue.\n\n\
         Facilitator:  {fac} <{fac_email}>\n\
         Module:       {module}\n\
         Week:         {week} ({year}, trimester {tri})\n\
         Was due:      {due}\n\
         Days overdue: {days}\n\n\
         Required actions:\n\
         - Contact the facilitator\n\
         - Ensure the log is submitted as soon as possible\n\
         - Review compliance procedures if necessary\n\n\
         Compliance dashboard: {link}\n{footer}",
        manager = manager.name,
        fac = facilitator.name,
        fac_email = facilitator.email,
        module = assignment.module_label(),
        week = log.week_number,
        year = log.academic_year,
        tri = log.trimester,
        due = fmt_when(log.due_date),
        link = format!("{}/manager/compliance", frontend_url.trim_end_matches('/')),
        footer = footer(),
    );
    RenderedEmail { subject, body }
}

/// To the manager, when a log becomes submitted.
pub fn submission_notice(
    manager: &Contact,
    facilitator: &Contact,
    assignment: &Assignment,
    log: &ActivityLog,
    frontend_url: &str,
) -> RenderedEmail {
    let subject = format!(
        "✅ Activity Log Submitted - {} - {} Week {}",
        facilitator.name, assignment.module_code, log.week_number
    );
    let submitted = log
        .submitted_at
        .map(fmt_when)
        .unwrap_or_else(|| "unknown".to_string());
    let status = if log.submitted_on_time() { "on time" } else { "late" };
    let body = format!(
        "Dear {manager},\n\n\
         A weekly activity log has been submitted.\n\n\
         Facilitator:  {fac}\n\
         Module:       {module}\n\
         Week:         {week} ({year}, trimester {tri})\n\
         Submitted at: {submitted} ({status})\n\n\
         Review activity logs: {link}\n{footer}",
        manager = manager.name,
        fac = facilitator.name,
        module = assignment.module_label(),
        week = log.week_number,
        year = log.academic_year,
        tri = log.trimester,
        link = format!("{}/manager/activity-logs", frontend_url.trim_end_matches('/')),
        footer = footer(),
    );
    RenderedEmail { subject, body }
}
