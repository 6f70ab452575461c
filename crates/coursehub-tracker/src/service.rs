//! Role-aware operations over the activity log store.
//!
//! Every operation takes an explicit [`CallerIdentity`]. Facilitators own the
//! logs they create; managers read the logs of the facilitators reporting to
//! them; students have no access.

use chrono::Duration;
use coursehub_core::directory::{Assignment, Directory};
use coursehub_core::{CallerIdentity, Clock, CourseHubError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::model::{ActivityLog, ActivityLogView, LogPatch, NewActivityLog, SubmissionTransition, end_of_week};
use crate::report::{ComplianceReport, ComplianceStats, FacilitatorSummary, LogPage};
use crate::store::{LogFilter, LogOrder, Page, Pagination, TrackerDb};

/// Receives lifecycle events after the store write has committed.
///
/// Errors are logged and dropped; they never fail the originating request.
pub trait LogObserver: Send + Sync {
    fn on_log_created(&self, log: &ActivityLog) -> Result<()>;

    /// `assignment` carries the manager to notify.
    fn on_log_submitted(&self, log: &ActivityLog, assignment: &Assignment) -> Result<()>;
}

/// Create one log per week in a range.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkCreateRequest {
    pub course_offering_id: String,
    pub start_week: u32,
    pub end_week: u32,
    pub academic_year: i32,
    pub trimester: u8,
}

/// Outcome of a bulk create. Existing weeks are skipped, not errors.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkCreateReport {
    pub created: Vec<ActivityLog>,
    pub skipped_weeks: Vec<u32>,
    pub errors: Vec<String>,
}

/// Compliance record service.
pub struct ActivityLogService {
    db: Arc<TrackerDb>,
    directory: Arc<dyn Directory>,
    clock: Arc<dyn Clock>,
    observer: Option<Arc<dyn LogObserver>>,
}

impl ActivityLogService {
    pub fn new(db: Arc<TrackerDb>, directory: Arc<dyn Directory>, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            directory,
            clock,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn LogObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn db(&self) -> &Arc<TrackerDb> {
        &self.db
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // ─── Writes ──────────────────────────────────────────

    /// Create a weekly log for the calling facilitator.
    pub fn create_log(&self, caller: &CallerIdentity, input: NewActivityLog) -> Result<ActivityLog> {
        let facilitator_id = caller.require_facilitator()?;
        input.validate()?;
        let assignment = self.assignment_for(facilitator_id, &input.course_offering_id)?;
        let log = input.into_log(facilitator_id, self.clock.now())?;
        self.db.insert(&log)?;
        info!(
            "📝 Activity log {} created: {} week {}/{}",
            log.id, assignment.module_code, log.week_number, log.academic_year
        );
        self.after_create(&log, &assignment);
        Ok(log)
    }

    /// Create logs for `start_week..=end_week`, skipping weeks that exist.
    pub fn bulk_create(&self, caller: &CallerIdentity, req: BulkCreateRequest) -> Result<BulkCreateReport> {
        let facilitator_id = caller.require_facilitator()?;
        if !(1..=52).contains(&req.start_week) || !(1..=52).contains(&req.end_week) {
            return Err(CourseHubError::Validation(
                "Week numbers must be between 1 and 52".into(),
            ));
        }
        if req.start_week > req.end_week {
            return Err(CourseHubError::Validation(format!(
                "startWeek ({}) must not be after endWeek ({})",
                req.start_week, req.end_week
            )));
        }
        let assignment = self.assignment_for(facilitator_id, &req.course_offering_id)?;

        let now = self.clock.now();
        let first_due = end_of_week(now);
        let mut report = BulkCreateReport::default();
        for week in req.start_week..=req.end_week {
            if self.db.exists_for_week(
                &req.course_offering_id,
                facilitator_id,
                week,
                req.academic_year,
                req.trimester,
            )? {
                report.skipped_weeks.push(week);
                continue;
            }
            let mut input = NewActivityLog::for_week(
                &req.course_offering_id,
                week,
                req.academic_year,
                req.trimester,
            );
            input.due_date = Some(first_due + Duration::weeks(i64::from(week - req.start_week)));
            let created = input
                .into_log(facilitator_id, now)
                .and_then(|log| self.db.insert(&log).map(|_| log));
            match created {
                Ok(log) => {
                    self.after_create(&log, &assignment);
                    report.created.push(log);
                }
                Err(e) => report.errors.push(format!("Week {week}: {e}")),
            }
        }
        info!(
            "📝 Bulk create for {}: {} created, {} skipped, {} failed",
            req.course_offering_id,
            report.created.len(),
            report.skipped_weeks.len(),
            report.errors.len()
        );
        Ok(report)
    }

    /// Apply a content patch as the owning facilitator.
    pub fn update_log(&self, caller: &CallerIdentity, log_id: &str, patch: LogPatch) -> Result<ActivityLog> {
        let facilitator_id = caller.require_facilitator()?;
        patch.validate()?;
        let (log, transition) = self.db.update_with(log_id, self.clock.now(), |log| {
            if log.facilitator_id != facilitator_id {
                return Err(CourseHubError::Forbidden(format!(
                    "Activity log {log_id} belongs to another facilitator"
                )));
            }
            patch.apply(log)
        })?;

        match transition {
            SubmissionTransition::Submitted => {
                info!("✅ Activity log {} submitted", log.id);
                self.notify_submitted(&log);
            }
            SubmissionTransition::Reverted => {
                info!("↩️ Activity log {} no longer complete, submission reverted", log.id);
            }
            SubmissionTransition::Unchanged => debug!("Activity log {} updated", log.id),
        }
        Ok(log)
    }

    /// Delete an unsubmitted log as the owning facilitator.
    pub fn delete_log(&self, caller: &CallerIdentity, log_id: &str) -> Result<()> {
        let facilitator_id = caller.require_facilitator()?;
        self.db.delete_with(log_id, |log| {
            if log.facilitator_id != facilitator_id {
                return Err(CourseHubError::Forbidden(format!(
                    "Activity log {log_id} belongs to another facilitator"
                )));
            }
            if log.is_submitted {
                return Err(CourseHubError::Conflict(
                    "Cannot delete a submitted activity log".into(),
                ));
            }
            Ok(())
        })?;
        info!("🗑️ Activity log {log_id} deleted");
        Ok(())
    }

    /// Set the reminder flag. Idempotent.
    pub fn mark_reminder_sent(&self, log_id: &str) -> Result<()> {
        self.db.mark_reminder_sent(log_id, self.clock.now()).map(|_| ())
    }

    /// Set the overdue-alert flag. Idempotent.
    pub fn mark_overdue_alert_sent(&self, log_id: &str) -> Result<()> {
        self.db.mark_overdue_alert_sent(log_id, self.clock.now()).map(|_| ())
    }

    // ─── Reads ───────────────────────────────────────────

    pub fn get_log(&self, caller: &CallerIdentity, log_id: &str) -> Result<ActivityLogView> {
        let log = self.db.get(log_id)?;
        if !self.can_read(caller, &log)? {
            return Err(CourseHubError::Forbidden(format!(
                "No access to activity log {log_id}"
            )));
        }
        Ok(log.view(self.clock.now()))
    }

    /// One page of the logs visible to the caller.
    pub fn list_logs(&self, caller: &CallerIdentity, mut filter: LogFilter, page: Page) -> Result<LogPage> {
        self.scope(caller, &mut filter)?;
        let now = self.clock.now();
        let (logs, total) = self.db.list(&filter, LogOrder::Recent, page, now)?;
        Ok(LogPage {
            activity_logs: logs.iter().map(|l| l.view(now)).collect(),
            pagination: Pagination::new(page, total),
        })
    }

    /// The calling facilitator's logs with statistics over all of them.
    pub fn my_logs(&self, caller: &CallerIdentity, mut filter: LogFilter, page: Page) -> Result<FacilitatorSummary> {
        let facilitator_id = caller.require_facilitator()?;
        filter.facilitator_id = Some(facilitator_id.to_string());
        filter.facilitator_scope = None;
        let now = self.clock.now();
        let (logs, total) = self.db.list(&filter, LogOrder::Recent, page, now)?;
        let all = self.db.list_all(&filter, LogOrder::Recent, now)?;
        Ok(FacilitatorSummary {
            activity_logs: logs.iter().map(|l| l.view(now)).collect(),
            pagination: Pagination::new(page, total),
            statistics: ComplianceStats::from_logs(&all, now),
        })
    }

    /// Statistics over the logs visible to the caller.
    pub fn activity_stats(&self, caller: &CallerIdentity, mut filter: LogFilter) -> Result<ComplianceStats> {
        self.scope(caller, &mut filter)?;
        self.compliance_stats(&filter)
    }

    /// Statistics over every log matching `filter`. No role scoping.
    pub fn compliance_stats(&self, filter: &LogFilter) -> Result<ComplianceStats> {
        let now = self.clock.now();
        let logs = self.db.list_all(filter, LogOrder::Compliance, now)?;
        Ok(ComplianceStats::from_logs(&logs, now))
    }

    /// Manager report over managed facilitators' logs.
    pub fn compliance_report(&self, caller: &CallerIdentity, mut filter: LogFilter) -> Result<ComplianceReport> {
        caller.require_manager()?;
        self.scope(caller, &mut filter)?;
        let now = self.clock.now();
        let logs = self.db.list_all(&filter, LogOrder::Compliance, now)?;
        Ok(ComplianceReport {
            statistics: ComplianceStats::from_logs(&logs, now),
            activity_logs: logs.iter().map(|l| l.view(now)).collect(),
        })
    }

    /// Overdue logs for the given facilitators, oldest due first.
    pub fn list_overdue(&self, facilitator_ids: &[String]) -> Result<Vec<ActivityLog>> {
        self.db.list_overdue(Some(facilitator_ids), self.clock.now())
    }

    /// Overdue logs visible to the caller.
    pub fn overdue_for(&self, caller: &CallerIdentity) -> Result<Vec<ActivityLogView>> {
        let ids = self.visible_facilitators(caller)?;
        let now = self.clock.now();
        Ok(self.list_overdue(&ids)?.iter().map(|l| l.view(now)).collect())
    }

    // ─── Helpers ─────────────────────────────────────────

    fn assignment_for(&self, facilitator_id: &str, course_offering_id: &str) -> Result<Assignment> {
        let assignment = self.directory.find_assignment(course_offering_id)?;
        if assignment.facilitator_id != facilitator_id {
            return Err(CourseHubError::Forbidden(format!(
                "Facilitator {facilitator_id} is not assigned to course offering {course_offering_id}"
            )));
        }
        Ok(assignment)
    }

    fn visible_facilitators(&self, caller: &CallerIdentity) -> Result<Vec<String>> {
        match caller {
            CallerIdentity::Facilitator { facilitator_id, .. } => Ok(vec![facilitator_id.clone()]),
            CallerIdentity::Manager { manager_id, .. } => self.directory.managed_facilitators(manager_id),
            CallerIdentity::Student { .. } => Err(CourseHubError::Forbidden(
                "Students cannot view activity logs".into(),
            )),
        }
    }

    fn scope(&self, caller: &CallerIdentity, filter: &mut LogFilter) -> Result<()> {
        filter.facilitator_scope = Some(self.visible_facilitators(caller)?);
        Ok(())
    }

    fn can_read(&self, caller: &CallerIdentity, log: &ActivityLog) -> Result<bool> {
        match caller {
            CallerIdentity::Facilitator { facilitator_id, .. } => Ok(&log.facilitator_id == facilitator_id),
            CallerIdentity::Manager { manager_id, .. } => {
                if self
                    .directory
                    .managed_facilitators(manager_id)?
                    .contains(&log.facilitator_id)
                {
                    return Ok(true);
                }
                match self.directory.find_assignment(&log.course_offering_id) {
                    Ok(a) => Ok(&a.manager_id == manager_id),
                    Err(CourseHubError::NotFound(_)) => Ok(false),
                    Err(e) => Err(e),
                }
            }
            CallerIdentity::Student { .. } => Ok(false),
        }
    }

    fn after_create(&self, log: &ActivityLog, assignment: &Assignment) {
        if let Some(observer) = &self.observer {
            if let Err(e) = observer.on_log_created(log) {
                warn!("⚠️ Reminder scheduling failed for log {}: {e}", log.id);
            }
            if log.is_submitted {
                if let Err(e) = observer.on_log_submitted(log, assignment) {
                    warn!("⚠️ Submission notification failed for log {}: {e}", log.id);
                }
            }
        }
    }

    fn notify_submitted(&self, log: &ActivityLog) {
        let Some(observer) = &self.observer else {
            return;
        };
        let result = self
            .directory
            .find_assignment(&log.course_offering_id)
            .and_then(|assignment| observer.on_log_submitted(log, &assignment));
        if let Err(e) = result {
            warn!("⚠️ Submission notification failed for log {}: {e}", log.id);
        }
    }
}
