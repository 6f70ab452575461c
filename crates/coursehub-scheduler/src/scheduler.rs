//! Turns log lifecycle events and the periodic sweep into queued
//! notification jobs.
//!
//! At most one open job exists per log and notification kind: jobs are
//! enqueued under a dedup key and the queue refuses a second waiting or
//! active job with the same key. Together with the `reminder_sent` and
//! `overdue_alert_sent` flags this makes the sweep idempotent.

use chrono::Duration;
use coursehub_core::directory::Assignment;
use coursehub_core::{Clock, Result};
use coursehub_queue::{EnqueueOptions, Job, JobQueue};
use coursehub_tracker::{ActivityLog, LogObserver, TrackerDb};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::jobs::{NotificationKind, NotificationPayload, dedup_key};

/// What one sweep enqueued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub reminders_queued: usize,
    pub overdue_alerts_queued: usize,
    /// Candidates that already had an open job.
    pub already_queued: usize,
}

/// Notification scheduler.
pub struct Scheduler {
    queue: Arc<JobQueue>,
    db: Arc<TrackerDb>,
    clock: Arc<dyn Clock>,
    reminder_lead: Duration,
}

impl Scheduler {
    pub fn new(queue: Arc<JobQueue>, db: Arc<TrackerDb>, clock: Arc<dyn Clock>, reminder_lead: Duration) -> Self {
        Self {
            queue,
            db,
            clock,
            reminder_lead,
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Queue a reminder at `due_date - lead` (or now, if that has passed).
    /// Returns `None` when no reminder is needed or one is already queued.
    pub fn schedule_reminder(&self, log: &ActivityLog) -> Result<Option<Job>> {
        let now = self.clock.now();
        if log.is_submitted || log.reminder_sent || log.due_date <= now {
            return Ok(None);
        }
        self.enqueue_once(
            NotificationKind::Reminder,
            log,
            None,
            EnqueueOptions::default().run_at(log.due_date - self.reminder_lead),
        )
    }

    /// Queue an immediate notice to the manager of a just-submitted log.
    pub fn schedule_submission_notice(&self, log: &ActivityLog, manager_id: &str) -> Result<Option<Job>> {
        self.enqueue_once(
            NotificationKind::SubmissionNotification,
            log,
            Some(manager_id.to_string()),
            EnqueueOptions::default(),
        )
    }

    /// Find logs needing a reminder or an overdue alert and queue them.
    pub fn sweep(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        for log in self.db.pending_reminders(now, self.reminder_lead)? {
            match self.enqueue_once(NotificationKind::Reminder, &log, None, EnqueueOptions::default())? {
                Some(_) => report.reminders_queued += 1,
                None => report.already_queued += 1,
            }
        }
        for log in self.db.overdue_unalerted(now)? {
            match self.enqueue_once(NotificationKind::OverdueAlert, &log, None, EnqueueOptions::default())? {
                Some(_) => report.overdue_alerts_queued += 1,
                None => report.already_queued += 1,
            }
        }

        info!(
            "🔔 Sweep: {} reminders, {} overdue alerts queued ({} already queued)",
            report.reminders_queued, report.overdue_alerts_queued, report.already_queued
        );
        Ok(report)
    }

    fn enqueue_once(
        &self,
        kind: NotificationKind,
        log: &ActivityLog,
        manager_id: Option<String>,
        opts: EnqueueOptions,
    ) -> Result<Option<Job>> {
        let key = dedup_key(kind, &log.id);
        let payload = NotificationPayload {
            activity_log_id: log.id.clone(),
            course_offering_id: log.course_offering_id.clone(),
            facilitator_id: log.facilitator_id.clone(),
            manager_id,
            due_date: log.due_date,
            submitted_at: log.submitted_at,
        };
        let Some(job) = self.queue.enqueue_unique(
            kind.as_str(),
            &key,
            serde_json::to_value(&payload)?,
            opts.priority(kind.priority()),
        )?
        else {
            debug!("{} job already open for log {}", kind.as_str(), log.id);
            return Ok(None);
        };
        debug!("📅 {} job {} queued for log {} at {}", kind.as_str(), job.id, log.id, job.run_at);
        Ok(Some(job))
    }
}

impl LogObserver for Scheduler {
    fn on_log_created(&self, log: &ActivityLog) -> Result<()> {
        self.schedule_reminder(log).map(|_| ())
    }

    fn on_log_submitted(&self, log: &ActivityLog, assignment: &Assignment) -> Result<()> {
        self.schedule_submission_notice(log, &assignment.manager_id).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Harness, harness};
    use coursehub_tracker::NewActivityLog;

    fn new_log(h: &Harness, week: u32) -> ActivityLog {
        h.service
            .create_log(&h.facilitator(), NewActivityLog::for_week("CO-1", week, 2025, 1))
            .unwrap()
    }

    #[test]
    fn test_create_schedules_delayed_reminder() {
        let h = harness();
        let log = new_log(&h, 3);
        let job = h
            .queue
            .find_open(&dedup_key(NotificationKind::Reminder, &log.id))
            .unwrap()
            .unwrap();
        assert_eq!(job.run_at, log.due_date - Duration::hours(24));
        assert_eq!(job.priority, 5);
        assert!(job.is_delayed(h.clock.now()));
        let payload: NotificationPayload = job.payload_as().unwrap();
        assert_eq!(payload.activity_log_id, log.id);
    }

    #[test]
    fn test_sweep_is_idempotent() {
        let h = harness();
        let soon = new_log(&h, 3);
        let late = new_log(&h, 4);
        // Move past `late`'s due date by pretending it was due yesterday.
        h.tracker
            .update_with(&late.id, h.clock.now(), |l| {
                l.due_date = h.clock.now() - Duration::days(1);
                Ok(())
            })
            .unwrap();
        h.clock.set(soon.due_date - Duration::hours(2));

        let first = h.scheduler.sweep().unwrap();
        assert_eq!(first.reminders_queued, 0, "creation already queued it");
        assert_eq!(first.overdue_alerts_queued, 1);
        assert_eq!(first.already_queued, 1);

        let second = h.scheduler.sweep().unwrap();
        assert_eq!(second.reminders_queued + second.overdue_alerts_queued, 0);
        // Both creation-time reminders plus the overdue alert.
        assert_eq!(h.queue.stats().unwrap().waiting, 3);
    }

    #[test]
    fn test_sweep_respects_sent_flag_after_job_finishes() {
        let h = harness();
        let a = new_log(&h, 3);
        let b = new_log(&h, 4);
        h.clock.set(a.due_date - Duration::hours(1));
        let types = vec!["reminder".to_string()];
        // Both reminder jobs finish, but only `a` was actually delivered.
        for _ in 0..2 {
            let job = h.queue.claim_next(&types, "w").unwrap().unwrap();
            h.queue.complete(&job.id, "w", &serde_json::Value::Null).unwrap();
        }
        h.tracker.mark_reminder_sent(&a.id, h.clock.now()).unwrap();

        let report = h.scheduler.sweep().unwrap();
        assert_eq!(report.reminders_queued, 1);
        assert!(h.queue.find_open(&dedup_key(NotificationKind::Reminder, &b.id)).unwrap().is_some());
        assert!(h.queue.find_open(&dedup_key(NotificationKind::Reminder, &a.id)).unwrap().is_none());
    }

    #[test]
    fn test_submission_queues_notice_for_current_manager() {
        let h = harness();
        let log = new_log(&h, 3);
        h.complete(&log.id);
        let job = h
            .queue
            .find_open(&dedup_key(NotificationKind::SubmissionNotification, &log.id))
            .unwrap()
            .unwrap();
        assert_eq!(job.priority, 3);
        let payload: NotificationPayload = job.payload_as().unwrap();
        assert_eq!(payload.manager_id.as_deref(), Some("MGR-1"));
        assert!(payload.submitted_at.is_some());
    }

    #[tokio::test]
    async fn test_second_sweep_after_overdue_alert_queues_nothing() {
        let h = harness();
        let log = new_log(&h, 3);
        h.clock.set(log.due_date + Duration::hours(5));

        let first = h.scheduler.sweep().unwrap();
        assert_eq!(first.overdue_alerts_queued, 1);
        h.runner().run_until_empty().await;
        assert!(h.tracker.get(&log.id).unwrap().overdue_alert_sent);
        assert!(h.queue.find_open(&dedup_key(NotificationKind::OverdueAlert, &log.id)).unwrap().is_none());

        let second = h.scheduler.sweep().unwrap();
        assert_eq!(second, SweepReport::default());
        assert_eq!(h.mailer.sent().len(), 1);
    }

    #[test]
    fn test_concurrent_scheduling_keeps_one_open_job_per_log() {
        let h = harness();
        let now = h.clock.now();
        let logs: Vec<ActivityLog> = (0..100)
            .map(|n| {
                let log = ActivityLog::new(&format!("CO-{n}"), "FAC-1", 3, 2025, 1, now);
                h.tracker.insert(&log).unwrap();
                log
            })
            .collect();

        let queued: usize = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        logs.iter()
                            .filter(|log| h.scheduler.schedule_reminder(log).unwrap().is_some())
                            .count()
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).sum()
        });

        assert_eq!(queued, logs.len());
        assert_eq!(h.queue.stats().unwrap().delayed, logs.len() as u64);
        for log in &logs {
            assert!(h.queue.find_open(&dedup_key(NotificationKind::Reminder, &log.id)).unwrap().is_some());
        }
    }

    #[test]
    fn test_no_reminder_for_past_due_or_submitted_logs() {
        let h = harness();
        let mut log = ActivityLog::new("CO-1", "FAC-1", 9, 2025, 1, h.clock.now());
        log.due_date = h.clock.now() - Duration::hours(1);
        assert!(h.scheduler.schedule_reminder(&log).unwrap().is_none());
        log.due_date = h.clock.now() + Duration::days(2);
        log.is_submitted = true;
        assert!(h.scheduler.schedule_reminder(&log).unwrap().is_none());
    }
}
