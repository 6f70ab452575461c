//! Notification dispatcher: runs queued notification jobs.
//!
//! Each job re-reads its activity log before sending, since the log may have
//! changed while the job waited. A job whose notification is no longer needed
//! completes as skipped. Reminders and overdue alerts claim their `*_sent`
//! flag before sending; only the job that flips the flag delivers, and a
//! failed delivery clears it again. Directory and delivery errors propagate so the queue
//! retries them. The error of a job's last attempt is recorded as
//! `TerminalDelivery`; a malformed payload fails the job at once.

use async_trait::async_trait;
use coursehub_core::{Clock, CourseHubError, Directory, EmailSender};
use coursehub_queue::{JobContext, JobHandler};
use coursehub_tracker::{ActivityLog, TrackerDb};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::jobs::{NotificationKind, NotificationPayload};
use crate::templates::{self, RenderedEmail};

/// Recorded as the job result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum DispatchOutcome {
    Sent {
        recipient: String,
        #[serde(rename = "messageId")]
        message_id: String,
    },
    Skipped {
        reason: String,
    },
}

/// Resolves context, renders, sends and records delivery.
pub struct Dispatcher {
    db: Arc<TrackerDb>,
    directory: Arc<dyn Directory>,
    mailer: Arc<dyn EmailSender>,
    clock: Arc<dyn Clock>,
    frontend_url: String,
}

impl Dispatcher {
    pub fn new(
        db: Arc<TrackerDb>,
        directory: Arc<dyn Directory>,
        mailer: Arc<dyn EmailSender>,
        clock: Arc<dyn Clock>,
        frontend_url: &str,
    ) -> Self {
        Self {
            db,
            directory,
            mailer,
            clock,
            frontend_url: frontend_url.to_string(),
        }
    }

    pub fn mailer_name(&self) -> &str {
        self.mailer.name()
    }

    /// Run one notification job.
    pub async fn process_job(&self, ctx: &JobContext) -> anyhow::Result<DispatchOutcome> {
        let kind = NotificationKind::parse(&ctx.job.job_type)?;
        let payload: NotificationPayload = ctx.job.payload_as()?;
        let log = self.db.get(&payload.activity_log_id)?;
        ctx.progress(25);

        let outcome = match kind {
            NotificationKind::Reminder => self.send_reminder(ctx, &log).await?,
            NotificationKind::OverdueAlert => self.send_overdue_alert(ctx, &log).await?,
            NotificationKind::SubmissionNotification => self.send_submission_notice(ctx, &log).await?,
        };
        ctx.progress(100);

        match &outcome {
            DispatchOutcome::Sent { recipient, .. } => {
                info!("📧 {} for log {} sent to {recipient}", kind.as_str(), log.id)
            }
            DispatchOutcome::Skipped { reason } => {
                debug!("{} for log {} skipped: {reason}", kind.as_str(), log.id)
            }
        }
        Ok(outcome)
    }

    async fn send_reminder(&self, ctx: &JobContext, log: &ActivityLog) -> anyhow::Result<DispatchOutcome> {
        if log.is_submitted {
            return Ok(skipped("log already submitted"));
        }
        if log.reminder_sent {
            return Ok(skipped("reminder already sent"));
        }
        if log.due_date <= self.clock.now() {
            return Ok(skipped("log is past due"));
        }
        let assignment = self.directory.find_assignment(&log.course_offering_id)?;
        let facilitator = self.directory.find_facilitator(&log.facilitator_id)?;
        let email = templates::reminder(&facilitator, &assignment, log, &self.frontend_url);
        if !self.db.mark_reminder_sent(&log.id, self.clock.now())? {
            return Ok(skipped("reminder already sent"));
        }
        match self.deliver(ctx, &facilitator.email, &email).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.db.release_reminder(&log.id)?;
                Err(e)
            }
        }
    }

    async fn send_overdue_alert(&self, ctx: &JobContext, log: &ActivityLog) -> anyhow::Result<DispatchOutcome> {
        if log.is_submitted {
            return Ok(skipped("log already submitted"));
        }
        if log.overdue_alert_sent {
            return Ok(skipped("overdue alert already sent"));
        }
        let now = self.clock.now();
        let assignment = self.directory.find_assignment(&log.course_offering_id)?;
        let manager = self.directory.find_manager(&assignment.manager_id)?;
        let facilitator = self.directory.find_facilitator(&log.facilitator_id)?;
        let email = templates::overdue_alert(&manager, &facilitator, &assignment, log, now, &self.frontend_url);
        if !self.db.mark_overdue_alert_sent(&log.id, now)? {
            return Ok(skipped("overdue alert already sent"));
        }
        match self.deliver(ctx, &manager.email, &email).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.db.release_overdue_alert(&log.id)?;
                Err(e)
            }
        }
    }

    async fn send_submission_notice(
        &self,
        ctx: &JobContext,
        log: &ActivityLog,
    ) -> anyhow::Result<DispatchOutcome> {
        if !log.is_submitted {
            return Ok(skipped("log no longer submitted"));
        }
        let assignment = self.directory.find_assignment(&log.course_offering_id)?;
        let manager = self.directory.find_manager(&assignment.manager_id)?;
        let facilitator = self.directory.find_facilitator(&log.facilitator_id)?;
        let email = templates::submission_notice(&manager, &facilitator, &assignment, log, &self.frontend_url);
        self.deliver(ctx, &manager.email, &email).await
    }

    async fn deliver(&self, ctx: &JobContext, to: &str, email: &RenderedEmail) -> anyhow::Result<DispatchOutcome> {
        let message_id = self.mailer.send(to, &email.subject, &email.body).await?;
        ctx.progress(75);
        Ok(DispatchOutcome::Sent {
            recipient: to.to_string(),
            message_id,
        })
    }
}

fn skipped(reason: &str) -> DispatchOutcome {
    DispatchOutcome::Skipped {
        reason: reason.to_string(),
    }
}

#[async_trait]
impl JobHandler for Dispatcher {
    async fn handle(&self, ctx: &JobContext) -> anyhow::Result<serde_json::Value> {
        match self.process_job(ctx).await {
            Ok(outcome) => Ok(serde_json::to_value(outcome)?),
            Err(e) if ctx.job.attempts >= ctx.job.max_attempts => Err(CourseHubError::TerminalDelivery(format!(
                "{} after {} attempts: {e:#}",
                ctx.job.job_type, ctx.job.attempts
            ))
            .into()),
            Err(e) => Err(e),
        }
    }
}
