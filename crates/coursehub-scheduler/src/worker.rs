//! Notification worker lifecycle: the job runner plus the periodic sweep and
//! cleanup loops.

use chrono::{DateTime, Utc};
use coursehub_core::config::{QueueConfig, SchedulerConfig};
use coursehub_core::{Clock, Result};
use coursehub_queue::{JobQueue, QueueStats, RetentionPolicy, RunHandle, Runner};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::dispatch::Dispatcher;
use crate::jobs::NotificationKind;
use crate::scheduler::{Scheduler, SweepReport};

/// In-flight jobs get this long to finish on `stop`.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Snapshot for status endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub running: bool,
    pub active_job_count: usize,
    pub queue_stats: QueueStats,
    pub mailer: String,
    pub timestamp: DateTime<Utc>,
}

struct Running {
    jobs: RunHandle,
    loops: Vec<JoinHandle<()>>,
}

/// Owns the notification pipeline's background tasks.
pub struct NotificationWorker {
    queue: Arc<JobQueue>,
    scheduler: Arc<Scheduler>,
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
    scheduler_config: SchedulerConfig,
    queue_config: QueueConfig,
    running: Mutex<Option<Running>>,
}

impl NotificationWorker {
    pub fn new(
        scheduler: Arc<Scheduler>,
        dispatcher: Arc<Dispatcher>,
        clock: Arc<dyn Clock>,
        scheduler_config: SchedulerConfig,
        queue_config: QueueConfig,
    ) -> Self {
        Self {
            queue: scheduler.queue().clone(),
            scheduler,
            dispatcher,
            clock,
            scheduler_config,
            queue_config,
            running: Mutex::new(None),
        }
    }

    fn runner(&self) -> Runner {
        let cfg = &self.scheduler_config;
        Runner::new(self.queue.clone())
            .poll_interval(Duration::from_millis(self.queue_config.poll_interval_ms))
            .jitter(Duration::from_millis(self.queue_config.jitter_ms))
            .register(
                NotificationKind::Reminder.as_str(),
                cfg.reminder_concurrency,
                self.dispatcher.clone(),
            )
            .register(
                NotificationKind::OverdueAlert.as_str(),
                cfg.overdue_alert_concurrency,
                self.dispatcher.clone(),
            )
            .register(
                NotificationKind::SubmissionNotification.as_str(),
                cfg.submission_concurrency,
                self.dispatcher.clone(),
            )
    }

    /// Start processing. Runs one sweep immediately. No-op if already running.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            warn!("Notification worker already running");
            return Ok(());
        }

        let jobs = self.runner().start();
        if let Err(e) = self.scheduler.sweep() {
            error!("Initial sweep failed: {e}");
        }

        let sweep_loop = spawn_sweep_loop(
            self.scheduler.clone(),
            Duration::from_secs(self.scheduler_config.sweep_interval_secs.max(1)),
        );
        let cleanup_loop = spawn_cleanup_loop(
            self.queue.clone(),
            RetentionPolicy::from_config(&self.queue_config),
            chrono::Duration::seconds(self.queue_config.stall_timeout_secs as i64),
            Duration::from_secs(self.scheduler_config.cleanup_interval_secs.max(1)),
        );

        *running = Some(Running {
            jobs,
            loops: vec![sweep_loop, cleanup_loop],
        });
        info!(
            "🔔 Notification worker started (sweep every {}s, cleanup every {}s, mailer: {})",
            self.scheduler_config.sweep_interval_secs,
            self.scheduler_config.cleanup_interval_secs,
            self.dispatcher.mailer_name()
        );
        Ok(())
    }

    /// Stop claiming jobs and wait up to [`SHUTDOWN_GRACE`] for in-flight ones.
    /// Returns false if jobs were cut off.
    pub async fn stop(&self) -> bool {
        self.stop_within(SHUTDOWN_GRACE).await
    }

    pub async fn stop_within(&self, grace: Duration) -> bool {
        let Some(state) = self.running.lock().await.take() else {
            return true;
        };
        for handle in &state.loops {
            handle.abort();
        }
        let clean = state.jobs.shutdown(grace).await;
        info!("🛑 Notification worker stopped");
        clean
    }

    pub async fn status(&self) -> Result<WorkerStatus> {
        let running = self.running.lock().await;
        Ok(WorkerStatus {
            running: running.is_some(),
            active_job_count: running.as_ref().map(|r| r.jobs.active_jobs()).unwrap_or(0),
            queue_stats: self.queue.stats()?,
            mailer: self.dispatcher.mailer_name().to_string(),
            timestamp: self.clock.now(),
        })
    }

    /// Run a sweep now, outside the regular cadence.
    pub fn trigger_sweep(&self) -> Result<SweepReport> {
        info!("Manual sweep triggered");
        self.scheduler.sweep()
    }
}

fn spawn_sweep_loop(scheduler: Arc<Scheduler>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // The first tick fires immediately; start() already swept.
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = scheduler.sweep() {
                error!("Sweep failed: {e}");
            }
        }
    })
}

fn spawn_cleanup_loop(
    queue: Arc<JobQueue>,
    retention: RetentionPolicy,
    stall_timeout: chrono::Duration,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            if let Err(e) = queue.requeue_stalled(stall_timeout) {
                error!("Stalled job recovery failed: {e}");
            }
            if let Err(e) = queue.clean(&retention) {
                error!("Queue cleanup failed: {e}");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::harness;
    use chrono::Duration as ChronoDuration;
    use coursehub_tracker::NewActivityLog;

    fn fast_queue_config() -> QueueConfig {
        QueueConfig {
            poll_interval_ms: 10,
            jitter_ms: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_start_sweeps_and_delivers_then_stops() {
        let h = harness();
        let log = h
            .service
            .create_log(&h.facilitator(), NewActivityLog::for_week("CO-1", 3, 2025, 1))
            .unwrap();
        h.clock.set(log.due_date + ChronoDuration::hours(2));

        let worker = NotificationWorker::new(
            h.scheduler.clone(),
            h.dispatcher.clone(),
            h.clock.clone(),
            SchedulerConfig::default(),
            fast_queue_config(),
        );
        worker.start().await.unwrap();
        worker.start().await.unwrap();
        assert!(worker.status().await.unwrap().running);

        for _ in 0..300 {
            if h.tracker.get(&log.id).unwrap().overdue_alert_sent {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(h.tracker.get(&log.id).unwrap().overdue_alert_sent);
        let sent = h.mailer.sent();
        assert_eq!(sent.len(), 1, "the stale reminder is skipped, the alert is sent");
        assert_eq!(sent[0].0, "grace@uni.test");

        assert!(worker.stop().await);
        let status = worker.status().await.unwrap();
        assert!(!status.running);
        assert_eq!(status.active_job_count, 0);
        assert_eq!(status.queue_stats.failed, 0);
    }

    #[tokio::test]
    async fn test_trigger_sweep_without_start() {
        let h = harness();
        let log = h
            .service
            .create_log(&h.facilitator(), NewActivityLog::for_week("CO-1", 3, 2025, 1))
            .unwrap();
        h.clock.set(log.due_date + ChronoDuration::minutes(1));
        let worker = NotificationWorker::new(
            h.scheduler.clone(),
            h.dispatcher.clone(),
            h.clock.clone(),
            SchedulerConfig::default(),
            fast_queue_config(),
        );
        let report = worker.trigger_sweep().unwrap();
        assert_eq!(report.overdue_alerts_queued, 1);
        assert!(worker.stop().await, "stopping an idle worker is a no-op");
    }
}
