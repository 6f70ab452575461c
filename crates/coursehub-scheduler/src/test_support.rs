//! Shared fixtures for the scheduler tests.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use coursehub_core::directory::Assignment;
use coursehub_core::{CallerIdentity, CourseHubError, EmailSender, ManualClock, Result, StaticDirectory};
use coursehub_queue::{JobQueue, RetryPolicy, Runner};
use coursehub_tracker::{ActivityLogService, LogPatch, TaskStatus, TrackerDb};
use std::sync::Arc;
use std::sync::Mutex;

use crate::dispatch::Dispatcher;
use crate::jobs::NotificationKind;
use crate::scheduler::Scheduler;

/// Records messages instead of sending them; can be told to fail.
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<(String, String, String)>>,
    failures_left: Mutex<usize>,
}

impl RecordingMailer {
    pub fn sent(&self) -> Vec<(String, String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn fail_next(&self, n: usize) {
        *self.failures_left.lock().unwrap() = n;
    }
}

#[async_trait]
impl EmailSender for RecordingMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<String> {
        {
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(CourseHubError::TransientDelivery("smtp unavailable".into()));
            }
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push((to.to_string(), subject.to_string(), body.to_string()));
        Ok(format!("msg-{}", sent.len()))
    }

    fn name(&self) -> &str {
        "recording"
    }
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub directory: Arc<StaticDirectory>,
    pub tracker: Arc<TrackerDb>,
    pub queue: Arc<JobQueue>,
    pub scheduler: Arc<Scheduler>,
    pub service: ActivityLogService,
    pub mailer: Arc<RecordingMailer>,
    pub dispatcher: Arc<Dispatcher>,
}

impl Harness {
    pub fn facilitator(&self) -> CallerIdentity {
        CallerIdentity::facilitator("FAC-1")
    }

    /// Mark every task done with attendance, submitting the log.
    pub fn complete(&self, log_id: &str) {
        let mut patch = LogPatch::all_tasks(TaskStatus::Done);
        patch.attendance = Some(vec![true, true, true, true, false]);
        let log = self.service.update_log(&self.facilitator(), log_id, patch).unwrap();
        assert!(log.is_submitted);
    }

    pub fn runner(&self) -> Runner {
        NotificationKind::ALL
            .iter()
            .fold(Runner::new(self.queue.clone()), |r, kind| {
                r.register(kind.as_str(), 1, self.dispatcher.clone())
            })
    }
}

pub fn harness() -> Harness {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 5, 10, 0, 0).unwrap()));
    let directory = Arc::new(StaticDirectory::new());
    directory.add_manager("MGR-1", "Grace Hopper", "grace@uni.test");
    directory.add_manager("MGR-2", "Katherine Johnson", "kj@uni.test");
    directory.add_facilitator("FAC-1", "Alan Turing", "alan@uni.test", Some("MGR-1"));
    directory.add_assignment(Assignment {
        course_offering_id: "CO-1".into(),
        facilitator_id: "FAC-1".into(),
        manager_id: "MGR-1".into(),
        module_name: "Data Structures".into(),
        module_code: "CS201".into(),
    });

    let tracker = Arc::new(TrackerDb::in_memory().unwrap());
    let queue = Arc::new(JobQueue::in_memory(clock.clone(), RetryPolicy::default()).unwrap());
    let scheduler = Arc::new(Scheduler::new(
        queue.clone(),
        tracker.clone(),
        clock.clone(),
        chrono::Duration::hours(24),
    ));
    let service = ActivityLogService::new(tracker.clone(), directory.clone(), clock.clone())
        .with_observer(scheduler.clone());
    let mailer = Arc::new(RecordingMailer::default());
    let dispatcher = Arc::new(Dispatcher::new(
        tracker.clone(),
        directory.clone(),
        mailer.clone(),
        clock.clone(),
        "https://lms.test",
    ));

    Harness {
        clock,
        directory,
        tracker,
        queue,
        scheduler,
        service,
        mailer,
        dispatcher,
    }
}
