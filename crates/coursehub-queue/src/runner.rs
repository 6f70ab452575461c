//! Worker pools that drain the queue.
//!
//! Each registered job type gets its own pool of `concurrency` workers. A
//! worker claims one job at a time, runs its handler with panics caught, and
//! records the outcome; failures go back to the queue for retry with backoff
//! unless the error says retrying cannot help.

use async_trait::async_trait;
use coursehub_core::CourseHubError;
use futures::FutureExt;
use futures::future::join_all;
use rand::Rng;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use crate::job::{FailOutcome, Job};
use crate::store::JobQueue;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);

/// Processes jobs of one type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// `Ok` completes the job with the returned value as its result. `Err`
    /// (or a panic) counts as a failed attempt. A non-retryable
    /// `CourseHubError` fails the job outright.
    async fn handle(&self, ctx: &JobContext) -> anyhow::Result<serde_json::Value>;
}

/// The claimed job plus a progress reporter.
pub struct JobContext {
    pub job: Job,
    queue: Arc<JobQueue>,
}

impl JobContext {
    pub fn new(job: Job, queue: Arc<JobQueue>) -> Self {
        Self { job, queue }
    }

    /// Best-effort progress update.
    pub fn progress(&self, pct: u8) {
        if let Err(e) = self.queue.set_progress(&self.job.id, pct) {
            debug!("Progress update for job {} failed: {e}", self.job.id);
        }
    }
}

struct Processor {
    job_type: String,
    concurrency: usize,
    handler: Arc<dyn JobHandler>,
}

/// Worker pool builder.
pub struct Runner {
    queue: Arc<JobQueue>,
    processors: Vec<Processor>,
    poll_interval: Duration,
    jitter: Duration,
}

impl Runner {
    pub fn new(queue: Arc<JobQueue>) -> Self {
        Self {
            queue,
            processors: Vec::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
        }
    }

    /// How often idle workers poll for new jobs.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Maximum random delay added to each idle poll.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Handle `job_type` with up to `concurrency` jobs in flight.
    pub fn register(mut self, job_type: &str, concurrency: usize, handler: Arc<dyn JobHandler>) -> Self {
        self.processors.push(Processor {
            job_type: job_type.to_string(),
            concurrency: concurrency.max(1),
            handler,
        });
        self
    }

    pub fn job_types(&self) -> Vec<String> {
        self.processors.iter().map(|p| p.job_type.clone()).collect()
    }

    /// Spawn the worker pools.
    pub fn start(&self) -> RunHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let active = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for processor in &self.processors {
            for i in 1..=processor.concurrency {
                let name = format!("worker-{}-{i}", processor.job_type);
                debug!("Starting {name}");
                let worker = Worker {
                    name: name.clone(),
                    queue: self.queue.clone(),
                    job_types: vec![processor.job_type.clone()],
                    handler: processor.handler.clone(),
                    poll_interval: self.poll_interval,
                    jitter: self.jitter,
                    active: active.clone(),
                    shutdown: shutdown_rx.clone(),
                };
                let span = info_span!("worker", worker.name = %name);
                handles.push(tokio::spawn(worker.run().instrument(span)));
            }
        }
        info!(
            "🚀 Job runner started: {} workers for {:?}",
            handles.len(),
            self.job_types()
        );

        RunHandle {
            shutdown: shutdown_tx,
            handles,
            active,
        }
    }

    /// Run every currently due job inline, one at a time, until none is left.
    /// Returns the number of jobs run.
    pub async fn run_until_empty(&self) -> usize {
        let mut ran = 0;
        loop {
            let mut progressed = false;
            for processor in &self.processors {
                let types = [processor.job_type.clone()];
                match self.queue.claim_next(&types, "inline") {
                    Ok(Some(job)) => {
                        execute(&self.queue, processor.handler.as_ref(), "inline", job).await;
                        ran += 1;
                        progressed = true;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!("Failed to claim job: {e}");
                        return ran;
                    }
                }
            }
            if !progressed {
                return ran;
            }
        }
    }
}

/// Handle to running worker pools.
#[derive(Debug)]
pub struct RunHandle {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    active: Arc<AtomicUsize>,
}

impl RunHandle {
    /// Jobs currently being processed.
    pub fn active_jobs(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Stop claiming new jobs and wait up to `grace` for in-flight jobs.
    /// Returns false if workers had to be aborted.
    pub async fn shutdown(self, grace: Duration) -> bool {
        let _ = self.shutdown.send(true);
        let aborts: Vec<_> = self.handles.iter().map(|h| h.abort_handle()).collect();
        match tokio::time::timeout(grace, join_all(self.handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        warn!("Worker task ended abnormally: {e}");
                    }
                }
                true
            }
            Err(_) => {
                warn!(
                    "⚠️ Shutdown grace period elapsed with {} jobs in flight, aborting workers",
                    self.active.load(Ordering::SeqCst)
                );
                for a in aborts {
                    a.abort();
                }
                false
            }
        }
    }
}

struct Worker {
    name: String,
    queue: Arc<JobQueue>,
    job_types: Vec<String>,
    handler: Arc<dyn JobHandler>,
    poll_interval: Duration,
    jitter: Duration,
    active: Arc<AtomicUsize>,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }
        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    async fn run(mut self) {
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let idle = match self.queue.claim_next(&self.job_types, &self.name) {
                Ok(Some(job)) => {
                    self.active.fetch_add(1, Ordering::SeqCst);
                    execute(&self.queue, self.handler.as_ref(), &self.name, job).await;
                    self.active.fetch_sub(1, Ordering::SeqCst);
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    error!("Failed to claim job: {e}");
                    true
                }
            };
            if idle {
                let pause = self.sleep_duration_with_jitter();
                trace!("No due jobs, polling again in {pause:?}");
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    changed = self.shutdown.changed() => {
                        // Handle dropped.
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        debug!("{} stopped", self.name);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> anyhow::Error {
    let msg = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    anyhow::anyhow!("job panicked: {msg}")
}

/// Handler errors are retried unless they carry a non-retryable `CourseHubError`.
fn is_retryable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<CourseHubError>()
        .is_none_or(CourseHubError::is_retryable)
}

/// Run one claimed job and record its outcome.
async fn execute(queue: &Arc<JobQueue>, handler: &dyn JobHandler, worker: &str, job: Job) {
    let span = info_span!("job", job.id = %job.id, job.type = %job.job_type, attempt = job.attempts);
    let ctx = JobContext::new(job, queue.clone());

    let result = AssertUnwindSafe(handler.handle(&ctx))
        .catch_unwind()
        .instrument(span.clone())
        .await
        .map_err(|p| panic_message(&*p))
        .and_then(std::convert::identity);

    let _enter = span.enter();
    let job = &ctx.job;
    match result {
        Ok(value) => {
            if let Err(e) = queue.complete(&job.id, worker, &value) {
                error!("Failed to record completion of job {}: {e}", job.id);
            } else {
                debug!("Job {} completed", job.id);
            }
        }
        Err(e) if !is_retryable(&e) => match queue.fail_permanently(&job.id, worker, &format!("{e:#}")) {
            Ok(()) => error!("❌ Job {} ({}) failed permanently: {e:#}", job.id, job.job_type),
            Err(db) => error!("Failed to record failure of job {}: {db}", job.id),
        },
        Err(e) => match queue.fail(&job.id, worker, &format!("{e:#}")) {
            Ok(FailOutcome::Retrying { next_run_at }) => warn!(
                "⚠️ Job {} ({}) failed on attempt {}/{}: {e:#}; retrying at {next_run_at}",
                job.id, job.job_type, job.attempts, job.max_attempts
            ),
            Ok(FailOutcome::Exhausted) => error!(
                "❌ Job {} ({}) failed permanently after {} attempts: {e:#}",
                job.id, job.job_type, job.attempts
            ),
            Err(db) => error!("Failed to record failure of job {}: {db}", job.id),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{EnqueueOptions, JobStatus, RetryPolicy};
    use chrono::{TimeZone, Utc};
    use coursehub_core::ManualClock;
    use serde_json::json;

    struct Counting {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl JobHandler for Counting {
        async fn handle(&self, ctx: &JobContext) -> anyhow::Result<serde_json::Value> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            ctx.progress(50);
            if n < self.fail_first {
                anyhow::bail!("transient failure #{n}");
            }
            Ok(json!({"handled": ctx.job.id}))
        }
    }

    struct Panicking;

    #[async_trait]
    impl JobHandler for Panicking {
        async fn handle(&self, _ctx: &JobContext) -> anyhow::Result<serde_json::Value> {
            panic!("handler exploded");
        }
    }

    struct Rejecting;

    #[async_trait]
    impl JobHandler for Rejecting {
        async fn handle(&self, _ctx: &JobContext) -> anyhow::Result<serde_json::Value> {
            Err(CourseHubError::Validation("payload is missing activityLogId".into()).into())
        }
    }

    fn queue() -> (Arc<JobQueue>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 5, 10, 0, 0).unwrap()));
        let q = JobQueue::in_memory(clock.clone(), RetryPolicy::default()).unwrap();
        (Arc::new(q), clock)
    }

    #[tokio::test]
    async fn test_run_until_empty_completes_jobs() {
        let (q, _) = queue();
        let handler = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail_first: 0,
        });
        let job = q.enqueue("reminder", json!({}), EnqueueOptions::default()).unwrap();
        q.enqueue("reminder", json!({}), EnqueueOptions::default()).unwrap();
        q.enqueue("unhandled", json!({}), EnqueueOptions::default()).unwrap();

        let runner = Runner::new(q.clone()).register("reminder", 1, handler.clone());
        assert_eq!(runner.run_until_empty().await, 2);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(q.get(&job.id).unwrap().result, Some(json!({"handled": job.id})));
        assert_eq!(q.stats().unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_failures_retry_after_backoff() {
        let (q, clock) = queue();
        let handler = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail_first: 1,
        });
        let job = q.enqueue("reminder", json!({}), EnqueueOptions::default()).unwrap();
        let runner = Runner::new(q.clone()).register("reminder", 1, handler.clone());

        assert_eq!(runner.run_until_empty().await, 1);
        let stored = q.get(&job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Waiting);
        assert_eq!(stored.last_error.as_deref(), Some("transient failure #0"));

        clock.advance(chrono::Duration::seconds(2));
        assert_eq!(runner.run_until_empty().await, 1);
        assert_eq!(q.get(&job.id).unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_panic_is_a_failed_attempt() {
        let (q, clock) = queue();
        let job = q.enqueue("boom", json!({}), EnqueueOptions::default()).unwrap();
        let runner = Runner::new(q.clone()).register("boom", 1, Arc::new(Panicking));
        for _ in 0..3 {
            runner.run_until_empty().await;
            clock.advance(chrono::Duration::seconds(10));
        }
        let stored = q.get(&job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempts, 3);
        assert!(stored.last_error.unwrap().contains("handler exploded"));
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_at_once() {
        let (q, _) = queue();
        let job = q.enqueue("reminder", json!({}), EnqueueOptions::default()).unwrap();
        let runner = Runner::new(q.clone()).register("reminder", 1, Arc::new(Rejecting));
        assert_eq!(runner.run_until_empty().await, 1);
        let stored = q.get(&job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempts, 1);
        assert!(stored.last_error.unwrap().contains("activityLogId"));
    }

    #[tokio::test]
    async fn test_started_workers_drain_and_shut_down() {
        let (q, _) = queue();
        let handler = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail_first: 0,
        });
        for _ in 0..5 {
            q.enqueue("reminder", json!({}), EnqueueOptions::default()).unwrap();
        }
        let runner = Runner::new(q.clone())
            .poll_interval(Duration::from_millis(10))
            .jitter(Duration::ZERO)
            .register("reminder", 2, handler.clone());
        let handle = runner.start();
        assert_eq!(handle.worker_count(), 2);

        for _ in 0..200 {
            if q.stats().unwrap().completed == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(q.stats().unwrap().completed, 5);
        assert!(handle.shutdown(Duration::from_secs(5)).await);
    }
}
