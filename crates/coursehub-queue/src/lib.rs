//! # CourseHub Queue
//!
//! A durable job queue on SQLite: delayed jobs, priorities, bounded retries
//! with exponential backoff, stalled-job recovery, retention cleanup and
//! per-type worker pools.

pub mod job;
pub mod runner;
pub mod store;

pub use job::{
    CleanReport, EnqueueOptions, FailOutcome, Job, JobStatus, QueueStats, RetentionPolicy, RetryPolicy,
};
pub use runner::{JobContext, JobHandler, RunHandle, Runner};
pub use store::JobQueue;
