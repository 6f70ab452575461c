//! # CourseHub Scheduler
//!
//! Compliance notifications for weekly activity logs: reminders before the
//! due date, overdue alerts to managers, and submission notices. Jobs flow
//! through the durable queue and are delivered by the [`Dispatcher`].

pub mod dispatch;
pub mod jobs;
pub mod scheduler;
pub mod templates;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use dispatch::{DispatchOutcome, Dispatcher};
pub use jobs::{NotificationKind, NotificationPayload, dedup_key};
pub use scheduler::{Scheduler, SweepReport};
pub use templates::RenderedEmail;
pub use worker::{NotificationWorker, WorkerStatus};
