//! # CourseHub Tracker
//!
//! Weekly facilitator activity logs: the record store, the submission state
//! machine and manager-facing compliance reporting.

pub mod directory;
pub mod model;
pub mod report;
pub mod service;
pub mod store;

pub use directory::SqliteDirectory;
pub use model::{ActivityLog, ActivityLogView, LogPatch, NewActivityLog, TaskStatus};
pub use report::ComplianceStats;
pub use service::{ActivityLogService, BulkCreateReport, BulkCreateRequest, LogObserver};
pub use store::{LogFilter, Page, TrackerDb};
