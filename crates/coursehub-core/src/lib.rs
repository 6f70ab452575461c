//! # CourseHub Core
//!
//! Types shared by every CourseHub crate: the error taxonomy, configuration,
//! caller identity, and the collaborator traits the compliance pipeline is
//! built against (`Clock`, `Directory`, `EmailSender`).

pub mod config;
pub mod directory;
pub mod error;
pub mod identity;
pub mod mail;
pub mod time;

pub use config::CourseHubConfig;
pub use directory::{Assignment, Contact, Directory, StaticDirectory};
pub use error::{CourseHubError, Result};
pub use identity::CallerIdentity;
pub use mail::EmailSender;
pub use time::{Clock, ManualClock, SystemClock};
