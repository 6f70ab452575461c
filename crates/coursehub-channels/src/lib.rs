//! # CourseHub Channels
//!
//! Outbound email transports behind the core `EmailSender` trait.

pub mod dry_run;
pub mod email;

use coursehub_core::config::EmailConfig;
use coursehub_core::{EmailSender, Result};
use std::sync::Arc;

pub use dry_run::DryRunEmailSender;
pub use email::SmtpEmailSender;

/// Pick the transport the configuration asks for.
pub fn from_config(config: &EmailConfig) -> Result<Arc<dyn EmailSender>> {
    if config.dry_run {
        tracing::warn!("Email dry-run enabled: notifications will be logged, not sent");
        return Ok(Arc::new(DryRunEmailSender));
    }
    Ok(Arc::new(SmtpEmailSender::new(config)?))
}
