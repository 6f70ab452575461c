//! Transport that only logs.

use async_trait::async_trait;
use coursehub_core::{EmailSender, Result};
use tracing::info;

/// Logs each message instead of sending it. Used when `email.dry_run` is set.
#[derive(Debug, Default)]
pub struct DryRunEmailSender;

#[async_trait]
impl EmailSender for DryRunEmailSender {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<String> {
        let id = format!("dry-run-{}", uuid::Uuid::new_v4().simple());
        info!("✉️ [dry-run] to={to} subject=\"{subject}\" ({} bytes) id={id}", body.len());
        Ok(id)
    }

    fn name(&self) -> &str {
        "dry-run"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dry_run_returns_id() {
        let sender = DryRunEmailSender;
        let id = sender.send("grace@uni.test", "hello", "body").await.unwrap();
        assert!(id.starts_with("dry-run-"));
        assert_eq!(sender.name(), "dry-run");
    }
}
