//! Outbound email collaborator.

use async_trait::async_trait;

use crate::error::Result;

/// Sends one message. Transport failures come back as
/// `CourseHubError::TransientDelivery` so the job queue can retry them.
#[async_trait]
pub trait EmailSender: Send + Sync {
    /// Returns the transport's message id on success.
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<String>;

    /// Transport name for logs and status output.
    fn name(&self) -> &str;
}
