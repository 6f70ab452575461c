//! Error taxonomy shared by every CourseHub crate.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, CourseHubError>;

/// All errors surfaced by the core services.
#[derive(Debug, Error)]
pub enum CourseHubError {
    /// A referenced entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The caller lacks ownership or the required role.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Duplicate key or an invalid state transition.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Malformed input field.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Email or queue infrastructure failure; the job may be retried.
    #[error("Delivery failed: {0}")]
    TransientDelivery(String),

    /// Delivery attempts exhausted.
    #[error("Delivery abandoned: {0}")]
    TerminalDelivery(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CourseHubError {
    /// HTTP status code the outer API layer should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::Forbidden(_) => 403,
            Self::Conflict(_) => 409,
            Self::Validation(_) => 400,
            Self::TransientDelivery(_) | Self::TerminalDelivery(_) => 503,
            _ => 500,
        }
    }

    /// Whether a job that failed with this error is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientDelivery(_) | Self::Database(_) | Self::Io(_) | Self::NotFound(_)
        )
    }
}
