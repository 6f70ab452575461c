//! Caller identity, resolved once by the authentication layer and passed
//! into the core as an opaque value.

use serde::{Deserialize, Serialize};

use crate::error::{CourseHubError, Result};

/// Who is calling, tagged by role. Each variant carries the id of the
/// role-specific profile (manager / facilitator / student record).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum CallerIdentity {
    Manager { user_id: String, manager_id: String },
    Facilitator { user_id: String, facilitator_id: String },
    Student { user_id: String, student_id: String },
}

impl CallerIdentity {
    pub fn manager(id: &str) -> Self {
        Self::Manager {
            user_id: String::new(),
            manager_id: id.to_string(),
        }
    }

    pub fn facilitator(id: &str) -> Self {
        Self::Facilitator {
            user_id: String::new(),
            facilitator_id: id.to_string(),
        }
    }

    pub fn student(id: &str) -> Self {
        Self::Student {
            user_id: String::new(),
            student_id: id.to_string(),
        }
    }

    /// Build from the role string and profile id forwarded by the auth layer.
    pub fn from_parts(role: &str, profile_id: &str, user_id: Option<&str>) -> Result<Self> {
        if profile_id.trim().is_empty() {
            return Err(CourseHubError::Validation("Caller id is empty".into()));
        }
        let user_id = user_id.unwrap_or_default().to_string();
        let profile_id = profile_id.to_string();
        match role.to_ascii_lowercase().as_str() {
            "manager" => Ok(Self::Manager {
                user_id,
                manager_id: profile_id,
            }),
            "facilitator" => Ok(Self::Facilitator {
                user_id,
                facilitator_id: profile_id,
            }),
            "student" => Ok(Self::Student {
                user_id,
                student_id: profile_id,
            }),
            other => Err(CourseHubError::Validation(format!("Unknown role '{other}'"))),
        }
    }

    pub fn role_name(&self) -> &'static str {
        match self {
            Self::Manager { .. } => "manager",
            Self::Facilitator { .. } => "facilitator",
            Self::Student { .. } => "student",
        }
    }

    /// The facilitator profile id, or `Forbidden` for any other role.
    pub fn require_facilitator(&self) -> Result<&str> {
        match self {
            Self::Facilitator { facilitator_id, .. } => Ok(facilitator_id),
            other => Err(CourseHubError::Forbidden(format!(
                "Only facilitators can do this (caller is a {})",
                other.role_name()
            ))),
        }
    }

    /// The manager profile id, or `Forbidden` for any other role.
    pub fn require_manager(&self) -> Result<&str> {
        match self {
            Self::Manager { manager_id, .. } => Ok(manager_id),
            other => Err(CourseHubError::Forbidden(format!(
                "Only managers can do this (caller is a {})",
                other.role_name()
            ))),
        }
    }
}
