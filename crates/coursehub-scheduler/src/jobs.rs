//! Notification job kinds and their payload.

use chrono::{DateTime, Utc};
use coursehub_core::{CourseHubError, Result};
use serde::{Deserialize, Serialize};

/// The three notification jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Reminder,
    OverdueAlert,
    SubmissionNotification,
}

impl NotificationKind {
    pub const ALL: [NotificationKind; 3] = [
        NotificationKind::Reminder,
        NotificationKind::OverdueAlert,
        NotificationKind::SubmissionNotification,
    ];

    /// Queue job type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reminder => "reminder",
            Self::OverdueAlert => "overdue_alert",
            Self::SubmissionNotification => "submission_notification",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| CourseHubError::Validation(format!("Unknown notification job type '{s}'")))
    }

    /// Overdue alerts first, submission notices last.
    pub fn priority(&self) -> i32 {
        match self {
            Self::OverdueAlert => 10,
            Self::Reminder => 5,
            Self::SubmissionNotification => 3,
        }
    }
}

/// What every notification job carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    pub activity_log_id: String,
    pub course_offering_id: String,
    pub facilitator_id: String,
    /// Manager at scheduling time. The dispatcher re-resolves it before sending.
    #[serde(default)]
    pub manager_id: Option<String>,
    pub due_date: DateTime<Utc>,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
}

/// Key under which at most one open job per log and kind may exist.
pub fn dedup_key(kind: NotificationKind, activity_log_id: &str) -> String {
    format!("{}:{activity_log_id}", kind.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_and_priorities() {
        for kind in NotificationKind::ALL {
            assert_eq!(NotificationKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(NotificationKind::parse("digest").is_err());
        assert!(NotificationKind::OverdueAlert.priority() > NotificationKind::Reminder.priority());
        assert!(NotificationKind::Reminder.priority() > NotificationKind::SubmissionNotification.priority());
        assert_eq!(dedup_key(NotificationKind::Reminder, "AT-1"), "reminder:AT-1");
    }
}
