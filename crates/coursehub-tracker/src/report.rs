//! Compliance statistics over a set of activity logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{ActivityLog, ActivityLogView};
use crate::store::Pagination;

/// Aggregate counts and rates. `pending_logs` are unsubmitted and not yet
/// due. Rates are percentages rounded to 2 decimals
/// and are 0 when there are no logs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceStats {
    pub total_logs: u64,
    pub submitted_logs: u64,
    pub overdue_logs: u64,
    pub on_time_logs: u64,
    pub pending_logs: u64,
    pub compliance_rate: f64,
    pub on_time_rate: f64,
}

impl ComplianceStats {
    pub fn from_logs(logs: &[ActivityLog], now: DateTime<Utc>) -> Self {
        let total = logs.len() as u64;
        let submitted = logs.iter().filter(|l| l.is_submitted).count() as u64;
        let overdue = logs.iter().filter(|l| l.is_overdue(now)).count() as u64;
        let on_time = logs.iter().filter(|l| l.submitted_on_time()).count() as u64;
        Self {
            total_logs: total,
            submitted_logs: submitted,
            overdue_logs: overdue,
            on_time_logs: on_time,
            pending_logs: total - submitted - overdue,
            compliance_rate: percentage(submitted, total),
            on_time_rate: percentage(on_time, total),
        }
    }
}

fn percentage(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (part as f64 / total as f64 * 10_000.0).round() / 100.0
}

/// A page of logs as returned to API callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogPage {
    pub activity_logs: Vec<ActivityLogView>,
    pub pagination: Pagination,
}

/// Manager-facing compliance report: the filtered logs plus their statistics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceReport {
    pub activity_logs: Vec<ActivityLogView>,
    pub statistics: ComplianceStats,
}

/// A facilitator's own logs, one page, with statistics over all of them.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FacilitatorSummary {
    pub activity_logs: Vec<ActivityLogView>,
    pub pagination: Pagination,
    pub statistics: ComplianceStats,
}
