use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AssetId, FindingId, OwnerId, PolicyId, RunId};

text_enum!(
    Severity, "severity" {
        Info => "info",
        Low => "low",
        Medium => "medium",
        High => "high",
        Critical => "critical",
    }
);

impl Severity {
    /// Ordering key, `Info` lowest.
    pub fn rank(&self) -> u8 {
        match self {
            Severity::Info => 0,
            Severity::Low => 1,
            Severity::Medium => 2,
            Severity::High => 3,
            Severity::Critical => 4,
        }
    }
}

impl PartialOrd for Severity {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Severity {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

/// A security issue reported by a scan, deduplicated per owner by
/// `dedupe_key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub id: FindingId,
    pub owner: OwnerId,
    /// Run that first reported the finding.
    pub run_id: RunId,
    pub policy_id: PolicyId,
    pub asset_id: Option<AssetId>,
    pub severity: Severity,
    pub dedupe_key: String,
    pub title: String,
    pub remediation: Option<String>,
    pub discovered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub last_seen_run: RunId,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Finding {
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_orders_by_rank() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Info < Severity::Low);
        assert_eq!(
            Severity::ALL.iter().max().copied(),
            Some(Severity::Critical)
        );
    }
}
