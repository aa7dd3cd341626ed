use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::asset::{AssetType, Exposure};
use crate::finding::Severity;
use crate::ids::{AssetId, OwnerId, PolicyId, RunId};
use crate::policy::PolicyKind;

text_enum!(
    /// Lifecycle of a single run. `Queued` and `Running` are in flight;
    /// everything else is terminal.
    RunStatus, "run status" {
        Queued => "QUEUED",
        Running => "RUNNING",
        Succeeded => "SUCCEEDED",
        Failed => "FAILED",
        TimedOut => "TIMED_OUT",
    }
);

impl RunStatus {
    pub const IN_FLIGHT: &'static [RunStatus] = &[RunStatus::Queued, RunStatus::Running];

    pub fn is_terminal(&self) -> bool {
        !self.is_in_flight()
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, RunStatus::Queued | RunStatus::Running)
    }
}

text_enum!(
    ErrorCategory, "error category" {
        Configuration => "configuration",
        Dispatch => "dispatch",
        Execution => "execution",
        Timeout => "timeout",
    }
);

/// Classified failure attached to a failed or timed out run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub category: ErrorCategory,
    pub message: String,
    pub retryable: bool,
}

impl RunError {
    pub fn new(category: ErrorCategory, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            category,
            message: message.into(),
            retryable,
        }
    }

    pub fn dispatch(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Dispatch, message, true)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Timeout, message, true)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSummary {
    pub discovered_assets: u32,
    pub reported_findings: u32,
    pub new_assets: u32,
    pub stale_assets: u32,
    pub resolved_findings: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
}

impl RunSummary {
    pub fn failed(error: RunError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }
}

/// Asset observed by a discovery run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetDescriptor {
    pub asset_type: AssetType,
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposure: Option<Exposure>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Points a finding at an inventory asset either by id or by natural key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AssetLocator {
    Id {
        asset_id: AssetId,
    },
    NaturalKey {
        asset_type: AssetType,
        identifier: String,
    },
}

/// Issue observed by a scan run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindingDescriptor {
    /// Stable dedupe key chosen by the scanner.
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<AssetLocator>,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

/// Result payload a worker attaches when a run succeeds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunPayload {
    pub discovered_assets: Vec<AssetDescriptor>,
    pub findings: Vec<FindingDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub policy_id: PolicyId,
    pub owner: OwnerId,
    pub kind: PolicyKind,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub summary: RunSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<RunPayload>,
    /// Set once the payload has been folded into inventory and findings.
    pub reconciled_at: Option<DateTime<Utc>>,
}

impl Run {
    /// Moment the run's observations are attributed to.
    pub fn observed_at(&self) -> DateTime<Utc> {
        self.finished_at.unwrap_or(self.created_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locator_accepts_id_or_natural_key() {
        let by_key: AssetLocator =
            serde_json::from_str(r#"{"asset_type":"domain","identifier":"example.com"}"#)
                .unwrap();
        assert_eq!(
            by_key,
            AssetLocator::NaturalKey {
                asset_type: AssetType::Domain,
                identifier: "example.com".into(),
            }
        );

        let id = AssetId::new();
        let by_id: AssetLocator =
            serde_json::from_value(serde_json::json!({ "asset_id": id })).unwrap();
        assert_eq!(by_id, AssetLocator::Id { asset_id: id });
    }

    #[test]
    fn status_wire_names_are_stable() {
        assert_eq!(RunStatus::TimedOut.as_str(), "TIMED_OUT");
        assert_eq!("SUCCEEDED".parse::<RunStatus>().unwrap(), RunStatus::Succeeded);
        assert!(RunStatus::Running.is_in_flight());
        assert!(RunStatus::Failed.is_terminal());
    }
}
