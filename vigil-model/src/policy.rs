use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::asset::AssetType;
use crate::ids::{AssetId, OwnerId, PolicyId};

text_enum!(
    /// Which family of job a policy produces.
    PolicyKind, "policy kind" {
        Discovery => "DISCOVERY",
        Scan => "SCAN",
    }
);

text_enum!(
    /// Worker hint for depth/concurrency. Opaque to the engine.
    Intensity, "intensity" {
        Light => "LIGHT",
        Normal => "NORMAL",
        Deep => "DEEP",
    }
);

impl Default for Intensity {
    fn default() -> Self {
        Intensity::Normal
    }
}

text_enum!(
    PolicyStatus, "policy status" {
        Pending => "PENDING",
        Active => "ACTIVE",
        Paused => "PAUSED",
        Archived => "ARCHIVED",
    }
);

text_enum!(
    ScheduleType, "schedule type" {
        Quick => "QUICK",
        Interval => "INTERVAL",
        Cron => "CRON",
    }
);

text_enum!(
    ScanType, "scan type" {
        External => "external",
        Internal => "internal",
    }
);

impl Default for ScanType {
    fn default() -> Self {
        ScanType::External
    }
}

/// Raw schedule as supplied by the user. Parsed and validated by the
/// schedule evaluator before it is ever persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleDescriptor {
    #[serde(rename = "type")]
    pub schedule_type: ScheduleType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl ScheduleDescriptor {
    pub fn quick() -> Self {
        Self {
            schedule_type: ScheduleType::Quick,
            value: None,
        }
    }

    pub fn interval(value: impl Into<String>) -> Self {
        Self {
            schedule_type: ScheduleType::Interval,
            value: Some(value.into()),
        }
    }

    pub fn cron(value: impl Into<String>) -> Self {
        Self {
            schedule_type: ScheduleType::Cron,
            value: Some(value.into()),
        }
    }
}

/// What a policy runs against. Exactly one source is used per policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", content = "values")]
pub enum TargetSelection {
    #[serde(rename = "FROM_ASSET")]
    FromAssets(Vec<AssetId>),
    #[serde(rename = "MANUAL_ENTRY")]
    Manual(Vec<String>),
}

impl TargetSelection {
    pub fn len(&self) -> usize {
        match self {
            TargetSelection::FromAssets(ids) => ids.len(),
            TargetSelection::Manual(targets) => targets.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoverySpec {
    pub asset_type: AssetType,
    /// Mark discovered assets stale once they are missing from this many
    /// consecutive successful runs. `None` disables staleness.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_after_runs: Option<u32>,
}

fn default_resolve_after_runs() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSpec {
    #[serde(default)]
    pub scan_type: ScanType,
    /// Resolve open findings once they are missing from this many
    /// consecutive successful runs.
    #[serde(default = "default_resolve_after_runs")]
    pub resolve_after_runs: u32,
}

impl Default for ScanSpec {
    fn default() -> Self {
        Self {
            scan_type: ScanType::default(),
            resolve_after_runs: default_resolve_after_runs(),
        }
    }
}

/// Kind-specific payload carried inside the shared policy envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum PolicySpec {
    #[serde(rename = "DISCOVERY")]
    Discovery(DiscoverySpec),
    #[serde(rename = "SCAN")]
    Scan(ScanSpec),
}

impl PolicySpec {
    pub fn kind(&self) -> PolicyKind {
        match self {
            PolicySpec::Discovery(_) => PolicyKind::Discovery,
            PolicySpec::Scan(_) => PolicyKind::Scan,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: PolicyId,
    pub owner: OwnerId,
    pub name: String,
    pub spec: PolicySpec,
    pub targets: TargetSelection,
    pub intensity: Intensity,
    pub schedule: ScheduleDescriptor,
    pub status: PolicyStatus,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    /// Explicit re-trigger that has not been dispatched yet.
    pub trigger_requested_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Policy {
    pub fn kind(&self) -> PolicyKind {
        self.spec.kind()
    }
}
