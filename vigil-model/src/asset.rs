use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AssetId, OwnerId, PolicyId, RunId};

text_enum!(
    AssetType, "asset type" {
        Domain => "domain",
        Ip => "ip",
        Cloud => "cloud",
        Repo => "repo",
        Saas => "saas",
        User => "user",
    }
);

impl AssetType {
    /// Asset types a discovery policy may target.
    pub const DISCOVERABLE: &'static [AssetType] =
        &[AssetType::Domain, AssetType::Cloud, AssetType::Saas];

    pub fn is_discoverable(&self) -> bool {
        Self::DISCOVERABLE.contains(self)
    }

    /// Canonical form of an identifier of this type, `None` when blank.
    /// Domains compare case-insensitively and ignore a trailing root dot.
    pub fn normalize_identifier(&self, raw: &str) -> Option<String> {
        let trimmed = raw.trim();
        let canonical = match self {
            AssetType::Domain => trimmed.trim_end_matches('.').to_ascii_lowercase(),
            _ => trimmed.to_string(),
        };
        (!canonical.is_empty()).then_some(canonical)
    }
}

text_enum!(
    Exposure, "exposure" {
        Public => "public",
        Internal => "internal",
    }
);

impl Default for Exposure {
    fn default() -> Self {
        Exposure::Internal
    }
}

text_enum!(
    AssetStatus, "asset status" {
        Active => "active",
        Stale => "stale",
        Removed => "removed",
    }
);

/// Inventory entry, either created by hand or discovered by a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: AssetId,
    pub owner: OwnerId,
    pub name: String,
    pub asset_type: AssetType,
    /// Natural key together with `asset_type` (hostname, address, ARN...).
    pub identifier: String,
    pub exposure: Exposure,
    /// 0..=100, derived from open findings.
    pub risk_score: u8,
    pub tags: BTreeSet<String>,
    pub status: AssetStatus,
    pub description: Option<String>,
    pub discovered_by: Option<PolicyId>,
    pub last_seen_run: Option<RunId>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
