use async_trait::async_trait;
use chrono::{DateTime, Utc};
use vigil_model::{
    Asset, AssetDescriptor, AssetId, AssetStatus, AssetType, Exposure,
    Finding, FindingId, OwnerId, Page, PageRequest, PolicyId, RunId, Severity,
};

use crate::error::Result;

#[derive(Debug, Clone, Default)]
pub struct AssetFilter {
    pub owner: Option<OwnerId>,
    /// Case-insensitive substring of name or identifier.
    pub q: Option<String>,
    pub asset_type: Option<AssetType>,
    pub exposure: Option<Exposure>,
    pub status: Option<AssetStatus>,
}

impl AssetFilter {
    pub fn matches(&self, asset: &Asset) -> bool {
        let text_match = match self.q.as_deref().map(str::trim) {
            Some(q) if !q.is_empty() => {
                let needle = q.to_lowercase();
                asset.name.to_lowercase().contains(&needle)
                    || asset.identifier.to_lowercase().contains(&needle)
            }
            _ => true,
        };
        text_match
            && self.owner.is_none_or(|o| asset.owner == o)
            && self.asset_type.is_none_or(|t| asset.asset_type == t)
            && self.exposure.is_none_or(|e| asset.exposure == e)
            && self.status.is_none_or(|s| asset.status == s)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FindingFilter {
    pub owner: Option<OwnerId>,
    pub asset_id: Option<AssetId>,
    pub open_only: bool,
}

impl FindingFilter {
    pub fn matches(&self, finding: &Finding) -> bool {
        self.owner.is_none_or(|o| finding.owner == o)
            && self.asset_id.is_none_or(|a| finding.asset_id == Some(a))
            && (!self.open_only || finding.is_open())
    }
}

/// An asset reported by a discovery run.
#[derive(Debug, Clone)]
pub struct AssetObservation {
    pub owner: OwnerId,
    pub policy_id: PolicyId,
    pub run_id: RunId,
    pub observed_at: DateTime<Utc>,
    pub descriptor: AssetDescriptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssetUpsert {
    pub asset_id: AssetId,
    pub created: bool,
}

/// A finding reported by a run, with its asset reference already resolved.
#[derive(Debug, Clone)]
pub struct FindingObservation {
    pub owner: OwnerId,
    pub policy_id: PolicyId,
    pub run_id: RunId,
    pub observed_at: DateTime<Utc>,
    pub dedupe_key: String,
    pub asset_id: Option<AssetId>,
    pub severity: Severity,
    pub title: String,
    pub remediation: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FindingUpsert {
    pub finding_id: FindingId,
    pub created: bool,
    pub asset_id: Option<AssetId>,
    /// Asset the finding pointed at before this observation moved it.
    pub previous_asset_id: Option<AssetId>,
}

/// Aggregate inputs for the attack surface score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RiskTotals {
    pub active_assets: u64,
    pub risk_sum: u64,
}

#[async_trait]
pub trait InventoryRepository: Send + Sync {
    async fn insert_asset(&self, asset: &Asset) -> Result<()>;

    async fn get_asset(&self, id: AssetId) -> Result<Option<Asset>>;

    async fn find_asset(
        &self,
        owner: OwnerId,
        asset_type: AssetType,
        identifier: &str,
    ) -> Result<Option<Asset>>;

    async fn update_asset(&self, asset: &Asset) -> Result<bool>;

    /// Findings that pointed at the asset become asset-agnostic.
    async fn delete_asset(&self, id: AssetId) -> Result<bool>;

    /// Newest first.
    async fn list_assets(
        &self,
        filter: &AssetFilter,
        page: PageRequest,
    ) -> Result<Page<Asset>>;

    /// Keyed on `(owner, asset_type, identifier)`. Observations older than
    /// the stored `last_seen` never move it (or status) backwards.
    async fn upsert_observed_asset(
        &self,
        observation: &AssetObservation,
    ) -> Result<AssetUpsert>;

    /// Flags ACTIVE assets discovered by `policy_id` whose last sighting is
    /// not one of `keep_runs` as STALE. Assets sighted at or after `at` by
    /// any policy are left alone.
    async fn mark_stale_assets(
        &self,
        policy_id: PolicyId,
        keep_runs: &[RunId],
        at: DateTime<Utc>,
    ) -> Result<Vec<AssetId>>;

    /// Keyed on `(owner, dedupe_key)`. Newer observations reopen a resolved
    /// finding; older ones are ignored.
    async fn upsert_finding(
        &self,
        observation: &FindingObservation,
    ) -> Result<FindingUpsert>;

    /// Resolves open findings reported by `policy_id` whose last sighting is
    /// not one of `keep_runs`. Returns the resolved findings' assets.
    async fn resolve_absent_findings(
        &self,
        policy_id: PolicyId,
        keep_runs: &[RunId],
        at: DateTime<Utc>,
    ) -> Result<Vec<(FindingId, Option<AssetId>)>>;

    async fn open_finding_severities(
        &self,
        asset_id: AssetId,
    ) -> Result<Vec<Severity>>;

    async fn set_risk_score(&self, asset_id: AssetId, score: u8)
    -> Result<()>;

    /// Newest first.
    async fn list_findings(
        &self,
        filter: &FindingFilter,
        page: PageRequest,
    ) -> Result<Page<Finding>>;

    async fn open_findings_by_severity(
        &self,
        owner: OwnerId,
    ) -> Result<Vec<(Severity, u64)>>;

    async fn active_risk_totals(&self, owner: OwnerId) -> Result<RiskTotals>;
}
