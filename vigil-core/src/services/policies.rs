use std::{collections::HashSet, sync::Arc};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use vigil_model::{
    AssetId, Intensity, OwnerId, Page, PageRequest, Policy, PolicyId,
    PolicyKind, PolicySpec, PolicyStatus, ScheduleDescriptor, TargetSelection,
};

use crate::{
    database::{
        Store, next_revision,
        ports::{InventoryRepository, PolicyFilter, PolicyRepository},
        storage_time,
    },
    error::{Result, VigilError},
    schedule::{Schedule, policy_next_run_at},
};

pub const MAX_POLICY_NAME_LEN: usize = 200;
const UPDATE_ATTEMPTS: usize = 3;

fn default_activate() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CreatePolicy {
    pub name: String,
    pub spec: PolicySpec,
    pub targets: TargetSelection,
    #[serde(default)]
    pub intensity: Intensity,
    pub schedule: ScheduleDescriptor,
    /// `false` stores the policy as a PENDING draft.
    #[serde(default = "default_activate")]
    pub activate: bool,
}

/// Partial update; absent fields keep their stored value.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct UpdatePolicy {
    pub name: Option<String>,
    pub spec: Option<PolicySpec>,
    pub targets: Option<TargetSelection>,
    pub intensity: Option<Intensity>,
    pub schedule: Option<ScheduleDescriptor>,
    pub status: Option<PolicyStatus>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PolicyQuery {
    pub status: Option<PolicyStatus>,
    pub kind: Option<PolicyKind>,
}

/// Owner-scoped policy management. Every write validates synchronously, so
/// nothing the scheduler reads can carry a bad schedule or target list.
#[derive(Clone)]
pub struct PolicyService {
    store: Arc<dyn Store>,
}

impl std::fmt::Debug for PolicyService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyService").finish_non_exhaustive()
    }
}

impl PolicyService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    #[instrument(skip(self, request), fields(name = %request.name), err)]
    pub async fn create_policy(
        &self,
        owner: OwnerId,
        request: CreatePolicy,
    ) -> Result<Policy> {
        let name = validate_name(&request.name)?;
        validate_spec(&request.spec)?;
        Schedule::parse(&request.schedule)?;
        let targets = self.validate_targets(owner, request.targets).await?;

        let now = storage_time(Utc::now());
        let mut policy = Policy {
            id: PolicyId::new(),
            owner,
            name,
            spec: request.spec,
            targets,
            intensity: request.intensity,
            schedule: request.schedule,
            status: if request.activate {
                PolicyStatus::Active
            } else {
                PolicyStatus::Pending
            },
            last_run_at: None,
            next_run_at: None,
            trigger_requested_at: None,
            created_at: now,
            updated_at: now,
        };
        policy.next_run_at = policy_next_run_at(&policy)?;

        self.store.insert_policy(&policy).await?;
        info!(policy_id = %policy.id, kind = %policy.kind(), status = %policy.status, "policy created");
        Ok(policy)
    }

    pub async fn get_policy(
        &self,
        owner: OwnerId,
        id: PolicyId,
    ) -> Result<Policy> {
        self.store
            .get_policy(id)
            .await?
            .filter(|policy| policy.owner == owner)
            .ok_or_else(|| VigilError::not_found("policy", id))
    }

    pub async fn list_policies(
        &self,
        owner: OwnerId,
        query: PolicyQuery,
        page: PageRequest,
    ) -> Result<Page<Policy>> {
        let filter = PolicyFilter {
            owner: Some(owner),
            status: query.status,
            kind: query.kind,
        };
        self.store.list_policies(&filter, page.normalized()).await
    }

    #[instrument(skip(self, request), err)]
    pub async fn update_policy(
        &self,
        owner: OwnerId,
        id: PolicyId,
        request: UpdatePolicy,
    ) -> Result<Policy> {
        let name = request.name.as_deref().map(validate_name).transpose()?;
        if let Some(spec) = &request.spec {
            validate_spec(spec)?;
        }
        if let Some(schedule) = &request.schedule {
            Schedule::parse(schedule)?;
        }
        let targets = match request.targets.clone() {
            Some(targets) => Some(self.validate_targets(owner, targets).await?),
            None => None,
        };

        for _ in 0..UPDATE_ATTEMPTS {
            let current = self.get_policy(owner, id).await?;
            let mut policy = current.clone();

            if let Some(status) = request.status
                && status != policy.status
            {
                if policy.status == PolicyStatus::Archived {
                    return Err(VigilError::InvalidTransition(format!(
                        "policy {id} is archived and cannot become {status}"
                    )));
                }
                policy.status = status;
            }
            if let Some(spec) = &request.spec {
                if spec.kind() != policy.kind() {
                    return Err(VigilError::Configuration(format!(
                        "policy {id} is a {} policy; its kind cannot change",
                        policy.kind()
                    )));
                }
                policy.spec = spec.clone();
            }
            if let Some(name) = &name {
                policy.name = name.clone();
            }
            if let Some(targets) = &targets {
                policy.targets = targets.clone();
            }
            if let Some(intensity) = request.intensity {
                policy.intensity = intensity;
            }
            if let Some(schedule) = &request.schedule {
                policy.schedule = schedule.clone();
            }
            policy.next_run_at = policy_next_run_at(&policy)?;
            policy.updated_at = next_revision(current.updated_at, Utc::now());

            if self.store.update_policy(&policy, current.updated_at).await? {
                info!(policy_id = %id, status = %policy.status, "policy updated");
                return Ok(policy);
            }
        }
        Err(VigilError::Conflict(format!(
            "policy {id} was modified concurrently; retry the update"
        )))
    }

    /// Asks for an out-of-schedule run. The policy becomes due immediately
    /// unless it is paused or still a draft, in which case the request waits
    /// for activation.
    #[instrument(skip(self), err)]
    pub async fn trigger_policy(
        &self,
        owner: OwnerId,
        id: PolicyId,
    ) -> Result<Policy> {
        for _ in 0..UPDATE_ATTEMPTS {
            let current = self.get_policy(owner, id).await?;
            if current.status == PolicyStatus::Archived {
                return Err(VigilError::InvalidTransition(format!(
                    "policy {id} is archived and cannot be triggered"
                )));
            }
            if current.trigger_requested_at.is_some() {
                return Ok(current);
            }

            let now = storage_time(Utc::now());
            let mut policy = current.clone();
            policy.trigger_requested_at = Some(now);
            policy.next_run_at = policy_next_run_at(&policy)?;
            policy.updated_at = next_revision(current.updated_at, now);

            if self.store.update_policy(&policy, current.updated_at).await? {
                info!(policy_id = %id, "policy run requested");
                return Ok(policy);
            }
        }
        Err(VigilError::Conflict(format!(
            "policy {id} was modified concurrently; retry the trigger"
        )))
    }

    /// Removes the policy and its run history. Inventory it produced stays.
    #[instrument(skip(self), err)]
    pub async fn delete_policy(&self, owner: OwnerId, id: PolicyId) -> Result<()> {
        self.get_policy(owner, id).await?;
        if !self.store.delete_policy(id).await? {
            return Err(VigilError::not_found("policy", id));
        }
        info!(policy_id = %id, "policy deleted");
        Ok(())
    }

    async fn validate_targets(
        &self,
        owner: OwnerId,
        targets: TargetSelection,
    ) -> Result<TargetSelection> {
        let targets = normalize_targets(targets)?;
        if let TargetSelection::FromAssets(ids) = &targets {
            for asset_id in ids {
                let owned = self
                    .store
                    .get_asset(*asset_id)
                    .await?
                    .is_some_and(|asset| asset.owner == owner);
                if !owned {
                    return Err(VigilError::Configuration(format!(
                        "target asset {asset_id} does not exist"
                    )));
                }
            }
        }
        Ok(targets)
    }
}

fn validate_name(raw: &str) -> Result<String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(VigilError::Configuration("policy name is required".into()));
    }
    if name.chars().count() > MAX_POLICY_NAME_LEN {
        return Err(VigilError::Configuration(format!(
            "policy name exceeds {MAX_POLICY_NAME_LEN} characters"
        )));
    }
    Ok(name.to_string())
}

fn validate_spec(spec: &PolicySpec) -> Result<()> {
    match spec {
        PolicySpec::Discovery(discovery) => {
            if !discovery.asset_type.is_discoverable() {
                return Err(VigilError::Configuration(format!(
                    "asset type {} cannot be discovered",
                    discovery.asset_type
                )));
            }
            if discovery.stale_after_runs == Some(0) {
                return Err(VigilError::Configuration(
                    "stale_after_runs must be at least 1".into(),
                ));
            }
        }
        PolicySpec::Scan(scan) => {
            if scan.resolve_after_runs == 0 {
                return Err(VigilError::Configuration(
                    "resolve_after_runs must be at least 1".into(),
                ));
            }
        }
    }
    Ok(())
}

/// Trims manual targets and collapses duplicates, keeping first-seen order.
fn normalize_targets(targets: TargetSelection) -> Result<TargetSelection> {
    let normalized = match targets {
        TargetSelection::FromAssets(ids) => {
            let mut seen: HashSet<AssetId> = HashSet::new();
            TargetSelection::FromAssets(
                ids.into_iter().filter(|id| seen.insert(*id)).collect(),
            )
        }
        TargetSelection::Manual(entries) => {
            let mut seen: HashSet<String> = HashSet::new();
            let mut cleaned = Vec::with_capacity(entries.len());
            for entry in entries {
                let entry = entry.trim();
                if entry.is_empty() {
                    return Err(VigilError::Configuration(
                        "manual targets must not be blank".into(),
                    ));
                }
                if seen.insert(entry.to_string()) {
                    cleaned.push(entry.to_string());
                }
            }
            TargetSelection::Manual(cleaned)
        }
    };
    if normalized.is_empty() {
        return Err(VigilError::Configuration(
            "a policy needs at least one target".into(),
        ));
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_targets_are_trimmed_and_deduplicated() {
        let targets = normalize_targets(TargetSelection::Manual(vec![
            " example.com ".into(),
            "example.com".into(),
            "api.example.com".into(),
        ]))
        .unwrap();
        assert_eq!(
            targets,
            TargetSelection::Manual(vec![
                "example.com".into(),
                "api.example.com".into()
            ])
        );
    }

    #[test]
    fn empty_or_blank_targets_are_rejected() {
        assert!(normalize_targets(TargetSelection::Manual(vec![])).is_err());
        assert!(normalize_targets(TargetSelection::FromAssets(vec![])).is_err());
        assert!(
            normalize_targets(TargetSelection::Manual(vec!["  ".into()]))
                .is_err()
        );
    }

    #[test]
    fn names_are_bounded() {
        assert_eq!(validate_name("  nightly ").unwrap(), "nightly");
        assert!(validate_name("   ").is_err());
        assert!(validate_name(&"x".repeat(MAX_POLICY_NAME_LEN)).is_ok());
        assert!(validate_name(&"x".repeat(MAX_POLICY_NAME_LEN + 1)).is_err());
    }
}
