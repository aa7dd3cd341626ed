//! In-process store. One mutex guards every table, which makes each trait
//! method trivially atomic within this process. It offers no coordination
//! across processes; multi-replica deployments use the Postgres adapter.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use vigil_model::{
    Asset, AssetId, AssetStatus, AssetType, Finding, FindingId, OwnerId,
    Page, PageRequest, Policy, PolicyId, PolicyStatus, Run, RunError, RunId,
    RunStatus, RunSummary, Severity,
};

use super::{
    merge::{
        asset_from_observation, finding_from_observation, merge_asset,
        merge_finding,
    },
    next_revision,
    ports::{
        AssetFilter, AssetObservation, AssetUpsert, ClaimOutcome,
        ClaimRequest, FindingFilter, FindingObservation, FindingUpsert,
        InventoryRepository, PolicyFilter, PolicyRepository, RiskTotals,
        RunFilter, RunRepository, RunTransition, TimeoutCutoffs,
    },
};
use crate::error::{Result, VigilError};

#[derive(Debug, Default)]
struct State {
    policies: HashMap<PolicyId, Policy>,
    runs: HashMap<RunId, Run>,
    assets: HashMap<AssetId, Asset>,
    findings: HashMap<FindingId, Finding>,
}

impl State {
    fn has_in_flight(&self, policy_id: PolicyId) -> bool {
        self.runs
            .values()
            .any(|r| r.policy_id == policy_id && r.status.is_in_flight())
    }

    fn asset_by_key(
        &self,
        owner: OwnerId,
        asset_type: AssetType,
        identifier: &str,
    ) -> Option<&Asset> {
        self.assets.values().find(|a| {
            a.owner == owner
                && a.asset_type == asset_type
                && a.identifier == identifier
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn newest_first<T>(items: &mut [T], key: impl Fn(&T) -> (DateTime<Utc>, uuid::Uuid)) {
    items.sort_by(|a, b| key(b).cmp(&key(a)));
}

fn status_counts<S, I>(all: &[S], statuses: I) -> Vec<(S, u64)>
where
    S: Copy + PartialEq,
    I: Iterator<Item = S>,
{
    let observed: Vec<S> = statuses.collect();
    all.iter()
        .map(|s| (*s, observed.iter().filter(|o| *o == s).count() as u64))
        .filter(|(_, n)| *n > 0)
        .collect()
}

#[async_trait]
impl PolicyRepository for InMemoryStore {
    async fn insert_policy(&self, policy: &Policy) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.policies.contains_key(&policy.id) {
            return Err(VigilError::Conflict(format!(
                "policy {} already exists",
                policy.id
            )));
        }
        state.policies.insert(policy.id, policy.clone());
        Ok(())
    }

    async fn get_policy(&self, id: PolicyId) -> Result<Option<Policy>> {
        Ok(self.state.lock().await.policies.get(&id).cloned())
    }

    async fn update_policy(
        &self,
        policy: &Policy,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.policies.get_mut(&policy.id) {
            Some(stored) if stored.updated_at == expected_updated_at => {
                *stored = policy.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_policy(&self, id: PolicyId) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.policies.remove(&id).is_none() {
            return Ok(false);
        }
        state.runs.retain(|_, run| run.policy_id != id);
        for asset in state.assets.values_mut() {
            if asset.discovered_by == Some(id) {
                asset.discovered_by = None;
            }
        }
        Ok(true)
    }

    async fn list_policies(
        &self,
        filter: &PolicyFilter,
        page: PageRequest,
    ) -> Result<Page<Policy>> {
        let state = self.state.lock().await;
        let mut items: Vec<Policy> = state
            .policies
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();
        newest_first(&mut items, |p| (p.created_at, p.id.to_uuid()));
        Ok(Page::from_vec(items, page))
    }

    async fn due_policies(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Policy>> {
        let state = self.state.lock().await;
        let mut due: Vec<Policy> = state
            .policies
            .values()
            .filter(|p| crate::schedule::is_due(p, now))
            .filter(|p| !state.has_in_flight(p.id))
            .cloned()
            .collect();
        due.sort_by_key(|p| (p.next_run_at, p.created_at));
        due.truncate(limit);
        Ok(due)
    }

    async fn policy_status_counts(
        &self,
        owner: OwnerId,
    ) -> Result<Vec<(PolicyStatus, u64)>> {
        let state = self.state.lock().await;
        Ok(status_counts(
            PolicyStatus::ALL,
            state
                .policies
                .values()
                .filter(|p| p.owner == owner)
                .map(|p| p.status),
        ))
    }
}

#[async_trait]
impl RunRepository for InMemoryStore {
    async fn claim_dispatch(
        &self,
        request: ClaimRequest,
    ) -> Result<ClaimOutcome> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let in_flight = state.has_in_flight(request.policy_id);
        let Some(policy) = state.policies.get_mut(&request.policy_id) else {
            return Ok(ClaimOutcome::Stale);
        };
        if policy.updated_at != request.expected_updated_at
            || policy.status != PolicyStatus::Active
        {
            return Ok(ClaimOutcome::Stale);
        }
        if in_flight {
            return Ok(ClaimOutcome::AlreadyInFlight);
        }

        policy.last_run_at = Some(request.now);
        policy.next_run_at = request.next_run_at;
        policy.trigger_requested_at = None;
        policy.updated_at = next_revision(policy.updated_at, request.now);

        state.runs.insert(request.run.id, request.run.clone());
        Ok(ClaimOutcome::Claimed(request.run))
    }

    async fn fail_dispatch(
        &self,
        run_id: RunId,
        error: RunError,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let Some(run) = state.runs.get_mut(&run_id) else {
            return Ok(false);
        };
        if run.status != RunStatus::Queued {
            return Ok(false);
        }
        run.status = RunStatus::Failed;
        run.finished_at = Some(now);
        run.summary = RunSummary::failed(error);

        if let Some(policy) = state.policies.get_mut(&run.policy_id) {
            policy.trigger_requested_at = Some(now);
            policy.next_run_at =
                Some(policy.next_run_at.map_or(now, |at| at.min(now)));
            policy.updated_at = next_revision(policy.updated_at, now);
        }
        Ok(true)
    }

    async fn get_run(&self, id: RunId) -> Result<Option<Run>> {
        Ok(self.state.lock().await.runs.get(&id).cloned())
    }

    async fn transition_run(
        &self,
        transition: RunTransition,
    ) -> Result<Option<Run>> {
        let mut state = self.state.lock().await;
        match state.runs.get_mut(&transition.run_id) {
            Some(run) if run.status == transition.from => {
                transition.apply(run);
                Ok(Some(run.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn expired_runs(
        &self,
        cutoffs: TimeoutCutoffs,
        limit: usize,
    ) -> Result<Vec<Run>> {
        let state = self.state.lock().await;
        let mut expired: Vec<Run> = state
            .runs
            .values()
            .filter(|r| cutoffs.is_expired(r))
            .cloned()
            .collect();
        expired.sort_by_key(|r| r.created_at);
        expired.truncate(limit);
        Ok(expired)
    }

    async fn list_runs(
        &self,
        filter: &RunFilter,
        page: PageRequest,
    ) -> Result<Page<Run>> {
        let state = self.state.lock().await;
        let mut items: Vec<Run> = state
            .runs
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        newest_first(&mut items, |r| (r.created_at, r.id.to_uuid()));
        Ok(Page::from_vec(items, page))
    }

    async fn recent_succeeded_runs(
        &self,
        policy_id: PolicyId,
        limit: usize,
    ) -> Result<Vec<RunId>> {
        let state = self.state.lock().await;
        let mut runs: Vec<&Run> = state
            .runs
            .values()
            .filter(|r| {
                r.policy_id == policy_id && r.status == RunStatus::Succeeded
            })
            .collect();
        runs.sort_by(|a, b| {
            (b.finished_at, b.created_at).cmp(&(a.finished_at, a.created_at))
        });
        Ok(runs.into_iter().take(limit).map(|r| r.id).collect())
    }

    async fn unreconciled_runs(&self, limit: usize) -> Result<Vec<Run>> {
        let state = self.state.lock().await;
        let mut runs: Vec<Run> = state
            .runs
            .values()
            .filter(|r| {
                r.status == RunStatus::Succeeded && r.reconciled_at.is_none()
            })
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.finished_at);
        runs.truncate(limit);
        Ok(runs)
    }

    async fn mark_reconciled(
        &self,
        run_id: RunId,
        summary: &RunSummary,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.runs.get_mut(&run_id) {
            Some(run) if run.reconciled_at.is_none() => {
                run.summary = summary.clone();
                run.reconciled_at = Some(at);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(VigilError::not_found("run", run_id)),
        }
    }

    async fn run_status_counts(
        &self,
        owner: OwnerId,
    ) -> Result<Vec<(RunStatus, u64)>> {
        let state = self.state.lock().await;
        Ok(status_counts(
            RunStatus::ALL,
            state
                .runs
                .values()
                .filter(|r| r.owner == owner)
                .map(|r| r.status),
        ))
    }

    async fn last_run_at(
        &self,
        owner: OwnerId,
    ) -> Result<Option<DateTime<Utc>>> {
        let state = self.state.lock().await;
        Ok(state
            .runs
            .values()
            .filter(|r| r.owner == owner)
            .map(|r| r.created_at)
            .max())
    }
}

#[async_trait]
impl InventoryRepository for InMemoryStore {
    async fn insert_asset(&self, asset: &Asset) -> Result<()> {
        let mut state = self.state.lock().await;
        if state
            .asset_by_key(asset.owner, asset.asset_type, &asset.identifier)
            .is_some()
        {
            return Err(VigilError::Conflict(format!(
                "{} asset {} already exists",
                asset.asset_type, asset.identifier
            )));
        }
        state.assets.insert(asset.id, asset.clone());
        Ok(())
    }

    async fn get_asset(&self, id: AssetId) -> Result<Option<Asset>> {
        Ok(self.state.lock().await.assets.get(&id).cloned())
    }

    async fn find_asset(
        &self,
        owner: OwnerId,
        asset_type: AssetType,
        identifier: &str,
    ) -> Result<Option<Asset>> {
        let state = self.state.lock().await;
        Ok(state.asset_by_key(owner, asset_type, identifier).cloned())
    }

    async fn update_asset(&self, asset: &Asset) -> Result<bool> {
        let mut state = self.state.lock().await;
        if let Some(other) =
            state.asset_by_key(asset.owner, asset.asset_type, &asset.identifier)
            && other.id != asset.id
        {
            return Err(VigilError::Conflict(format!(
                "{} asset {} already exists",
                asset.asset_type, asset.identifier
            )));
        }
        match state.assets.get_mut(&asset.id) {
            Some(stored) => {
                *stored = asset.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_asset(&self, id: AssetId) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.assets.remove(&id).is_none() {
            return Ok(false);
        }
        for finding in state.findings.values_mut() {
            if finding.asset_id == Some(id) {
                finding.asset_id = None;
            }
        }
        Ok(true)
    }

    async fn list_assets(
        &self,
        filter: &AssetFilter,
        page: PageRequest,
    ) -> Result<Page<Asset>> {
        let state = self.state.lock().await;
        let mut items: Vec<Asset> = state
            .assets
            .values()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect();
        newest_first(&mut items, |a| (a.created_at, a.id.to_uuid()));
        Ok(Page::from_vec(items, page))
    }

    async fn upsert_observed_asset(
        &self,
        observation: &AssetObservation,
    ) -> Result<AssetUpsert> {
        let mut state = self.state.lock().await;
        let descriptor = &observation.descriptor;
        let existing = state
            .asset_by_key(
                observation.owner,
                descriptor.asset_type,
                &descriptor.identifier,
            )
            .map(|a| a.id);

        if let Some(asset) =
            existing.and_then(|id| state.assets.get_mut(&id))
        {
            merge_asset(asset, observation);
            return Ok(AssetUpsert {
                asset_id: asset.id,
                created: false,
            });
        }

        let asset = asset_from_observation(observation);
        let asset_id = asset.id;
        state.assets.insert(asset_id, asset);
        Ok(AssetUpsert {
            asset_id,
            created: true,
        })
    }

    async fn mark_stale_assets(
        &self,
        policy_id: PolicyId,
        keep_runs: &[RunId],
        at: DateTime<Utc>,
    ) -> Result<Vec<AssetId>> {
        let mut state = self.state.lock().await;
        let mut stale = Vec::new();
        for asset in state.assets.values_mut() {
            let seen_recently = asset
                .last_seen_run
                .is_some_and(|run| keep_runs.contains(&run));
            if asset.discovered_by == Some(policy_id)
                && asset.status == AssetStatus::Active
                && asset.last_seen < at
                && !seen_recently
            {
                asset.status = AssetStatus::Stale;
                asset.updated_at = asset.updated_at.max(at);
                stale.push(asset.id);
            }
        }
        Ok(stale)
    }

    async fn upsert_finding(
        &self,
        observation: &FindingObservation,
    ) -> Result<FindingUpsert> {
        let mut state = self.state.lock().await;
        let existing = state.findings.values_mut().find(|f| {
            f.owner == observation.owner
                && f.dedupe_key == observation.dedupe_key
        });

        if let Some(finding) = existing {
            return Ok(merge_finding(finding, observation));
        }

        let finding = finding_from_observation(observation);
        let upsert = FindingUpsert {
            finding_id: finding.id,
            created: true,
            asset_id: finding.asset_id,
            previous_asset_id: None,
        };
        state.findings.insert(finding.id, finding);
        Ok(upsert)
    }

    async fn resolve_absent_findings(
        &self,
        policy_id: PolicyId,
        keep_runs: &[RunId],
        at: DateTime<Utc>,
    ) -> Result<Vec<(FindingId, Option<AssetId>)>> {
        let mut state = self.state.lock().await;
        let mut resolved = Vec::new();
        for finding in state.findings.values_mut() {
            if finding.policy_id == policy_id
                && finding.is_open()
                && finding.last_seen <= at
                && !keep_runs.contains(&finding.last_seen_run)
            {
                finding.resolved_at = Some(at);
                resolved.push((finding.id, finding.asset_id));
            }
        }
        Ok(resolved)
    }

    async fn open_finding_severities(
        &self,
        asset_id: AssetId,
    ) -> Result<Vec<Severity>> {
        let state = self.state.lock().await;
        Ok(state
            .findings
            .values()
            .filter(|f| f.asset_id == Some(asset_id) && f.is_open())
            .map(|f| f.severity)
            .collect())
    }

    async fn set_risk_score(
        &self,
        asset_id: AssetId,
        score: u8,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(asset) = state.assets.get_mut(&asset_id) {
            asset.risk_score = score;
        }
        Ok(())
    }

    async fn list_findings(
        &self,
        filter: &FindingFilter,
        page: PageRequest,
    ) -> Result<Page<Finding>> {
        let state = self.state.lock().await;
        let mut items: Vec<Finding> = state
            .findings
            .values()
            .filter(|f| filter.matches(f))
            .cloned()
            .collect();
        newest_first(&mut items, |f| (f.discovered_at, f.id.to_uuid()));
        Ok(Page::from_vec(items, page))
    }

    async fn open_findings_by_severity(
        &self,
        owner: OwnerId,
    ) -> Result<Vec<(Severity, u64)>> {
        let state = self.state.lock().await;
        Ok(status_counts(
            Severity::ALL,
            state
                .findings
                .values()
                .filter(|f| f.owner == owner && f.is_open())
                .map(|f| f.severity),
        ))
    }

    async fn active_risk_totals(&self, owner: OwnerId) -> Result<RiskTotals> {
        let state = self.state.lock().await;
        Ok(state
            .assets
            .values()
            .filter(|a| a.owner == owner && a.status == AssetStatus::Active)
            .fold(RiskTotals::default(), |mut totals, asset| {
                totals.active_assets += 1;
                totals.risk_sum += u64::from(asset.risk_score);
                totals
            }))
    }
}
