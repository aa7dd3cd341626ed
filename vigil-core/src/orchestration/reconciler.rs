//! Result Reconciler.
//!
//! Folds a succeeded run's payload into the asset inventory and the finding
//! set. Every write is an upsert keyed on a natural key and attributed to the
//! run's `finished_at`, so reconciling the same run again converges on the
//! same state.

use std::{collections::BTreeSet, sync::Arc};

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};
use vigil_model::{
    AssetId, AssetLocator, FindingDescriptor, OwnerId, Policy, PolicySpec,
    Run, RunStatus, RunSummary,
};

use crate::{
    database::{
        Store,
        ports::{
            AssetObservation, FindingObservation, InventoryRepository,
            PolicyRepository, RunRepository,
        },
        storage_time,
    },
    error::{Result, VigilError},
    risk::RiskScorer,
};

/// Result of retrying runs whose reconciliation has not landed yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub reconciled: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct ResultReconciler {
    store: Arc<dyn Store>,
    scorer: Arc<dyn RiskScorer>,
}

impl std::fmt::Debug for ResultReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultReconciler")
            .field("scorer", &self.scorer)
            .finish_non_exhaustive()
    }
}

impl ResultReconciler {
    pub fn new(store: Arc<dyn Store>, scorer: Arc<dyn RiskScorer>) -> Self {
        Self { store, scorer }
    }

    #[instrument(skip(self, run), fields(run_id = %run.id, policy_id = %run.policy_id), err)]
    pub async fn reconcile(&self, run: &Run) -> Result<RunSummary> {
        if run.status != RunStatus::Succeeded {
            return Err(VigilError::InvalidTransition(format!(
                "run {} is {}; only SUCCEEDED runs are reconciled",
                run.id, run.status
            )));
        }

        let payload = run.payload.clone().unwrap_or_default();
        let observed_at = run.observed_at();
        let mut summary = RunSummary::default();
        let mut touched: BTreeSet<AssetId> = BTreeSet::new();

        for descriptor in &payload.discovered_assets {
            let Some(identifier) =
                descriptor.asset_type.normalize_identifier(&descriptor.identifier)
            else {
                warn!(asset_type = %descriptor.asset_type, "skipping asset with blank identifier");
                continue;
            };
            let mut descriptor = descriptor.clone();
            descriptor.identifier = identifier;

            let upsert = self
                .store
                .upsert_observed_asset(&AssetObservation {
                    owner: run.owner,
                    policy_id: run.policy_id,
                    run_id: run.id,
                    observed_at,
                    descriptor,
                })
                .await?;
            summary.discovered_assets += 1;
            if upsert.created {
                summary.new_assets += 1;
            }
        }

        for descriptor in &payload.findings {
            let key = descriptor.key.trim();
            if key.is_empty() {
                warn!("skipping finding with blank key");
                continue;
            }
            let asset_id = self.locate_asset(run.owner, descriptor).await?;
            let upsert = self
                .store
                .upsert_finding(&FindingObservation {
                    owner: run.owner,
                    policy_id: run.policy_id,
                    run_id: run.id,
                    observed_at,
                    dedupe_key: key.to_string(),
                    asset_id,
                    severity: descriptor.severity,
                    title: descriptor
                        .title
                        .as_deref()
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .unwrap_or(key)
                        .to_string(),
                    remediation: descriptor.remediation.clone(),
                })
                .await?;
            summary.reported_findings += 1;
            touched.extend(upsert.asset_id);
            touched.extend(upsert.previous_asset_id);
        }

        // A deleted policy keeps its inventory exactly as last reported.
        if let Some(policy) = self.store.get_policy(run.policy_id).await? {
            self.age_out(&policy, observed_at, &mut summary, &mut touched)
                .await?;
        }

        for asset_id in &touched {
            self.rescore(*asset_id).await?;
        }

        let applied = self
            .store
            .mark_reconciled(run.id, &summary, storage_time(Utc::now()))
            .await?;
        if !applied {
            debug!("run was already reconciled; keeping recorded summary");
            if let Some(stored) = self.store.get_run(run.id).await? {
                return Ok(stored.summary);
            }
        }

        info!(
            discovered = summary.discovered_assets,
            new = summary.new_assets,
            findings = summary.reported_findings,
            stale = summary.stale_assets,
            resolved = summary.resolved_findings,
            "run reconciled"
        );
        Ok(summary)
    }

    /// Marks assets stale (discovery) or resolves findings (scan) that the
    /// policy's recent successful runs stopped reporting.
    async fn age_out(
        &self,
        policy: &Policy,
        at: DateTime<Utc>,
        summary: &mut RunSummary,
        touched: &mut BTreeSet<AssetId>,
    ) -> Result<()> {
        match &policy.spec {
            PolicySpec::Discovery(spec) => {
                let Some(window) = spec.stale_after_runs.filter(|n| *n > 0) else {
                    return Ok(());
                };
                let Some(keep) = self.recent_window(policy, window).await? else {
                    return Ok(());
                };
                let stale =
                    self.store.mark_stale_assets(policy.id, &keep, at).await?;
                summary.stale_assets = stale.len() as u32;
            }
            PolicySpec::Scan(spec) => {
                let window = spec.resolve_after_runs.max(1);
                let Some(keep) = self.recent_window(policy, window).await? else {
                    return Ok(());
                };
                let resolved = self
                    .store
                    .resolve_absent_findings(policy.id, &keep, at)
                    .await?;
                summary.resolved_findings = resolved.len() as u32;
                touched.extend(resolved.into_iter().filter_map(|(_, asset)| asset));
            }
        }
        Ok(())
    }

    /// The policy's `window` most recent successful runs, or `None` while it
    /// has fewer than that.
    async fn recent_window(
        &self,
        policy: &Policy,
        window: u32,
    ) -> Result<Option<Vec<vigil_model::RunId>>> {
        let keep = self
            .store
            .recent_succeeded_runs(policy.id, window as usize)
            .await?;
        Ok((keep.len() >= window as usize).then_some(keep))
    }

    async fn locate_asset(
        &self,
        owner: OwnerId,
        descriptor: &FindingDescriptor,
    ) -> Result<Option<AssetId>> {
        let found = match &descriptor.asset {
            None => None,
            Some(AssetLocator::Id { asset_id }) => self
                .store
                .get_asset(*asset_id)
                .await?
                .filter(|asset| asset.owner == owner)
                .map(|asset| asset.id),
            Some(AssetLocator::NaturalKey {
                asset_type,
                identifier,
            }) => match asset_type.normalize_identifier(identifier) {
                Some(identifier) => self
                    .store
                    .find_asset(owner, *asset_type, &identifier)
                    .await?
                    .map(|asset| asset.id),
                None => None,
            },
        };
        if descriptor.asset.is_some() && found.is_none() {
            debug!(key = %descriptor.key, "finding asset not in inventory; recording as asset-agnostic");
        }
        Ok(found)
    }

    async fn rescore(&self, asset_id: AssetId) -> Result<()> {
        let severities = self.store.open_finding_severities(asset_id).await?;
        let score = self.scorer.score(&severities);
        self.store.set_risk_score(asset_id, score).await
    }

    /// Reconciles succeeded runs whose reconciliation never landed.
    pub async fn retry_pending(&self, limit: usize) -> Result<ReconcileReport> {
        let pending = self.store.unreconciled_runs(limit).await?;
        let mut report = ReconcileReport::default();
        for run in pending {
            match self.reconcile(&run).await {
                Ok(_) => report.reconciled += 1,
                Err(err) => {
                    warn!(run_id = %run.id, error = %err, "reconciliation retry failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}
