use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vigil_model::{OwnerId, PolicyStatus};

use crate::{
    database::{
        Store,
        ports::{InventoryRepository, PolicyRepository, RiskTotals, RunRepository},
    },
    error::Result,
};

/// Posture overview for one owner. Count maps are keyed by the wire name of
/// the status or severity and only list non-zero buckets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dashboard {
    pub total_policies: u64,
    pub active_policies: u64,
    pub policies_by_status: BTreeMap<String, u64>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub runs_by_status: BTreeMap<String, u64>,
    pub open_findings_by_severity: BTreeMap<String, u64>,
    /// Mean risk score over active assets, 0 when there are none.
    pub attack_surface_score: u8,
}

#[derive(Clone)]
pub struct DashboardService {
    store: Arc<dyn Store>,
}

impl std::fmt::Debug for DashboardService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DashboardService").finish_non_exhaustive()
    }
}

impl DashboardService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn dashboard(&self, owner: OwnerId) -> Result<Dashboard> {
        let policy_counts = self.store.policy_status_counts(owner).await?;
        let run_counts = self.store.run_status_counts(owner).await?;
        let severities = self.store.open_findings_by_severity(owner).await?;
        let totals = self.store.active_risk_totals(owner).await?;
        let last_run_at = self.store.last_run_at(owner).await?;

        let active_policies = policy_counts
            .iter()
            .filter(|(status, _)| *status == PolicyStatus::Active)
            .map(|(_, n)| *n)
            .sum();

        Ok(Dashboard {
            total_policies: policy_counts.iter().map(|(_, n)| *n).sum(),
            active_policies,
            policies_by_status: counts_by_name(policy_counts),
            last_run_at,
            runs_by_status: counts_by_name(run_counts),
            open_findings_by_severity: counts_by_name(severities),
            attack_surface_score: attack_surface_score(totals),
        })
    }
}

fn counts_by_name<K: std::fmt::Display>(
    counts: Vec<(K, u64)>,
) -> BTreeMap<String, u64> {
    let mut out = BTreeMap::new();
    for (key, n) in counts.into_iter().filter(|(_, n)| *n > 0) {
        *out.entry(key.to_string()).or_insert(0) += n;
    }
    out
}

pub fn attack_surface_score(totals: RiskTotals) -> u8 {
    if totals.active_assets == 0 {
        return 0;
    }
    let mean = totals.risk_sum as f64 / totals.active_assets as f64;
    mean.round().clamp(0.0, 100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_is_rounded_mean() {
        assert_eq!(attack_surface_score(RiskTotals::default()), 0);
        assert_eq!(
            attack_surface_score(RiskTotals {
                active_assets: 3,
                risk_sum: 50 + 30 + 0,
            }),
            27
        );
        assert_eq!(
            attack_surface_score(RiskTotals {
                active_assets: 2,
                risk_sum: 5,
            }),
            3
        );
    }
}
