//! Record-level merge rules shared by every store adapter, so replays and
//! out-of-order observations land the same way regardless of backend.

use chrono::{DateTime, Utc};
use vigil_model::{Asset, AssetId, AssetStatus, Finding, FindingId, RunId};

use super::ports::{AssetObservation, FindingObservation, FindingUpsert};

/// True when `observed_at` supersedes the stored sighting. A replay of the
/// run that produced the stored sighting is not newer.
pub(crate) fn supersedes(
    observed_at: DateTime<Utc>,
    run_id: RunId,
    last_seen: DateTime<Utc>,
    last_seen_run: Option<RunId>,
) -> bool {
    observed_at > last_seen
        || (observed_at == last_seen && last_seen_run != Some(run_id))
}

fn clean_tags<'a>(tags: impl Iterator<Item = &'a String>) -> impl Iterator<Item = String> {
    tags.map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

pub(crate) fn merge_asset(asset: &mut Asset, observation: &AssetObservation) {
    let descriptor = &observation.descriptor;
    asset.tags.extend(clean_tags(descriptor.tags.iter()));
    if supersedes(
        observation.observed_at,
        observation.run_id,
        asset.last_seen,
        asset.last_seen_run,
    ) {
        asset.last_seen = observation.observed_at;
        asset.last_seen_run = Some(observation.run_id);
        asset.status = AssetStatus::Active;
        if let Some(exposure) = descriptor.exposure {
            asset.exposure = exposure;
        }
    }
    asset.first_seen = asset.first_seen.min(observation.observed_at);
    asset.updated_at = asset.updated_at.max(observation.observed_at);
}

pub(crate) fn asset_from_observation(observation: &AssetObservation) -> Asset {
    let descriptor = &observation.descriptor;
    let at = observation.observed_at;
    Asset {
        id: AssetId::new(),
        owner: observation.owner,
        name: descriptor
            .name
            .clone()
            .unwrap_or_else(|| descriptor.identifier.clone()),
        asset_type: descriptor.asset_type,
        identifier: descriptor.identifier.clone(),
        exposure: descriptor.exposure.unwrap_or_default(),
        risk_score: 0,
        tags: clean_tags(descriptor.tags.iter()).collect(),
        status: AssetStatus::Active,
        description: None,
        discovered_by: Some(observation.policy_id),
        last_seen_run: Some(observation.run_id),
        first_seen: at,
        last_seen: at,
        created_at: at,
        updated_at: at,
    }
}

/// Applies a sighting to an existing finding. Older sightings, replays and
/// sightings from before the finding was resolved leave it untouched.
pub(crate) fn merge_finding(
    finding: &mut Finding,
    observation: &FindingObservation,
) -> FindingUpsert {
    let previous_asset_id = finding.asset_id;
    let newer = supersedes(
        observation.observed_at,
        observation.run_id,
        finding.last_seen,
        Some(finding.last_seen_run),
    );
    let after_resolution = finding
        .resolved_at
        .is_none_or(|resolved| observation.observed_at > resolved);

    if newer && after_resolution {
        finding.severity = observation.severity;
        finding.title = observation.title.clone();
        if observation.remediation.is_some() {
            finding.remediation = observation.remediation.clone();
        }
        if observation.asset_id.is_some() {
            finding.asset_id = observation.asset_id;
        }
        finding.policy_id = observation.policy_id;
        finding.last_seen = observation.observed_at;
        finding.last_seen_run = observation.run_id;
        finding.resolved_at = None;
    }

    FindingUpsert {
        finding_id: finding.id,
        created: false,
        asset_id: finding.asset_id,
        previous_asset_id: previous_asset_id
            .filter(|prev| Some(*prev) != finding.asset_id),
    }
}

pub(crate) fn finding_from_observation(observation: &FindingObservation) -> Finding {
    Finding {
        id: FindingId::new(),
        owner: observation.owner,
        run_id: observation.run_id,
        policy_id: observation.policy_id,
        asset_id: observation.asset_id,
        severity: observation.severity,
        dedupe_key: observation.dedupe_key.clone(),
        title: observation.title.clone(),
        remediation: observation.remediation.clone(),
        discovered_at: observation.observed_at,
        last_seen: observation.observed_at,
        last_seen_run: observation.run_id,
        resolved_at: None,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use vigil_model::{
        AssetDescriptor, AssetType, Exposure, OwnerId, PolicyId, Severity,
    };

    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn observation(run_id: RunId, at: DateTime<Utc>) -> AssetObservation {
        AssetObservation {
            owner: OwnerId::new(),
            policy_id: PolicyId::new(),
            run_id,
            observed_at: at,
            descriptor: AssetDescriptor {
                asset_type: AssetType::Domain,
                identifier: "example.com".into(),
                name: None,
                exposure: Some(Exposure::Public),
                tags: vec![" web ".into(), "".into()],
            },
        }
    }

    #[test]
    fn replay_of_same_run_does_not_supersede() {
        let run = RunId::new();
        assert!(!supersedes(t(0), run, t(0), Some(run)));
        assert!(supersedes(t(0), RunId::new(), t(0), Some(run)));
        assert!(!supersedes(t(-1), RunId::new(), t(0), Some(run)));
    }

    #[test]
    fn older_observation_only_widens_first_seen_and_tags() {
        let first = observation(RunId::new(), t(100));
        let mut asset = asset_from_observation(&first);
        assert_eq!(asset.tags.iter().collect::<Vec<_>>(), vec!["web"]);
        asset.status = AssetStatus::Stale;

        let mut late = observation(RunId::new(), t(100) - Duration::seconds(50));
        late.descriptor.exposure = Some(Exposure::Internal);
        late.descriptor.tags = vec!["legacy".into()];
        merge_asset(&mut asset, &late);

        assert_eq!(asset.first_seen, t(50));
        assert_eq!(asset.last_seen, t(100));
        assert_eq!(asset.status, AssetStatus::Stale);
        assert_eq!(asset.exposure, Exposure::Public);
        assert!(asset.tags.contains("legacy"));
    }

    #[test]
    fn resolved_finding_ignores_sightings_from_before_resolution() {
        let run = RunId::new();
        let obs = FindingObservation {
            owner: OwnerId::new(),
            policy_id: PolicyId::new(),
            run_id: run,
            observed_at: t(0),
            dedupe_key: "tls-weak".into(),
            asset_id: None,
            severity: Severity::High,
            title: "Weak TLS".into(),
            remediation: None,
        };
        let mut finding = finding_from_observation(&obs);
        finding.resolved_at = Some(t(10));

        let stale = FindingObservation {
            run_id: RunId::new(),
            observed_at: t(5),
            ..obs.clone()
        };
        merge_finding(&mut finding, &stale);
        assert_eq!(finding.resolved_at, Some(t(10)));

        let fresh = FindingObservation {
            run_id: RunId::new(),
            observed_at: t(20),
            severity: Severity::Critical,
            ..obs
        };
        merge_finding(&mut finding, &fresh);
        assert!(finding.is_open());
        assert_eq!(finding.severity, Severity::Critical);
    }
}
