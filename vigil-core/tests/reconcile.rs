use chrono::Duration;
use vigil_core::database::ports::{
    AssetFilter, FindingFilter, InventoryRepository, RunRepository,
    RunTransition,
};
use vigil_model::{
    AssetLocator, AssetStatus, AssetType, DiscoverySpec, FindingDescriptor,
    PageRequest, PolicySpec, RunPayload, RunStatus, ScheduleDescriptor,
    Severity, TargetSelection,
};

#[path = "support/mod.rs"]
mod support;

use support::{Harness, discovery_policy, domain, finding_on, scan_policy};

#[tokio::test]
async fn scan_finding_raises_risk_and_resolves_when_absent() {
    let h = Harness::new();
    let asset = h.create_asset(AssetType::Domain, "asset-1").await;
    assert_eq!(asset.risk_score, 0);

    let policy = h
        .create_policy(scan_policy(
            TargetSelection::FromAssets(vec![asset.id]),
            ScheduleDescriptor::interval("1h"),
        ))
        .await;
    let t = policy.created_at;

    let first = h.dispatch_one(t).await;
    let payload = RunPayload {
        discovered_assets: vec![],
        findings: vec![finding_on(&asset, "CVE-2024-0001:asset-1", Severity::Critical)],
    };
    h.succeed(first, payload, t + Duration::minutes(1)).await;

    let scored = h.store.get_asset(asset.id).await.unwrap().unwrap();
    assert!(scored.risk_score > asset.risk_score);
    let findings = h
        .store
        .list_findings(
            &FindingFilter {
                owner: Some(h.owner),
                ..FindingFilter::default()
            },
            PageRequest::default(),
        )
        .await
        .unwrap();
    assert_eq!(findings.total, 1);
    let finding = &findings.items[0];
    assert!(finding.is_open());
    assert_eq!(finding.title, "CVE-2024-0001:asset-1");

    let second = h.dispatch_one(t + Duration::hours(1)).await;
    let finished = t + Duration::hours(1) + Duration::minutes(1);
    h.succeed(second, RunPayload::default(), finished).await;

    let resolved = h
        .store
        .list_findings(
            &FindingFilter {
                owner: Some(h.owner),
                ..FindingFilter::default()
            },
            PageRequest::default(),
        )
        .await
        .unwrap();
    assert_eq!(resolved.items[0].resolved_at, Some(finished));

    let rescored = h.store.get_asset(asset.id).await.unwrap().unwrap();
    assert!(rescored.risk_score < scored.risk_score);
    assert_eq!(rescored.risk_score, 0);

    let run = h.store.get_run(second).await.unwrap().unwrap();
    assert_eq!(run.summary.resolved_findings, 1);
}

#[tokio::test]
async fn reconciling_the_same_run_twice_changes_nothing() {
    let h = Harness::new();
    let asset = h.create_asset(AssetType::Domain, "shop.example.com").await;
    let policy = h
        .create_policy(scan_policy(
            TargetSelection::Manual(vec!["shop.example.com".into()]),
            ScheduleDescriptor::quick(),
        ))
        .await;
    let t = policy.created_at;
    let run_id = h.dispatch_one(t).await;

    let payload = RunPayload {
        discovered_assets: vec![domain("SHOP.example.com."), domain("cdn.example.com")],
        findings: vec![
            FindingDescriptor {
                key: "tls-weak-cipher".into(),
                asset: Some(AssetLocator::NaturalKey {
                    asset_type: AssetType::Domain,
                    identifier: "shop.example.com".into(),
                }),
                severity: Severity::Medium,
                title: Some("Weak TLS cipher suites".into()),
                remediation: None,
            },
            finding_on(&asset, "open-admin-panel", Severity::High),
        ],
    };
    h.succeed(run_id, payload, t + Duration::minutes(3)).await;

    let snapshot = |h: &Harness| {
        let store = h.store.clone();
        let owner = h.owner;
        async move {
            let assets = store
                .list_assets(
                    &AssetFilter {
                        owner: Some(owner),
                        ..AssetFilter::default()
                    },
                    PageRequest::default(),
                )
                .await
                .unwrap()
                .items;
            let findings = store
                .list_findings(
                    &FindingFilter {
                        owner: Some(owner),
                        ..FindingFilter::default()
                    },
                    PageRequest::default(),
                )
                .await
                .unwrap()
                .items;
            (assets, findings)
        }
    };

    let before = snapshot(&h).await;
    assert_eq!(before.0.len(), 2, "shop matched the registered asset");
    assert_eq!(before.1.len(), 2);

    let run = h.store.get_run(run_id).await.unwrap().unwrap();
    let replayed = h.runtime.reconciler().reconcile(&run).await.unwrap();
    assert_eq!(replayed, run.summary);

    let after = snapshot(&h).await;
    assert_eq!(before, after);
}

#[tokio::test]
async fn discovery_upserts_by_natural_key_and_marks_missing_assets_stale() {
    let h = Harness::new();
    let mut request = discovery_policy(ScheduleDescriptor::interval("1h"));
    request.spec = PolicySpec::Discovery(DiscoverySpec {
        asset_type: AssetType::Domain,
        stale_after_runs: Some(1),
    });
    let policy = h.create_policy(request).await;
    let t = policy.created_at;

    let first = h.dispatch_one(t).await;
    h.succeed(
        first,
        RunPayload {
            discovered_assets: vec![domain("a.example.com"), domain("b.example.com")],
            findings: vec![],
        },
        t + Duration::minutes(1),
    )
    .await;
    let run = h.store.get_run(first).await.unwrap().unwrap();
    assert_eq!(run.summary.discovered_assets, 2);
    assert_eq!(run.summary.new_assets, 2);

    let second = h.dispatch_one(t + Duration::hours(1)).await;
    h.succeed(
        second,
        RunPayload {
            discovered_assets: vec![domain("A.example.com")],
            findings: vec![],
        },
        t + Duration::hours(1) + Duration::minutes(1),
    )
    .await;
    let run = h.store.get_run(second).await.unwrap().unwrap();
    assert_eq!(run.summary.new_assets, 0);
    assert_eq!(run.summary.stale_assets, 1);

    let a = h
        .store
        .find_asset(h.owner, AssetType::Domain, "a.example.com")
        .await
        .unwrap()
        .unwrap();
    let b = h
        .store
        .find_asset(h.owner, AssetType::Domain, "b.example.com")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(a.status, AssetStatus::Active);
    assert_eq!(a.last_seen_run, Some(second));
    assert_eq!(a.discovered_by, Some(policy.id));
    assert_eq!(b.status, AssetStatus::Stale);
}

#[tokio::test]
async fn asset_sighted_later_by_another_policy_is_not_aged_out() {
    let h = Harness::new();
    let mut request = discovery_policy(ScheduleDescriptor::interval("1h"));
    request.spec = PolicySpec::Discovery(DiscoverySpec {
        asset_type: AssetType::Domain,
        stale_after_runs: Some(1),
    });
    let owning = h.create_policy(request).await;
    let t = owning.created_at;

    let first = h.dispatch_one(t).await;
    h.succeed(
        first,
        RunPayload {
            discovered_assets: vec![domain("x.example.com")],
            findings: vec![],
        },
        t + Duration::minutes(1),
    )
    .await;

    let other = h
        .create_policy(discovery_policy(ScheduleDescriptor::interval("1h")))
        .await;
    let t2 = t + Duration::hours(1);
    let report = h.runtime.dispatcher().dispatch_due(t2).await.unwrap();
    assert_eq!(report.dispatched.len(), 2);
    let mut owning_run = None;
    let mut other_run = None;
    for run_id in report.dispatched {
        let run = h.store.get_run(run_id).await.unwrap().unwrap();
        if run.policy_id == owning.id {
            owning_run = Some(run_id);
        } else if run.policy_id == other.id {
            other_run = Some(run_id);
        }
    }
    let (owning_run, other_run) = (owning_run.unwrap(), other_run.unwrap());

    let sighting = RunPayload {
        discovered_assets: vec![domain("x.example.com")],
        findings: vec![],
    };
    // The other policy finishes later but reconciles first.
    h.succeed(other_run, sighting.clone(), t2 + Duration::minutes(10))
        .await;
    h.succeed(owning_run, sighting, t2 + Duration::minutes(5)).await;

    let x = h
        .store
        .find_asset(h.owner, AssetType::Domain, "x.example.com")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(x.status, AssetStatus::Active);
    assert_eq!(x.discovered_by, Some(owning.id));
    assert_eq!(x.last_seen_run, Some(other_run));

    let run = h.store.get_run(owning_run).await.unwrap().unwrap();
    assert_eq!(run.summary.stale_assets, 0);
}

#[tokio::test]
async fn replaying_an_older_run_never_regresses_inventory() {
    let h = Harness::new();
    let policy = h
        .create_policy(discovery_policy(ScheduleDescriptor::interval("1h")))
        .await;
    let t = policy.created_at;

    let older = h.dispatch_one(t).await;
    h.succeed(
        older,
        RunPayload {
            discovered_assets: vec![domain("api.example.com")],
            findings: vec![],
        },
        t + Duration::minutes(1),
    )
    .await;

    let newer = h.dispatch_one(t + Duration::hours(1)).await;
    let newer_finish = t + Duration::hours(1) + Duration::minutes(1);
    h.succeed(
        newer,
        RunPayload {
            discovered_assets: vec![domain("api.example.com")],
            findings: vec![],
        },
        newer_finish,
    )
    .await;

    let older_run = h.store.get_run(older).await.unwrap().unwrap();
    h.runtime.reconciler().reconcile(&older_run).await.unwrap();

    let asset = h
        .store
        .find_asset(h.owner, AssetType::Domain, "api.example.com")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(asset.last_seen, newer_finish);
    assert_eq!(asset.last_seen_run, Some(newer));
    assert_eq!(asset.first_seen, t + Duration::minutes(1));
}

#[tokio::test]
async fn orchestration_tick_retries_unreconciled_runs() {
    let h = Harness::new();
    let policy = h.create_policy(discovery_policy(ScheduleDescriptor::quick())).await;
    let t = policy.created_at;
    let run_id = h.dispatch_one(t).await;

    // Succeed the run behind the tracker's back, as if the process died
    // between the transition and reconciliation.
    h.store
        .transition_run(RunTransition::new(run_id, RunStatus::Queued, RunStatus::Running, t))
        .await
        .unwrap()
        .unwrap();
    h.store
        .transition_run(
            RunTransition::new(
                run_id,
                RunStatus::Running,
                RunStatus::Succeeded,
                t + Duration::minutes(1),
            )
            .with_payload(RunPayload {
                discovered_assets: vec![domain("late.example.com")],
                findings: vec![],
            }),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(h.store.unreconciled_runs(10).await.unwrap().len(), 1);

    let report = h.runtime.tick(t + Duration::minutes(2)).await;
    assert_eq!(report.reconciled, 1);
    assert!(report.errors.is_empty(), "{:?}", report.errors);

    let run = h.store.get_run(run_id).await.unwrap().unwrap();
    assert!(run.reconciled_at.is_some());
    assert_eq!(run.summary.new_assets, 1);
    assert!(h.store.unreconciled_runs(10).await.unwrap().is_empty());
}
