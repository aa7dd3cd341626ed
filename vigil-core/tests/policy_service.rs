use chrono::Duration;
use vigil_core::{
    VigilError,
    database::ports::{InventoryRepository, RunRepository},
    services::{
        AssetQuery, DashboardService, PolicyQuery, RunQuery, RunService,
        UpdatePolicy,
    },
};
use vigil_model::{
    AssetId, AssetType, DiscoverySpec, OwnerId, PageRequest, PolicySpec,
    PolicyStatus, RunPayload, ScheduleDescriptor, Severity, TargetSelection,
};

#[path = "support/mod.rs"]
mod support;

use support::{Harness, discovery_policy, finding_on, scan_policy};

fn is_configuration_error(err: &VigilError) -> bool {
    matches!(err, VigilError::Configuration(_))
}

#[tokio::test]
async fn invalid_policies_are_rejected_at_create_time() {
    let h = Harness::new();

    let bad_cron = discovery_policy(ScheduleDescriptor::cron("every tuesday"));
    let quick_with_value = {
        let mut req = discovery_policy(ScheduleDescriptor::quick());
        req.schedule.value = Some("1h".into());
        req
    };
    let zero_interval = discovery_policy(ScheduleDescriptor::interval("0s"));
    let long_name = {
        let mut req = discovery_policy(ScheduleDescriptor::quick());
        req.name = "n".repeat(201);
        req
    };
    let undiscoverable = {
        let mut req = discovery_policy(ScheduleDescriptor::quick());
        req.spec = PolicySpec::Discovery(DiscoverySpec {
            asset_type: AssetType::Ip,
            stale_after_runs: None,
        });
        req
    };
    let no_targets = {
        let mut req = discovery_policy(ScheduleDescriptor::quick());
        req.targets = TargetSelection::Manual(vec![]);
        req
    };
    let unknown_asset = scan_policy(
        TargetSelection::FromAssets(vec![AssetId::new()]),
        ScheduleDescriptor::quick(),
    );

    for request in [
        bad_cron,
        quick_with_value,
        zero_interval,
        long_name,
        undiscoverable,
        no_targets,
        unknown_asset,
    ] {
        let name = request.name.clone();
        let err = h.policies.create_policy(h.owner, request).await.unwrap_err();
        assert!(is_configuration_error(&err), "{name}: {err}");
    }

    let listed = h
        .policies
        .list_policies(h.owner, PolicyQuery::default(), PageRequest::default())
        .await
        .unwrap();
    assert_eq!(listed.total, 0);
}

#[tokio::test]
async fn targets_must_belong_to_the_owner() {
    let h = Harness::new();
    let foreign = h
        .inventory
        .create_asset(
            OwnerId::new(),
            vigil_core::services::CreateAsset {
                name: "theirs.example.com".into(),
                asset_type: AssetType::Domain,
                identifier: None,
                exposure: None,
                tags: vec![],
                description: None,
            },
        )
        .await
        .unwrap();

    let err = h
        .policies
        .create_policy(
            h.owner,
            scan_policy(
                TargetSelection::FromAssets(vec![foreign.id]),
                ScheduleDescriptor::quick(),
            ),
        )
        .await
        .unwrap_err();
    assert!(is_configuration_error(&err), "{err}");
}

#[tokio::test]
async fn drafts_wait_for_activation() {
    let h = Harness::new();
    let mut request = discovery_policy(ScheduleDescriptor::interval("30m"));
    request.activate = false;
    let draft = h.create_policy(request).await;
    assert_eq!(draft.status, PolicyStatus::Pending);

    let dispatcher = h.runtime.dispatcher();
    let t = draft.created_at;
    assert!(dispatcher.dispatch_due(t).await.unwrap().dispatched.is_empty());

    let active = h
        .policies
        .update_policy(
            h.owner,
            draft.id,
            UpdatePolicy {
                status: Some(PolicyStatus::Active),
                ..UpdatePolicy::default()
            },
        )
        .await
        .unwrap();
    assert!(active.updated_at > draft.updated_at);
    h.dispatch_one(active.updated_at).await;
}

#[tokio::test]
async fn schedule_changes_recompute_next_run() {
    let h = Harness::new();
    let policy = h
        .create_policy(discovery_policy(ScheduleDescriptor::interval("1h")))
        .await;
    let t = policy.created_at;
    let run_id = h.dispatch_one(t).await;
    h.succeed(run_id, RunPayload::default(), t + Duration::minutes(1))
        .await;

    let updated = h
        .policies
        .update_policy(
            h.owner,
            policy.id,
            UpdatePolicy {
                schedule: Some(ScheduleDescriptor::interval("6h")),
                name: Some("  six-hourly sweep ".into()),
                ..UpdatePolicy::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.name, "six-hourly sweep");
    assert_eq!(updated.next_run_at, Some(t + Duration::hours(6)));

    let err = h
        .policies
        .update_policy(
            h.owner,
            policy.id,
            UpdatePolicy {
                schedule: Some(ScheduleDescriptor::cron("61 * * * *")),
                ..UpdatePolicy::default()
            },
        )
        .await
        .unwrap_err();
    assert!(is_configuration_error(&err), "{err}");
}

#[tokio::test]
async fn archived_policies_stay_archived() {
    let h = Harness::new();
    let policy = h.create_policy(discovery_policy(ScheduleDescriptor::quick())).await;
    let archive = UpdatePolicy {
        status: Some(PolicyStatus::Archived),
        ..UpdatePolicy::default()
    };
    h.policies
        .update_policy(h.owner, policy.id, archive)
        .await
        .unwrap();

    let err = h
        .policies
        .update_policy(
            h.owner,
            policy.id,
            UpdatePolicy {
                status: Some(PolicyStatus::Active),
                ..UpdatePolicy::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, VigilError::InvalidTransition(_)), "{err}");

    let err = h
        .policies
        .trigger_policy(h.owner, policy.id)
        .await
        .unwrap_err();
    assert!(matches!(err, VigilError::InvalidTransition(_)), "{err}");
}

#[tokio::test]
async fn other_owners_cannot_see_or_touch_a_policy() {
    let h = Harness::new();
    let policy = h.create_policy(discovery_policy(ScheduleDescriptor::quick())).await;
    let stranger = OwnerId::new();

    let err = h.policies.get_policy(stranger, policy.id).await.unwrap_err();
    assert!(matches!(err, VigilError::NotFound(_)));
    let err = h
        .policies
        .delete_policy(stranger, policy.id)
        .await
        .unwrap_err();
    assert!(matches!(err, VigilError::NotFound(_)));
    assert!(h.policies.get_policy(h.owner, policy.id).await.is_ok());
}

#[tokio::test]
async fn deleting_a_policy_drops_its_runs_but_keeps_inventory() {
    let h = Harness::new();
    let policy = h.create_policy(discovery_policy(ScheduleDescriptor::quick())).await;
    let t = policy.created_at;
    let run_id = h.dispatch_one(t).await;
    h.succeed(
        run_id,
        RunPayload {
            discovered_assets: vec![support::domain("kept.example.com")],
            findings: vec![],
        },
        t + Duration::minutes(1),
    )
    .await;

    h.policies.delete_policy(h.owner, policy.id).await.unwrap();

    assert!(h.store.get_run(run_id).await.unwrap().is_none());
    let assets = h
        .inventory
        .list_assets(h.owner, AssetQuery::default(), PageRequest::default())
        .await
        .unwrap();
    assert_eq!(assets.total, 1);
    assert_eq!(assets.items[0].identifier, "kept.example.com");
}

#[tokio::test]
async fn run_history_and_dashboard_reflect_activity() {
    let h = Harness::new();
    let asset = h.create_asset(AssetType::Domain, "www.example.com").await;
    h.create_asset(AssetType::Domain, "quiet.example.com").await;
    let scan = h
        .create_policy(scan_policy(
            TargetSelection::FromAssets(vec![asset.id]),
            ScheduleDescriptor::quick(),
        ))
        .await;
    let mut paused = discovery_policy(ScheduleDescriptor::interval("1d"));
    paused.activate = false;
    h.create_policy(paused).await;

    let t = scan.created_at;
    let run_id = h.dispatch_one(t).await;
    h.succeed(
        run_id,
        RunPayload {
            discovered_assets: vec![],
            findings: vec![
                finding_on(&asset, "xss-login", Severity::High),
                finding_on(&asset, "missing-hsts", Severity::Low),
            ],
        },
        t + Duration::minutes(2),
    )
    .await;

    let runs = RunService::new(h.runtime.store());
    let history = runs
        .list_runs(
            h.owner,
            RunQuery {
                policy_id: Some(scan.id),
                status: None,
            },
            PageRequest::default(),
        )
        .await
        .unwrap();
    assert_eq!(history.total, 1);
    assert_eq!(runs.get_run(h.owner, run_id).await.unwrap().id, run_id);
    assert!(runs.get_run(OwnerId::new(), run_id).await.is_err());

    let dashboard = DashboardService::new(h.runtime.store())
        .dashboard(h.owner)
        .await
        .unwrap();
    assert_eq!(dashboard.total_policies, 2);
    assert_eq!(dashboard.active_policies, 1);
    assert_eq!(dashboard.policies_by_status.get("PENDING"), Some(&1));
    assert_eq!(dashboard.last_run_at, Some(t));
    assert_eq!(dashboard.runs_by_status.get("SUCCEEDED"), Some(&1));
    assert_eq!(dashboard.open_findings_by_severity.get("high"), Some(&1));
    assert_eq!(dashboard.open_findings_by_severity.get("low"), Some(&1));

    let scored = h.store.get_asset(asset.id).await.unwrap().unwrap();
    assert_eq!(scored.risk_score, 35);
    // Mean over two active assets: (35 + 0) / 2 rounds to 18.
    assert_eq!(dashboard.attack_surface_score, 18);
}
