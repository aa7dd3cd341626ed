//! Shared harness for engine integration tests: in-memory adapters wired
//! into a runtime, plus policy and payload builders.
#![allow(dead_code)]

use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use vigil_core::{
    VigilError,
    database::{
        InMemoryStore, Store,
        ports::{
            AssetFilter, AssetObservation, AssetUpsert, ClaimOutcome,
            ClaimRequest, FindingFilter, FindingObservation, FindingUpsert,
            InventoryRepository, PolicyFilter, PolicyRepository, RiskTotals,
            RunFilter, RunRepository, RunTransition, TimeoutCutoffs,
        },
    },
    orchestration::{
        InMemoryWorkQueue, LeaseRequest, LeasedJob, OrchestratorConfig,
        OrchestratorRuntime, RetryConfig, WorkQueue,
    },
    risk::SeverityWeightedScorer,
    services::{CreateAsset, CreatePolicy, InventoryService, PolicyService},
};
use vigil_model::{
    Asset, AssetDescriptor, AssetId, AssetLocator, AssetType, DiscoverySpec,
    Finding, FindingDescriptor, FindingId, Intensity, JobMessage, OwnerId,
    Page, PageRequest, Policy, PolicyId, PolicySpec, PolicyStatus, Run,
    RunError, RunId, RunPayload, RunStatus, RunSummary, ScanSpec,
    ScheduleDescriptor, Severity, TargetSelection,
};

/// Retries fast enough that failure paths do not slow the suite down.
pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        retry: RetryConfig {
            max_attempts: 3,
            backoff_base_ms: 1,
            backoff_max_ms: 2,
            jitter_ratio: 0.0,
        },
        ..OrchestratorConfig::default()
    }
}

pub struct Harness {
    pub owner: OwnerId,
    pub store: Arc<InMemoryStore>,
    pub queue: Arc<dyn WorkQueue>,
    pub runtime: OrchestratorRuntime,
    pub policies: PolicyService,
    pub inventory: InventoryService,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_queue(Arc::new(InMemoryWorkQueue::new()))
    }

    pub fn with_queue(queue: Arc<dyn WorkQueue>) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let shared: Arc<dyn Store> = store.clone();
        let runtime = OrchestratorRuntime::new(
            test_config(),
            shared.clone(),
            queue.clone(),
            Arc::new(SeverityWeightedScorer),
        );
        Self {
            owner: OwnerId::new(),
            store,
            queue,
            runtime,
            policies: PolicyService::new(shared.clone()),
            inventory: InventoryService::new(shared),
        }
    }

    pub async fn create_policy(&self, request: CreatePolicy) -> Policy {
        self.policies
            .create_policy(self.owner, request)
            .await
            .expect("create policy")
    }

    pub async fn create_asset(&self, asset_type: AssetType, name: &str) -> Asset {
        self.inventory
            .create_asset(
                self.owner,
                CreateAsset {
                    name: name.to_string(),
                    asset_type,
                    identifier: None,
                    exposure: None,
                    tags: vec![],
                    description: None,
                },
            )
            .await
            .expect("create asset")
    }

    /// Dispatches at `at` and returns the single run created.
    pub async fn dispatch_one(&self, at: DateTime<Utc>) -> RunId {
        let report = self
            .runtime
            .dispatcher()
            .dispatch_due(at)
            .await
            .expect("dispatch");
        assert_eq!(report.dispatched.len(), 1, "expected one dispatch: {report:?}");
        report.dispatched[0]
    }

    pub async fn lease(&self, now: DateTime<Utc>) -> Option<LeasedJob> {
        self.queue
            .lease(LeaseRequest {
                worker_id: "worker-1".into(),
                ttl: Duration::minutes(5),
                now,
            })
            .await
            .expect("lease")
    }

    /// Drives a run through RUNNING to SUCCEEDED, finishing at `at`.
    pub async fn succeed(&self, run_id: RunId, payload: RunPayload, at: DateTime<Utc>) {
        let tracker = self.runtime.tracker();
        tracker
            .mark_running_at(run_id, at - Duration::seconds(1))
            .await
            .expect("mark running");
        tracker
            .mark_succeeded_at(run_id, payload, at)
            .await
            .expect("mark succeeded");
    }
}

pub fn discovery_policy(schedule: ScheduleDescriptor) -> CreatePolicy {
    CreatePolicy {
        name: "external domains".into(),
        spec: PolicySpec::Discovery(DiscoverySpec {
            asset_type: AssetType::Domain,
            stale_after_runs: None,
        }),
        targets: TargetSelection::Manual(vec!["example.com".into()]),
        intensity: Intensity::Normal,
        schedule,
        activate: true,
    }
}

pub fn scan_policy(targets: TargetSelection, schedule: ScheduleDescriptor) -> CreatePolicy {
    CreatePolicy {
        name: "perimeter scan".into(),
        spec: PolicySpec::Scan(ScanSpec::default()),
        targets,
        intensity: Intensity::Deep,
        schedule,
        activate: true,
    }
}

pub fn domain(identifier: &str) -> AssetDescriptor {
    AssetDescriptor {
        asset_type: AssetType::Domain,
        identifier: identifier.to_string(),
        name: None,
        exposure: None,
        tags: vec![],
    }
}

pub fn finding_on(asset: &Asset, key: &str, severity: Severity) -> FindingDescriptor {
    FindingDescriptor {
        key: key.to_string(),
        asset: Some(AssetLocator::Id { asset_id: asset.id }),
        severity,
        title: None,
        remediation: None,
    }
}

/// Queue whose enqueue can be switched to fail, for dispatch failure paths.
#[derive(Debug, Default)]
pub struct FlakyQueue {
    inner: InMemoryWorkQueue,
    failing: AtomicBool,
    enqueue_calls: AtomicU32,
}

impl FlakyQueue {
    pub fn failing() -> Self {
        let queue = Self::default();
        queue.set_failing(true);
        queue
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn enqueue_calls(&self) -> u32 {
        self.enqueue_calls.load(Ordering::SeqCst)
    }

    pub async fn contains(&self, run_id: RunId) -> bool {
        self.inner.contains(run_id).await
    }
}

#[async_trait]
impl WorkQueue for FlakyQueue {
    async fn enqueue(&self, job: &JobMessage) -> vigil_core::Result<()> {
        self.enqueue_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(VigilError::Queue("broker unavailable".into()));
        }
        self.inner.enqueue(job).await
    }

    async fn lease(&self, request: LeaseRequest) -> vigil_core::Result<Option<LeasedJob>> {
        self.inner.lease(request).await
    }

    async fn ack(&self, run_id: RunId) -> vigil_core::Result<bool> {
        self.inner.ack(run_id).await
    }

    async fn release_expired_leases(&self, now: DateTime<Utc>) -> vigil_core::Result<u64> {
        self.inner.release_expired_leases(now).await
    }
}

/// In-memory store that can be told to fail specific calls.
#[derive(Debug, Default)]
pub struct FaultyStore {
    pub inner: InMemoryStore,
    failing_transitions: StdMutex<HashSet<RunId>>,
    failing_run_reads: AtomicBool,
}

impl FaultyStore {
    pub fn fail_transitions_of(&self, run_id: RunId) {
        self.failing_transitions
            .lock()
            .expect("fault set")
            .insert(run_id);
    }

    pub fn set_failing_run_reads(&self, failing: bool) {
        self.failing_run_reads.store(failing, Ordering::SeqCst);
    }
}

fn storage_down() -> VigilError {
    VigilError::Storage("connection reset".into())
}

#[async_trait]
impl PolicyRepository for FaultyStore {
    async fn insert_policy(&self, policy: &Policy) -> vigil_core::Result<()> {
        self.inner.insert_policy(policy).await
    }

    async fn get_policy(&self, id: PolicyId) -> vigil_core::Result<Option<Policy>> {
        self.inner.get_policy(id).await
    }

    async fn update_policy(
        &self,
        policy: &Policy,
        expected_updated_at: DateTime<Utc>,
    ) -> vigil_core::Result<bool> {
        self.inner.update_policy(policy, expected_updated_at).await
    }

    async fn delete_policy(&self, id: PolicyId) -> vigil_core::Result<bool> {
        self.inner.delete_policy(id).await
    }

    async fn list_policies(
        &self,
        filter: &PolicyFilter,
        page: PageRequest,
    ) -> vigil_core::Result<Page<Policy>> {
        self.inner.list_policies(filter, page).await
    }

    async fn due_policies(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> vigil_core::Result<Vec<Policy>> {
        self.inner.due_policies(now, limit).await
    }

    async fn policy_status_counts(
        &self,
        owner: OwnerId,
    ) -> vigil_core::Result<Vec<(PolicyStatus, u64)>> {
        self.inner.policy_status_counts(owner).await
    }
}

#[async_trait]
impl RunRepository for FaultyStore {
    async fn claim_dispatch(&self, request: ClaimRequest) -> vigil_core::Result<ClaimOutcome> {
        self.inner.claim_dispatch(request).await
    }

    async fn fail_dispatch(
        &self,
        run_id: RunId,
        error: RunError,
        now: DateTime<Utc>,
    ) -> vigil_core::Result<bool> {
        self.inner.fail_dispatch(run_id, error, now).await
    }

    async fn get_run(&self, id: RunId) -> vigil_core::Result<Option<Run>> {
        if self.failing_run_reads.load(Ordering::SeqCst) {
            return Err(storage_down());
        }
        self.inner.get_run(id).await
    }

    async fn transition_run(
        &self,
        transition: RunTransition,
    ) -> vigil_core::Result<Option<Run>> {
        let failing = self
            .failing_transitions
            .lock()
            .expect("fault set")
            .contains(&transition.run_id);
        if failing {
            return Err(storage_down());
        }
        self.inner.transition_run(transition).await
    }

    async fn expired_runs(
        &self,
        cutoffs: TimeoutCutoffs,
        limit: usize,
    ) -> vigil_core::Result<Vec<Run>> {
        self.inner.expired_runs(cutoffs, limit).await
    }

    async fn list_runs(
        &self,
        filter: &RunFilter,
        page: PageRequest,
    ) -> vigil_core::Result<Page<Run>> {
        self.inner.list_runs(filter, page).await
    }

    async fn recent_succeeded_runs(
        &self,
        policy_id: PolicyId,
        limit: usize,
    ) -> vigil_core::Result<Vec<RunId>> {
        self.inner.recent_succeeded_runs(policy_id, limit).await
    }

    async fn unreconciled_runs(&self, limit: usize) -> vigil_core::Result<Vec<Run>> {
        self.inner.unreconciled_runs(limit).await
    }

    async fn mark_reconciled(
        &self,
        run_id: RunId,
        summary: &RunSummary,
        at: DateTime<Utc>,
    ) -> vigil_core::Result<bool> {
        self.inner.mark_reconciled(run_id, summary, at).await
    }

    async fn run_status_counts(
        &self,
        owner: OwnerId,
    ) -> vigil_core::Result<Vec<(RunStatus, u64)>> {
        self.inner.run_status_counts(owner).await
    }

    async fn last_run_at(&self, owner: OwnerId) -> vigil_core::Result<Option<DateTime<Utc>>> {
        self.inner.last_run_at(owner).await
    }
}

#[async_trait]
impl InventoryRepository for FaultyStore {
    async fn insert_asset(&self, asset: &Asset) -> vigil_core::Result<()> {
        self.inner.insert_asset(asset).await
    }

    async fn get_asset(&self, id: AssetId) -> vigil_core::Result<Option<Asset>> {
        self.inner.get_asset(id).await
    }

    async fn find_asset(
        &self,
        owner: OwnerId,
        asset_type: AssetType,
        identifier: &str,
    ) -> vigil_core::Result<Option<Asset>> {
        self.inner.find_asset(owner, asset_type, identifier).await
    }

    async fn update_asset(&self, asset: &Asset) -> vigil_core::Result<bool> {
        self.inner.update_asset(asset).await
    }

    async fn delete_asset(&self, id: AssetId) -> vigil_core::Result<bool> {
        self.inner.delete_asset(id).await
    }

    async fn list_assets(
        &self,
        filter: &AssetFilter,
        page: PageRequest,
    ) -> vigil_core::Result<Page<Asset>> {
        self.inner.list_assets(filter, page).await
    }

    async fn upsert_observed_asset(
        &self,
        observation: &AssetObservation,
    ) -> vigil_core::Result<AssetUpsert> {
        self.inner.upsert_observed_asset(observation).await
    }

    async fn mark_stale_assets(
        &self,
        policy_id: PolicyId,
        keep_runs: &[RunId],
        at: DateTime<Utc>,
    ) -> vigil_core::Result<Vec<AssetId>> {
        self.inner.mark_stale_assets(policy_id, keep_runs, at).await
    }

    async fn upsert_finding(
        &self,
        observation: &FindingObservation,
    ) -> vigil_core::Result<FindingUpsert> {
        self.inner.upsert_finding(observation).await
    }

    async fn resolve_absent_findings(
        &self,
        policy_id: PolicyId,
        keep_runs: &[RunId],
        at: DateTime<Utc>,
    ) -> vigil_core::Result<Vec<(FindingId, Option<AssetId>)>> {
        self.inner
            .resolve_absent_findings(policy_id, keep_runs, at)
            .await
    }

    async fn open_finding_severities(
        &self,
        asset_id: AssetId,
    ) -> vigil_core::Result<Vec<Severity>> {
        self.inner.open_finding_severities(asset_id).await
    }

    async fn set_risk_score(&self, asset_id: AssetId, score: u8) -> vigil_core::Result<()> {
        self.inner.set_risk_score(asset_id, score).await
    }

    async fn list_findings(
        &self,
        filter: &FindingFilter,
        page: PageRequest,
    ) -> vigil_core::Result<Page<Finding>> {
        self.inner.list_findings(filter, page).await
    }

    async fn open_findings_by_severity(
        &self,
        owner: OwnerId,
    ) -> vigil_core::Result<Vec<(Severity, u64)>> {
        self.inner.open_findings_by_severity(owner).await
    }

    async fn active_risk_totals(&self, owner: OwnerId) -> vigil_core::Result<RiskTotals> {
        self.inner.active_risk_totals(owner).await
    }
}

/// Runtime over a [`FaultyStore`], for failure paths inside the engine.
pub fn faulty_runtime(store: Arc<FaultyStore>) -> OrchestratorRuntime {
    let shared: Arc<dyn Store> = store;
    OrchestratorRuntime::new(
        test_config(),
        shared,
        Arc::new(InMemoryWorkQueue::new()),
        Arc::new(SeverityWeightedScorer),
    )
}
