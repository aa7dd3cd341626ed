use async_trait::async_trait;
use chrono::{DateTime, Utc};
use vigil_model::{
    OwnerId, Page, PageRequest, PolicyId, PolicyKind, Run, RunError, RunId,
    RunPayload, RunStatus, RunSummary,
};

use crate::error::Result;

#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub owner: Option<OwnerId>,
    pub policy_id: Option<PolicyId>,
    pub status: Option<RunStatus>,
}

impl RunFilter {
    pub fn matches(&self, run: &Run) -> bool {
        self.owner.is_none_or(|o| run.owner == o)
            && self.policy_id.is_none_or(|p| run.policy_id == p)
            && self.status.is_none_or(|s| run.status == s)
    }
}

/// Everything the store needs to atomically turn a due policy into a
/// queued run.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub policy_id: PolicyId,
    /// `updated_at` of the snapshot the dispatcher evaluated. A mismatch
    /// means the policy changed underneath us and the claim is abandoned.
    pub expected_updated_at: DateTime<Utc>,
    /// New run in QUEUED state.
    pub run: Run,
    /// Schedule formula evaluated with `last_run_at = now` and the trigger
    /// cleared.
    pub next_run_at: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed(Run),
    /// Another run for the policy is QUEUED or RUNNING.
    AlreadyInFlight,
    /// The policy changed (paused, edited, dispatched elsewhere) since it
    /// was read, or no longer exists.
    Stale,
}

/// Conditional status change. Only applied while the run is still in
/// `from`.
#[derive(Debug, Clone)]
pub struct RunTransition {
    pub run_id: RunId,
    pub from: RunStatus,
    pub to: RunStatus,
    pub at: DateTime<Utc>,
    pub summary: Option<RunSummary>,
    pub payload: Option<RunPayload>,
}

impl RunTransition {
    pub fn new(
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            from,
            to,
            at,
            summary: None,
            payload: None,
        }
    }

    pub fn with_summary(mut self, summary: RunSummary) -> Self {
        self.summary = Some(summary);
        self
    }

    pub fn with_payload(mut self, payload: RunPayload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Applies the transition to an in-memory copy of the run.
    pub fn apply(&self, run: &mut Run) {
        run.status = self.to;
        if self.to == RunStatus::Running {
            run.started_at = Some(self.at);
        }
        if self.to.is_terminal() {
            run.finished_at = Some(self.at);
        }
        if let Some(summary) = &self.summary {
            run.summary = summary.clone();
        }
        if let Some(payload) = &self.payload {
            run.payload = Some(payload.clone());
        }
    }
}

/// Age limits past which in-flight runs are considered abandoned.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutCutoffs {
    pub queued_before: DateTime<Utc>,
    pub discovery_started_before: DateTime<Utc>,
    pub scan_started_before: DateTime<Utc>,
}

impl TimeoutCutoffs {
    pub fn is_expired(&self, run: &Run) -> bool {
        match run.status {
            RunStatus::Queued => run.created_at < self.queued_before,
            RunStatus::Running => {
                let started = run.started_at.unwrap_or(run.created_at);
                match run.kind {
                    PolicyKind::Discovery => {
                        started < self.discovery_started_before
                    }
                    PolicyKind::Scan => started < self.scan_started_before,
                }
            }
            _ => false,
        }
    }
}

#[async_trait]
pub trait RunRepository: Send + Sync {
    /// Single-flight claim. Must be atomic against concurrent claimers in
    /// other processes: check, insert and policy stamp happen in one
    /// transaction guarded by the store, never in application code.
    async fn claim_dispatch(&self, request: ClaimRequest)
    -> Result<ClaimOutcome>;

    /// Marks a QUEUED run FAILED after its enqueue gave up and, in the same
    /// transaction, re-triggers the policy so it stays due.
    async fn fail_dispatch(
        &self,
        run_id: RunId,
        error: RunError,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn get_run(&self, id: RunId) -> Result<Option<Run>>;

    /// Returns the updated run, or `None` if it was not in `from`.
    async fn transition_run(
        &self,
        transition: RunTransition,
    ) -> Result<Option<Run>>;

    async fn expired_runs(
        &self,
        cutoffs: TimeoutCutoffs,
        limit: usize,
    ) -> Result<Vec<Run>>;

    /// Newest first.
    async fn list_runs(
        &self,
        filter: &RunFilter,
        page: PageRequest,
    ) -> Result<Page<Run>>;

    /// Ids of the policy's `limit` most recently finished SUCCEEDED runs.
    async fn recent_succeeded_runs(
        &self,
        policy_id: PolicyId,
        limit: usize,
    ) -> Result<Vec<RunId>>;

    /// SUCCEEDED runs whose payload has not been reconciled yet, oldest
    /// first.
    async fn unreconciled_runs(&self, limit: usize) -> Result<Vec<Run>>;

    /// Records reconciliation. A run that is already reconciled keeps its
    /// original summary; returns whether this call stamped it.
    async fn mark_reconciled(
        &self,
        run_id: RunId,
        summary: &RunSummary,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn run_status_counts(
        &self,
        owner: OwnerId,
    ) -> Result<Vec<(RunStatus, u64)>>;

    /// Creation time of the owner's most recent run.
    async fn last_run_at(&self, owner: OwnerId)
    -> Result<Option<DateTime<Utc>>>;
}
