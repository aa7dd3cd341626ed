//! Run Tracker: the worker callback contract.
//!
//! Each transition is a compare-and-swap on the run's current status, so
//! late or duplicated worker callbacks are rejected instead of overwriting a
//! run that already moved on.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use vigil_model::{
    ErrorCategory, PolicyId, Run, RunError, RunId, RunPayload, RunStatus,
    RunSummary,
};

use super::{queue::WorkQueue, reconciler::ResultReconciler};
use crate::{
    database::{
        Store, next_revision,
        ports::{PolicyRepository, RunRepository, RunTransition},
        storage_time,
    },
    error::{Result, VigilError},
    schedule::policy_next_run_at,
};

const SCHEDULE_REFRESH_ATTEMPTS: usize = 3;

/// Failure reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerFailure {
    pub message: String,
    #[serde(default)]
    pub retryable: bool,
}

impl WorkerFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

#[derive(Clone)]
pub struct RunTracker {
    store: Arc<dyn Store>,
    queue: Arc<dyn WorkQueue>,
    reconciler: ResultReconciler,
}

impl std::fmt::Debug for RunTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunTracker")
            .field("queue", &self.queue)
            .field("reconciler", &self.reconciler)
            .finish_non_exhaustive()
    }
}

impl RunTracker {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn WorkQueue>,
        reconciler: ResultReconciler,
    ) -> Self {
        Self {
            store,
            queue,
            reconciler,
        }
    }

    /// QUEUED -> RUNNING.
    pub async fn mark_running(&self, run_id: RunId) -> Result<Run> {
        self.mark_running_at(run_id, Utc::now()).await
    }

    #[instrument(skip(self), err)]
    pub async fn mark_running_at(
        &self,
        run_id: RunId,
        at: DateTime<Utc>,
    ) -> Result<Run> {
        let transition = RunTransition::new(
            run_id,
            RunStatus::Queued,
            RunStatus::Running,
            storage_time(at),
        );
        let run = self.transition(transition).await?;
        info!(policy_id = %run.policy_id, "run started");
        Ok(run)
    }

    /// RUNNING -> SUCCEEDED, then reconcile the payload. A reconciliation
    /// failure does not undo the transition; the orchestration loop retries
    /// it.
    pub async fn mark_succeeded(
        &self,
        run_id: RunId,
        payload: RunPayload,
    ) -> Result<Run> {
        self.mark_succeeded_at(run_id, payload, Utc::now()).await
    }

    #[instrument(skip(self, payload), fields(assets = payload.discovered_assets.len(), findings = payload.findings.len()), err)]
    pub async fn mark_succeeded_at(
        &self,
        run_id: RunId,
        payload: RunPayload,
        at: DateTime<Utc>,
    ) -> Result<Run> {
        let transition = RunTransition::new(
            run_id,
            RunStatus::Running,
            RunStatus::Succeeded,
            storage_time(at),
        )
        .with_payload(payload);
        let mut run = self.transition(transition).await?;
        self.finish(&run).await;

        match self.reconciler.reconcile(&run).await {
            Ok(summary) => {
                run.summary = summary;
                match self.store.get_run(run.id).await {
                    Ok(stored) => {
                        run.reconciled_at =
                            stored.and_then(|stored| stored.reconciled_at);
                    }
                    Err(err) => {
                        warn!(error = %err, "could not read back reconciled run");
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "reconciliation failed; will retry");
            }
        }
        Ok(run)
    }

    /// RUNNING -> FAILED with an execution error. The policy is retried on
    /// its normal schedule.
    pub async fn mark_failed(
        &self,
        run_id: RunId,
        failure: WorkerFailure,
    ) -> Result<Run> {
        self.mark_failed_at(run_id, failure, Utc::now()).await
    }

    #[instrument(skip(self, failure), err)]
    pub async fn mark_failed_at(
        &self,
        run_id: RunId,
        failure: WorkerFailure,
        at: DateTime<Utc>,
    ) -> Result<Run> {
        let error = RunError::new(
            ErrorCategory::Execution,
            failure.message,
            failure.retryable,
        );
        let transition = RunTransition::new(
            run_id,
            RunStatus::Running,
            RunStatus::Failed,
            storage_time(at),
        )
        .with_summary(RunSummary::failed(error));
        let run = self.transition(transition).await?;
        self.finish(&run).await;
        info!(policy_id = %run.policy_id, "run failed");
        Ok(run)
    }

    async fn transition(&self, transition: RunTransition) -> Result<Run> {
        let run_id = transition.run_id;
        let (from, to) = (transition.from, transition.to);
        if let Some(run) = self.store.transition_run(transition).await? {
            return Ok(run);
        }
        match self.store.get_run(run_id).await? {
            None => Err(VigilError::not_found("run", run_id)),
            Some(run) => Err(VigilError::InvalidTransition(format!(
                "run {run_id} is {}; cannot move {from} -> {to}",
                run.status
            ))),
        }
    }

    /// Terminal bookkeeping: drop the queue message and bring the policy's
    /// `next_run_at` up to date. Neither failure affects the run itself.
    async fn finish(&self, run: &Run) {
        if let Err(err) = self.queue.ack(run.id).await {
            warn!(run_id = %run.id, error = %err, "queue ack failed; message will expire");
        }
        if let Err(err) = refresh_schedule(&*self.store, run.policy_id).await {
            warn!(policy_id = %run.policy_id, error = %err, "could not refresh next_run_at");
        }
    }
}

/// Recomputes a policy's `next_run_at` from its schedule, writing only when
/// it changed.
pub(crate) async fn refresh_schedule(
    store: &dyn Store,
    policy_id: PolicyId,
) -> Result<()> {
    for _ in 0..SCHEDULE_REFRESH_ATTEMPTS {
        let Some(mut policy) = store.get_policy(policy_id).await? else {
            return Ok(());
        };
        let next = policy_next_run_at(&policy)?;
        if next == policy.next_run_at {
            return Ok(());
        }
        let expected = policy.updated_at;
        policy.next_run_at = next;
        policy.updated_at = next_revision(expected, Utc::now());
        if store.update_policy(&policy, expected).await? {
            return Ok(());
        }
    }
    Err(VigilError::Conflict(format!(
        "policy {policy_id} kept changing while refreshing its schedule"
    )))
}
