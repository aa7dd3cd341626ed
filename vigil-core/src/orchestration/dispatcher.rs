//! Job Dispatcher.
//!
//! Turns due policies into queued runs. The single-flight guarantee lives in
//! [`RunRepository::claim_dispatch`]: the dispatcher only proposes a claim,
//! the store decides atomically whether it wins. Nothing here holds a lock,
//! so any number of dispatchers (in any number of processes) may run
//! concurrently.
//!
//! [`RunRepository::claim_dispatch`]: crate::database::ports::RunRepository::claim_dispatch

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};
use vigil_model::{
    JobMessage, Policy, PolicyId, Run, RunError, RunId, RunStatus, RunSummary,
};

use super::{queue::WorkQueue, retry::RetryPolicy};
use crate::{
    database::{
        Store,
        ports::{ClaimOutcome, ClaimRequest, PolicyRepository, RunRepository},
        storage_time,
    },
    error::Result,
    schedule::Schedule,
};

/// Outcome of one `dispatch_due` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub dispatched: Vec<RunId>,
    /// Another run for the policy was already in flight.
    pub skipped_in_flight: usize,
    /// The policy changed between selection and claim.
    pub skipped_stale: usize,
    /// Runs committed but moved to FAILED because enqueue kept failing.
    pub enqueue_failures: Vec<RunId>,
    /// Policies that could not be processed this pass.
    pub errors: Vec<(PolicyId, String)>,
}

enum PolicyDispatch {
    Dispatched(RunId),
    InFlight,
    Stale,
    EnqueueFailed(RunId),
}

#[derive(Clone)]
pub struct JobDispatcher {
    store: Arc<dyn Store>,
    queue: Arc<dyn WorkQueue>,
    retry: RetryPolicy,
    batch_size: usize,
}

impl std::fmt::Debug for JobDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDispatcher")
            .field("queue", &self.queue)
            .field("retry", &self.retry)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl JobDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn WorkQueue>,
        retry: RetryPolicy,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            queue,
            retry,
            batch_size: batch_size.max(1),
        }
    }

    /// Claims every ACTIVE policy due at `now` that has no run in flight,
    /// creates its QUEUED run and hands the job to the work queue.
    ///
    /// Per-policy failures are collected in the report rather than aborting
    /// the pass; only failing to list due policies is an error.
    #[instrument(skip(self), fields(now = %now))]
    pub async fn dispatch_due(&self, now: DateTime<Utc>) -> Result<DispatchReport> {
        let now = storage_time(now);
        let store = &self.store;
        let due = self
            .retry
            .run("due-policies", "due_policies", || {
                store.due_policies(now, self.batch_size)
            })
            .await?;

        let mut report = DispatchReport::default();
        for policy in due {
            let policy_id = policy.id;
            match self.dispatch_policy(policy, now).await {
                Ok(PolicyDispatch::Dispatched(run_id)) => {
                    report.dispatched.push(run_id)
                }
                Ok(PolicyDispatch::InFlight) => report.skipped_in_flight += 1,
                Ok(PolicyDispatch::Stale) => report.skipped_stale += 1,
                Ok(PolicyDispatch::EnqueueFailed(run_id)) => {
                    report.enqueue_failures.push(run_id)
                }
                Err(err) => {
                    warn!(%policy_id, error = %err, "dispatch failed; policy stays due");
                    report.errors.push((policy_id, err.to_string()));
                }
            }
        }

        if !report.dispatched.is_empty() || !report.errors.is_empty() {
            info!(
                target: "vigil::dispatch",
                dispatched = report.dispatched.len(),
                in_flight = report.skipped_in_flight,
                stale = report.skipped_stale,
                enqueue_failures = report.enqueue_failures.len(),
                errors = report.errors.len(),
                "dispatch pass complete"
            );
        }
        Ok(report)
    }

    #[instrument(skip(self, policy), fields(policy_id = %policy.id, kind = %policy.kind()))]
    async fn dispatch_policy(
        &self,
        policy: Policy,
        now: DateTime<Utc>,
    ) -> Result<PolicyDispatch> {
        let schedule = Schedule::parse(&policy.schedule)?;
        // Dispatch consumes any outstanding trigger.
        let next_run_at = schedule.next_after(Some(now), policy.created_at);

        let run = Run {
            id: RunId::new(),
            policy_id: policy.id,
            owner: policy.owner,
            kind: policy.kind(),
            status: RunStatus::Queued,
            created_at: now,
            started_at: None,
            finished_at: None,
            summary: RunSummary::default(),
            payload: None,
            reconciled_at: None,
        };
        let request = ClaimRequest {
            policy_id: policy.id,
            expected_updated_at: policy.updated_at,
            run,
            next_run_at,
            now,
        };

        let store = &self.store;
        let outcome = self
            .retry
            .run(policy.id, "claim_dispatch", || {
                store.claim_dispatch(request.clone())
            })
            .await?;

        let run = match outcome {
            ClaimOutcome::Claimed(run) => run,
            ClaimOutcome::AlreadyInFlight => {
                debug!("run already in flight");
                return Ok(PolicyDispatch::InFlight);
            }
            ClaimOutcome::Stale => {
                debug!("policy changed before claim");
                return Ok(PolicyDispatch::Stale);
            }
        };

        let job = JobMessage {
            run_id: run.id,
            policy_id: policy.id,
            owner: policy.owner,
            kind: policy.kind(),
            spec: policy.spec.clone(),
            targets: policy.targets.clone(),
            intensity: policy.intensity,
        };

        let queue = &self.queue;
        let enqueued = self
            .retry
            .run(run.id, "enqueue", || queue.enqueue(&job))
            .await;

        match enqueued {
            Ok(()) => {
                info!(target: "vigil::dispatch", run_id = %run.id, next_run_at = ?next_run_at, "run queued");
                Ok(PolicyDispatch::Dispatched(run.id))
            }
            Err(err) => {
                error!(run_id = %run.id, error = %err, "enqueue failed; failing run");
                self.fail_unqueued(run.id, &err.to_string(), now).await?;
                Ok(PolicyDispatch::EnqueueFailed(run.id))
            }
        }
    }

    /// Moves a committed-but-unqueued run to FAILED and re-arms its policy.
    /// If even this fails the run stays QUEUED and the timeout sweep
    /// collects it.
    async fn fail_unqueued(
        &self,
        run_id: RunId,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let store = &self.store;
        let error = RunError::dispatch(format!("enqueue failed: {message}"));
        let applied = self
            .retry
            .run(run_id, "fail_dispatch", || {
                store.fail_dispatch(run_id, error.clone(), now)
            })
            .await?;
        if !applied {
            warn!(%run_id, "run left QUEUED before dispatch failure was recorded");
        }
        Ok(())
    }
}
