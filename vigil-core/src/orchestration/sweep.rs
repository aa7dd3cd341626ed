//! Timeout Sweep.
//!
//! A worker that dies without reporting back would hold its policy's
//! single-flight slot forever. The sweep times out runs that sat in QUEUED
//! or RUNNING past their limit so the policy can be dispatched again.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};
use vigil_model::{Run, RunError, RunId, RunStatus, RunSummary};

use super::{config::TimeoutConfig, queue::WorkQueue, tracker::refresh_schedule};
use crate::{
    database::{
        Store,
        ports::{RunRepository, RunTransition},
        storage_time,
    },
    error::Result,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub timed_out: Vec<RunId>,
    /// Runs whose transition failed; retried next cycle.
    pub errors: Vec<(RunId, String)>,
}

#[derive(Clone)]
pub struct TimeoutSweep {
    store: Arc<dyn Store>,
    queue: Arc<dyn WorkQueue>,
    timeouts: TimeoutConfig,
    batch_size: usize,
}

impl std::fmt::Debug for TimeoutSweep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutSweep")
            .field("timeouts", &self.timeouts)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl TimeoutSweep {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn WorkQueue>,
        timeouts: TimeoutConfig,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            queue,
            timeouts,
            batch_size: batch_size.max(1),
        }
    }

    #[instrument(skip(self), fields(now = %now))]
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let now = storage_time(now);
        let expired = self
            .store
            .expired_runs(self.timeouts.cutoffs(now), self.batch_size)
            .await?;

        let mut report = SweepReport::default();
        for run in expired {
            let transition =
                RunTransition::new(run.id, run.status, RunStatus::TimedOut, now)
                    .with_summary(RunSummary::failed(RunError::timeout(
                        self.describe(&run),
                    )));
            match self.store.transition_run(transition).await {
                Ok(Some(_)) => {}
                // The run may have moved on since it was read; that is fine.
                Ok(None) => continue,
                Err(err) => {
                    warn!(run_id = %run.id, error = %err, "could not time out run");
                    report.errors.push((run.id, err.to_string()));
                    continue;
                }
            }
            warn!(run_id = %run.id, policy_id = %run.policy_id, from = %run.status, "run timed out");
            if let Err(err) = self.queue.ack(run.id).await {
                warn!(run_id = %run.id, error = %err, "queue ack failed for timed out run");
            }
            if let Err(err) = refresh_schedule(&*self.store, run.policy_id).await {
                warn!(policy_id = %run.policy_id, error = %err, "could not refresh next_run_at");
            }
            report.timed_out.push(run.id);
        }

        if !report.timed_out.is_empty() || !report.errors.is_empty() {
            info!(
                count = report.timed_out.len(),
                errors = report.errors.len(),
                "timeout sweep complete"
            );
        }
        Ok(report)
    }

    fn describe(&self, run: &Run) -> String {
        match run.status {
            RunStatus::Queued => format!(
                "not picked up within {}s",
                self.timeouts.dispatch_timeout().num_seconds()
            ),
            _ => format!(
                "{} run did not finish within {}s",
                run.kind,
                self.timeouts.execution_timeout(run.kind).num_seconds()
            ),
        }
    }
}
