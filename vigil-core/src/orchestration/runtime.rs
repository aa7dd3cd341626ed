//! Orchestration loop.
//!
//! Every tick runs the timeout sweep, dispatches due policies, retries
//! pending reconciliations and releases expired queue leases. Correctness
//! never depends on there being a single loop: replicas coordinate only
//! through the store's conditional writes.

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    config::OrchestratorConfig,
    dispatcher::JobDispatcher,
    queue::WorkQueue,
    reconciler::ResultReconciler,
    retry::RetryPolicy,
    sweep::TimeoutSweep,
    tracker::RunTracker,
};
use crate::{database::Store, risk::RiskScorer};

/// What one orchestration cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub timed_out: usize,
    pub dispatched: usize,
    pub enqueue_failures: usize,
    pub reconciled: usize,
    pub released_leases: u64,
    /// Steps that failed outright, as `step: error`.
    pub errors: Vec<String>,
}

#[derive(Clone)]
struct Cycle {
    sweep: TimeoutSweep,
    dispatcher: JobDispatcher,
    reconciler: ResultReconciler,
    queue: Arc<dyn WorkQueue>,
    reconcile_batch_size: usize,
}

impl Cycle {
    async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        match self.sweep.sweep(now).await {
            Ok(swept) => {
                report.timed_out = swept.timed_out.len();
                report.errors.extend(
                    swept
                        .errors
                        .iter()
                        .map(|(run_id, err)| format!("sweep {run_id}: {err}")),
                );
            }
            Err(err) => {
                warn!(error = %err, "timeout sweep failed");
                report.errors.push(format!("sweep: {err}"));
            }
        }

        match self.dispatcher.dispatch_due(now).await {
            Ok(dispatch) => {
                report.dispatched = dispatch.dispatched.len();
                report.enqueue_failures = dispatch.enqueue_failures.len();
            }
            Err(err) => {
                warn!(error = %err, "dispatch pass failed");
                report.errors.push(format!("dispatch: {err}"));
            }
        }

        match self
            .reconciler
            .retry_pending(self.reconcile_batch_size)
            .await
        {
            Ok(pending) => report.reconciled = pending.reconciled,
            Err(err) => {
                warn!(error = %err, "reconciliation retry failed");
                report.errors.push(format!("reconcile: {err}"));
            }
        }

        match self.queue.release_expired_leases(now).await {
            Ok(released) => report.released_leases = released,
            Err(err) => {
                warn!(error = %err, "lease release failed");
                report.errors.push(format!("leases: {err}"));
            }
        }

        report
    }
}

pub struct OrchestratorRuntime {
    config: OrchestratorConfig,
    store: Arc<dyn Store>,
    queue: Arc<dyn WorkQueue>,
    cycle: Cycle,
    tracker: RunTracker,
    shutdown_token: CancellationToken,
    loop_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for OrchestratorRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let loop_count = self
            .loop_handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();

        f.debug_struct("OrchestratorRuntime")
            .field("config", &self.config)
            .field("queue", &self.queue)
            .field("loop_count", &loop_count)
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl OrchestratorRuntime {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn Store>,
        queue: Arc<dyn WorkQueue>,
        scorer: Arc<dyn RiskScorer>,
    ) -> Self {
        let retry = RetryPolicy::new(config.retry);
        let reconciler = ResultReconciler::new(store.clone(), scorer);
        let cycle = Cycle {
            sweep: TimeoutSweep::new(
                store.clone(),
                queue.clone(),
                config.timeouts,
                config.dispatch_batch_size,
            ),
            dispatcher: JobDispatcher::new(
                store.clone(),
                queue.clone(),
                retry,
                config.dispatch_batch_size,
            ),
            reconciler: reconciler.clone(),
            queue: queue.clone(),
            reconcile_batch_size: config.reconcile_batch_size.max(1),
        };
        let tracker = RunTracker::new(store.clone(), queue.clone(), reconciler);

        Self {
            config,
            store,
            queue,
            cycle,
            tracker,
            shutdown_token: CancellationToken::new(),
            loop_handles: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    pub fn queue(&self) -> Arc<dyn WorkQueue> {
        self.queue.clone()
    }

    pub fn tracker(&self) -> &RunTracker {
        &self.tracker
    }

    pub fn dispatcher(&self) -> &JobDispatcher {
        &self.cycle.dispatcher
    }

    pub fn sweep(&self) -> &TimeoutSweep {
        &self.cycle.sweep
    }

    pub fn reconciler(&self) -> &ResultReconciler {
        &self.cycle.reconciler
    }

    /// Runs one cycle at `now`. Step failures are logged and reported, never
    /// propagated, so one broken step cannot starve the others.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        self.cycle.tick(now).await
    }

    /// Spawns the periodic loop. Calling it again while running is a no-op,
    /// as is calling it after [`shutdown`](Self::shutdown).
    pub async fn start(&self) {
        if self.shutdown_token.is_cancelled() {
            warn!("orchestration runtime was shut down; not starting the loop");
            return;
        }
        let mut handles = self.loop_handles.lock().await;
        if !handles.is_empty() {
            debug!("orchestration loop already running");
            return;
        }

        let cycle = self.cycle.clone();
        let interval = self.config.tick_interval();
        let shutdown = self.shutdown_token.clone();
        let handle = tokio::spawn(async move {
            info!(interval_ms = interval.as_millis() as u64, "orchestration loop started");
            loop {
                let report = cycle.tick(Utc::now()).await;
                if report != TickReport::default() {
                    debug!(?report, "orchestration tick");
                }
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("orchestration loop shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });
        handles.push(handle);
    }

    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.loop_handles.lock().await;
            std::mem::take(&mut *guard)
        };

        for handle in handles {
            match tokio::time::timeout(std::time::Duration::from_secs(30), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("orchestration loop task failed: {e:?}"),
                Err(_) => warn!("orchestration loop timed out during shutdown"),
            }
        }
        info!("orchestration runtime shutdown complete");
    }
}
