use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use vigil_model::{JobMessage, RunId};

use super::retry::RetryPolicy;
use crate::error::Result;

/// Worker asking for its next job.
#[derive(Clone, Debug)]
pub struct LeaseRequest {
    pub worker_id: String,
    pub ttl: Duration,
    pub now: DateTime<Utc>,
}

/// A job handed to a worker. Until it is acknowledged, the message comes
/// back to the queue once `expires_at` passes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeasedJob {
    pub job: JobMessage,
    pub lease_owner: String,
    pub expires_at: DateTime<Utc>,
    /// Deliveries before this one.
    pub attempts: u32,
}

/// Durable at-least-once channel to the external workers, keyed by run.
#[async_trait]
pub trait WorkQueue: Send + Sync + fmt::Debug {
    /// Idempotent: a second enqueue for the same `run_id` is a no-op.
    async fn enqueue(&self, job: &JobMessage) -> Result<()>;

    async fn lease(&self, request: LeaseRequest) -> Result<Option<LeasedJob>>;

    /// Drops the message for `run_id`. Returns whether one was present.
    async fn ack(&self, run_id: RunId) -> Result<bool>;

    /// Puts messages whose lease expired back in the ready set, with backoff.
    /// Returns how many were released.
    async fn release_expired_leases(&self, now: DateTime<Utc>) -> Result<u64>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EntryState {
    Ready,
    Leased,
}

#[derive(Debug)]
struct Entry {
    job: JobMessage,
    state: EntryState,
    attempts: u32,
    lease_owner: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    available_at: Option<DateTime<Utc>>,
    seq: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: HashMap<RunId, Entry>,
    next_seq: u64,
}

/// Single-process queue for tests and development.
#[derive(Clone, Debug, Default)]
pub struct InMemoryWorkQueue {
    state: Arc<Mutex<QueueState>>,
    retry: RetryPolicy,
}

impl InMemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry(retry: RetryPolicy) -> Self {
        Self {
            state: Arc::default(),
            retry,
        }
    }

    /// Messages not yet acknowledged, leased or not.
    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, run_id: RunId) -> bool {
        self.state.lock().await.entries.contains_key(&run_id)
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn enqueue(&self, job: &JobMessage) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.entries.contains_key(&job.run_id) {
            debug!(run_id = %job.run_id, "job already enqueued");
            return Ok(());
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(
            job.run_id,
            Entry {
                job: job.clone(),
                state: EntryState::Ready,
                attempts: 0,
                lease_owner: None,
                lease_expires_at: None,
                available_at: None,
                seq,
            },
        );
        Ok(())
    }

    async fn lease(&self, request: LeaseRequest) -> Result<Option<LeasedJob>> {
        let mut state = self.state.lock().await;
        let next = state
            .entries
            .values_mut()
            .filter(|e| {
                e.state == EntryState::Ready
                    && e.available_at.is_none_or(|at| at <= request.now)
            })
            .min_by_key(|e| (e.available_at, e.seq));

        let Some(entry) = next else {
            return Ok(None);
        };
        let expires_at = request.now + request.ttl;
        entry.state = EntryState::Leased;
        entry.lease_owner = Some(request.worker_id.clone());
        entry.lease_expires_at = Some(expires_at);

        Ok(Some(LeasedJob {
            job: entry.job.clone(),
            lease_owner: request.worker_id,
            expires_at,
            attempts: entry.attempts,
        }))
    }

    async fn ack(&self, run_id: RunId) -> Result<bool> {
        Ok(self.state.lock().await.entries.remove(&run_id).is_some())
    }

    async fn release_expired_leases(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let max_deliveries = u32::from(self.retry.max_attempts());
        let mut released = 0u64;
        let mut dead = Vec::new();

        for (run_id, entry) in state.entries.iter_mut() {
            let expired = entry.state == EntryState::Leased
                && entry.lease_expires_at.is_some_and(|at| at < now);
            if !expired {
                continue;
            }
            let attempt_next = entry.attempts.saturating_add(1);
            if attempt_next >= max_deliveries {
                dead.push(*run_id);
                continue;
            }
            let delay = self.retry.delay_for(run_id, attempt_next as u16);
            entry.attempts = attempt_next;
            entry.state = EntryState::Ready;
            entry.lease_owner = None;
            entry.lease_expires_at = None;
            entry.available_at = Some(
                now + Duration::from_std(delay).unwrap_or(Duration::zero()),
            );
            released += 1;
        }

        for run_id in dead {
            warn!(%run_id, "lease expired too many times; dropping job");
            state.entries.remove(&run_id);
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use vigil_model::{
        DiscoverySpec, Intensity, OwnerId, PolicyId, PolicyKind, PolicySpec,
        TargetSelection,
    };

    use super::*;
    use crate::orchestration::config::RetryConfig;

    fn job() -> JobMessage {
        JobMessage {
            run_id: RunId::new(),
            policy_id: PolicyId::new(),
            owner: OwnerId::new(),
            kind: PolicyKind::Discovery,
            spec: PolicySpec::Discovery(DiscoverySpec {
                asset_type: vigil_model::AssetType::Domain,
                stale_after_runs: None,
            }),
            targets: TargetSelection::Manual(vec!["example.com".into()]),
            intensity: Intensity::Normal,
        }
    }

    fn request(now: DateTime<Utc>) -> LeaseRequest {
        LeaseRequest {
            worker_id: "worker-1".into(),
            ttl: Duration::seconds(30),
            now,
        }
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_and_lease_is_exclusive() {
        let queue = InMemoryWorkQueue::new();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let message = job();
        queue.enqueue(&message).await.unwrap();
        queue.enqueue(&message).await.unwrap();
        assert_eq!(queue.len().await, 1);

        let leased = queue.lease(request(now)).await.unwrap().unwrap();
        assert_eq!(leased.job, message);
        assert!(queue.lease(request(now)).await.unwrap().is_none());

        assert!(queue.ack(message.run_id).await.unwrap());
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn expired_lease_is_redelivered_after_backoff() {
        let queue = InMemoryWorkQueue::with_retry(RetryPolicy::new(RetryConfig {
            max_attempts: 5,
            backoff_base_ms: 1_000,
            backoff_max_ms: 1_000,
            jitter_ratio: 0.0,
        }));
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        queue.enqueue(&job()).await.unwrap();
        queue.lease(request(now)).await.unwrap().unwrap();

        let later = now + Duration::seconds(31);
        assert_eq!(queue.release_expired_leases(later).await.unwrap(), 1);
        assert!(queue.lease(request(later)).await.unwrap().is_none());

        let redelivered = queue
            .lease(request(later + Duration::seconds(1)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(redelivered.attempts, 1);
    }
}
