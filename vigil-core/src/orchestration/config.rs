use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use vigil_model::PolicyKind;

use crate::database::ports::TimeoutCutoffs;

/// Knobs for the orchestration loop.
///
/// Every field has a default so a deployment can supply as little of the
/// `[orchestrator]` section as it likes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Cadence of the orchestration loop (milliseconds).
    pub tick_interval_ms: u64,
    /// Due policies claimed per cycle.
    pub dispatch_batch_size: usize,
    /// Succeeded-but-unreconciled runs retried per cycle.
    pub reconcile_batch_size: usize,
    pub timeouts: TimeoutConfig,
    /// Local retry for transient store/queue errors.
    pub retry: RetryConfig,
    pub lease: LeaseConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 5_000,
            dispatch_batch_size: 100,
            reconcile_batch_size: 50,
            timeouts: TimeoutConfig::default(),
            retry: RetryConfig::default(),
            lease: LeaseConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn tick_interval(&self) -> core::time::Duration {
        core::time::Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

/// How long a run may sit in each in-flight state before the sweep gives up
/// on it.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Max time in QUEUED (seconds).
    pub dispatch_timeout_secs: u64,
    /// Max time in RUNNING for discovery runs (seconds).
    pub discovery_execution_secs: u64,
    /// Max time in RUNNING for scan runs (seconds).
    pub scan_execution_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            dispatch_timeout_secs: 600,
            discovery_execution_secs: 3_600,
            scan_execution_secs: 7_200,
        }
    }
}

fn secs(value: u64) -> Duration {
    Duration::try_seconds(i64::try_from(value).unwrap_or(i64::MAX))
        .unwrap_or(Duration::MAX)
}

impl TimeoutConfig {
    pub fn dispatch_timeout(&self) -> Duration {
        secs(self.dispatch_timeout_secs)
    }

    pub fn execution_timeout(&self, kind: PolicyKind) -> Duration {
        match kind {
            PolicyKind::Discovery => secs(self.discovery_execution_secs),
            PolicyKind::Scan => secs(self.scan_execution_secs),
        }
    }

    /// Timestamps before which in-flight runs are abandoned, as of `now`.
    pub fn cutoffs(&self, now: DateTime<Utc>) -> TimeoutCutoffs {
        let before = |limit: Duration| {
            now.checked_sub_signed(limit)
                .unwrap_or(DateTime::<Utc>::MIN_UTC)
        };
        TimeoutCutoffs {
            queued_before: before(self.dispatch_timeout()),
            discovery_started_before: before(
                self.execution_timeout(PolicyKind::Discovery),
            ),
            scan_started_before: before(
                self.execution_timeout(PolicyKind::Scan),
            ),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first.
    pub max_attempts: u16,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Percentage-based jitter to spread out retries.
    pub jitter_ratio: f32,
}

impl RetryConfig {
    pub fn backoff_base(&self) -> core::time::Duration {
        core::time::Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> core::time::Duration {
        core::time::Duration::from_millis(self.backoff_max_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 200,
            backoff_max_ms: 5_000,
            jitter_ratio: 0.2,
        }
    }
}

/// Work-queue lease tuning.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// TTL handed to workers when they lease a job (seconds).
    pub lease_ttl_secs: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self { lease_ttl_secs: 300 }
    }
}

impl LeaseConfig {
    pub fn ttl(&self) -> Duration {
        secs(self.lease_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn partial_sections_keep_defaults() {
        let config: OrchestratorConfig = serde_json::from_str(
            r#"{"tick_interval_ms": 250, "timeouts": {"scan_execution_secs": 60}}"#,
        )
        .unwrap();
        assert_eq!(config.tick_interval_ms, 250);
        assert_eq!(config.dispatch_batch_size, 100);
        assert_eq!(config.timeouts.scan_execution_secs, 60);
        assert_eq!(config.timeouts.discovery_execution_secs, 3_600);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn cutoffs_are_kind_specific() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let cutoffs = TimeoutConfig::default().cutoffs(now);
        assert_eq!(cutoffs.queued_before, now - Duration::minutes(10));
        assert_eq!(cutoffs.discovery_started_before, now - Duration::hours(1));
        assert_eq!(cutoffs.scan_started_before, now - Duration::hours(2));
    }
}
