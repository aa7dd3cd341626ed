//! Local retry with capped exponential backoff for transient store and queue
//! errors. Jitter is derived from the operation key so retries of different
//! policies spread out while staying reproducible in tests.

use std::future::Future;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Duration;

use tracing::warn;

use super::config::RetryConfig;
use crate::error::Result;

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn max_attempts(&self) -> u16 {
        self.config.max_attempts.max(1)
    }

    fn base_delay_ms(&self, attempt: u16) -> u64 {
        if attempt == 0 {
            return 0;
        }

        let exp = (attempt.saturating_sub(1)) as i32;
        let scaled = (self.config.backoff_base_ms as f64) * 2f64.powi(exp);
        let capped = scaled.min(self.config.backoff_max_ms as f64);
        capped.max(0.0) as u64
    }

    fn jittered_delay_for_anchor(
        &self,
        anchor_ms: u64,
        key: impl Hash,
        attempt: u16,
    ) -> u64 {
        if anchor_ms == 0 {
            return 0;
        }

        let jitter_ratio = f64::from(self.config.jitter_ratio.max(0.0));
        let jitter_span = ((anchor_ms as f64) * jitter_ratio)
            .min(self.config.backoff_max_ms as f64);

        let lower = 0f64.max(anchor_ms as f64 - jitter_span);
        let upper =
            (anchor_ms as f64 + jitter_span).min(self.config.backoff_max_ms as f64);
        if upper <= lower {
            return lower.round() as u64;
        }

        let unit = deterministic_unit(key, attempt);
        (lower + (upper - lower) * unit).round() as u64
    }

    /// Delay before retry number `attempt` (1-based) of the operation keyed
    /// by `key`.
    pub fn delay_for(&self, key: impl Hash, attempt: u16) -> Duration {
        let anchor = self.base_delay_ms(attempt);
        Duration::from_millis(self.jittered_delay_for_anchor(anchor, key, attempt))
    }

    /// Runs `op` until it succeeds, fails with a non-transient error, or
    /// attempts run out. The last error is returned.
    pub async fn run<T, F, Fut, K>(&self, key: K, label: &str, mut op: F) -> Result<T>
    where
        K: Hash + Copy,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts();
        let mut attempt: u16 = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = self.delay_for(key, attempt);
                    warn!(
                        operation = label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn deterministic_unit(key: impl Hash, attempt: u16) -> f64 {
    let mut hasher = DefaultHasher::default();
    key.hash(&mut hasher);
    attempt.hash(&mut hasher);
    let bits = hasher.finish();
    (bits as f64) / (u64::MAX as f64)
}
