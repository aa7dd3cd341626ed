use thiserror::Error;
use vigil_model::PolicyKind;

use super::models::Config;

/// Settings the server refuses to start with.
#[derive(Debug, Error)]
pub enum ConfigGuardRailError {
    #[error("orchestrator.{field} {reason}")]
    InvalidOrchestrator { field: &'static str, reason: String },
    #[error("database.max_connections must be at least 1")]
    EmptyPool,
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(
        &mut self,
        message: S,
        hint: H,
    ) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfigWarning> {
        self.items.iter()
    }
}

pub fn apply_guard_rails(
    config: &Config,
) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();
    let orchestrator = &config.orchestrator;

    if config.database.max_connections == 0 {
        return Err(ConfigGuardRailError::EmptyPool);
    }
    if orchestrator.dispatch_batch_size == 0 {
        return Err(invalid("dispatch_batch_size", "must be at least 1"));
    }
    if orchestrator.reconcile_batch_size == 0 {
        return Err(invalid("reconcile_batch_size", "must be at least 1"));
    }
    if orchestrator.retry.max_attempts == 0 {
        return Err(invalid("retry.max_attempts", "must be at least 1"));
    }
    if !(0.0..=1.0).contains(&orchestrator.retry.jitter_ratio) {
        return Err(invalid("retry.jitter_ratio", "must be within 0.0..=1.0"));
    }
    if orchestrator.retry.backoff_base_ms > orchestrator.retry.backoff_max_ms {
        warnings.push_with_hint(
            "retry.backoff_base_ms exceeds retry.backoff_max_ms; every retry waits the maximum",
            "Lower backoff_base_ms or raise backoff_max_ms",
        );
    }

    let tick_secs = orchestrator.tick_interval().as_secs_f64();
    let dispatch_secs = orchestrator.timeouts.dispatch_timeout_secs as f64;
    if tick_secs > dispatch_secs {
        warnings.push_with_hint(
            format!(
                "tick interval ({}ms) is longer than the dispatch timeout ({}s); queued runs are swept late",
                orchestrator.tick_interval_ms, orchestrator.timeouts.dispatch_timeout_secs
            ),
            "Shorten orchestrator.tick_interval_ms or raise timeouts.dispatch_timeout_secs",
        );
    }

    for kind in [PolicyKind::Discovery, PolicyKind::Scan] {
        let limit = orchestrator.timeouts.execution_timeout(kind);
        if (limit.num_milliseconds() as f64) < tick_secs * 1_000.0 {
            warnings.push_with_hint(
                format!(
                    "{} execution timeout ({}s) is shorter than the tick interval ({}ms)",
                    kind.as_str().to_ascii_lowercase(),
                    limit.num_seconds(),
                    orchestrator.tick_interval_ms
                ),
                "Raise the execution timeout so running jobs get at least one cycle",
            );
        }
    }

    if orchestrator.lease.lease_ttl_secs == 0 {
        warnings.push_with_hint(
            "lease.lease_ttl_secs is 0; every leased job is redelivered on the next cycle",
            "Use a TTL longer than a typical job pickup",
        );
    }

    Ok(warnings)
}

fn invalid(field: &'static str, reason: &str) -> ConfigGuardRailError {
    ConfigGuardRailError::InvalidOrchestrator {
        field,
        reason: reason.to_string(),
    }
}
