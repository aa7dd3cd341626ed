use std::sync::Arc;

use anyhow::Context;
use sqlx::{PgPool, postgres::PgPoolOptions};
use tracing::{info, warn};
use vigil_config::Config;
use vigil_core::{
    database::{InMemoryStore, PostgresStore, Store},
    orchestration::{
        InMemoryWorkQueue, OrchestratorConfig, OrchestratorRuntime,
        PostgresWorkQueue, RetryPolicy, WorkQueue,
    },
    risk::SeverityWeightedScorer,
};

/// Connects a pool sized from the database section.
pub async fn connect_pool(url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
        .context("failed to connect to PostgreSQL")
}

/// Runtime on the single-process adapters. State lives as long as the
/// process.
pub fn in_memory_runtime(config: OrchestratorConfig) -> Arc<OrchestratorRuntime> {
    let retry = RetryPolicy::new(config.retry);
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let queue: Arc<dyn WorkQueue> = Arc::new(InMemoryWorkQueue::with_retry(retry));
    Arc::new(OrchestratorRuntime::new(
        config,
        store,
        queue,
        Arc::new(SeverityWeightedScorer),
    ))
}

/// Runtime on the Postgres adapters. Requires migrations to be applied.
pub async fn postgres_runtime(
    config: OrchestratorConfig,
    pool: PgPool,
) -> anyhow::Result<Arc<OrchestratorRuntime>> {
    let store: Arc<dyn Store> = Arc::new(
        PostgresStore::connect_checked(pool.clone())
            .await
            .context("store rejected the database; run `vigil-server db migrate`")?,
    );
    let queue: Arc<dyn WorkQueue> = Arc::new(
        PostgresWorkQueue::connect_checked(pool, RetryPolicy::new(config.retry))
            .await
            .context("work queue rejected the database")?,
    );
    Ok(Arc::new(OrchestratorRuntime::new(
        config,
        store,
        queue,
        Arc::new(SeverityWeightedScorer),
    )))
}

/// Picks the adapters the configuration asks for.
pub async fn build_runtime(config: &Config) -> anyhow::Result<Arc<OrchestratorRuntime>> {
    match config.database.url.as_deref() {
        Some(url) => {
            let pool = connect_pool(url, config.database.max_connections).await?;
            info!(
                max_connections = config.database.max_connections,
                "connected to PostgreSQL"
            );
            postgres_runtime(config.orchestrator.clone(), pool).await
        }
        None => {
            warn!("running on in-memory adapters; state is lost on restart");
            Ok(in_memory_runtime(config.orchestrator.clone()))
        }
    }
}
