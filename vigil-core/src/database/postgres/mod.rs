//! Postgres adapter for the storage ports.
//!
//! Single-flight dispatch leans on two database guarantees: the policy row
//! is locked `FOR UPDATE` for the duration of a claim, and the partial
//! unique index `uq_runs_policy_in_flight` arbitrates the run insert. Either
//! alone is enough to stop two replicas from queueing the same policy twice.

use std::fmt;

use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::info;
use vigil_model::PageRequest;

use crate::error::{Result, VigilError};

mod inventory;
mod policies;
pub(crate) mod rows;
mod runs;

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

impl PostgresStore {
    /// Wraps an existing pool without checking schema.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects and verifies the single-flight index exists.
    pub async fn connect_checked(pool: PgPool) -> Result<Self> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| {
                VigilError::Storage(format!(
                    "store failed Postgres health check: {e}"
                ))
            })?;

        let index_exists = sqlx::query_scalar::<_, i32>(
            "SELECT 1 FROM pg_indexes WHERE indexname = $1 LIMIT 1",
        )
        .bind("uq_runs_policy_in_flight")
        .fetch_optional(&pool)
        .await?
        .is_some();

        if !index_exists {
            return Err(VigilError::Storage(
                "required index uq_runs_policy_in_flight is missing; run migrations"
                    .into(),
            ));
        }

        info!("store connected to Postgres");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

pub(super) fn push_page(builder: &mut QueryBuilder<'_, Postgres>, page: PageRequest) {
    builder.push(" LIMIT ");
    builder.push_bind(page.limit() as i64);
    builder.push(" OFFSET ");
    builder.push_bind(page.offset() as i64);
}

/// Rows affected from a conditional update, as a yes/no.
pub(super) fn applied(result: sqlx::postgres::PgQueryResult) -> bool {
    result.rows_affected() > 0
}
