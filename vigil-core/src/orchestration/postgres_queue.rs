//! Durable work queue on the `work_queue` table.
//!
//! Leasing uses `FOR UPDATE SKIP LOCKED` so concurrent workers never block
//! on, or double-lease, the same message. Expired leases are resurrected with
//! backoff by the orchestration loop.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, types::Json};
use tracing::{info, instrument, warn};
use uuid::Uuid;
use vigil_model::{JobMessage, RunId};

use super::{
    queue::{LeaseRequest, LeasedJob, WorkQueue},
    retry::RetryPolicy,
};
use crate::{
    database::postgres::rows::QueueRow,
    error::{Result, VigilError},
};

#[derive(Clone)]
pub struct PostgresWorkQueue {
    pool: PgPool,
    retry: RetryPolicy,
}

impl fmt::Debug for PostgresWorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresWorkQueue")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .field("retry", &self.retry)
            .finish()
    }
}

fn queue_error(action: &str, err: sqlx::Error) -> VigilError {
    VigilError::Queue(format!("{action} failed: {e}", e = err))
}

impl PostgresWorkQueue {
    pub fn new(pool: PgPool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    /// Verifies the queue table and its dequeue index exist.
    pub async fn connect_checked(pool: PgPool, retry: RetryPolicy) -> Result<Self> {
        let idx_exists = sqlx::query_scalar::<_, i32>(
            "SELECT 1 FROM pg_indexes WHERE indexname = $1 LIMIT 1",
        )
        .bind("idx_work_queue_ready")
        .fetch_optional(&pool)
        .await
        .map_err(|e| queue_error("queue schema validation", e))?
        .is_some();

        if !idx_exists {
            return Err(VigilError::Queue(
                "required index idx_work_queue_ready is missing; run migrations"
                    .into(),
            ));
        }

        info!("work queue connected to Postgres");
        Ok(Self { pool, retry })
    }
}

#[async_trait]
impl WorkQueue for PostgresWorkQueue {
    #[instrument(skip(self, job), fields(run_id = %job.run_id), err)]
    async fn enqueue(&self, job: &JobMessage) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO work_queue (
                run_id, payload, state, attempts, available_at, created_at,
                updated_at
            )
            VALUES ($1, $2, 'ready', 0, $3, $3, $3)
            ON CONFLICT (run_id) DO NOTHING
            "#,
        )
        .bind(job.run_id.to_uuid())
        .bind(Json(job))
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| queue_error("enqueue", e))?;
        Ok(())
    }

    #[instrument(skip(self, request), fields(worker = %request.worker_id), err)]
    async fn lease(&self, request: LeaseRequest) -> Result<Option<LeasedJob>> {
        let expires_at = request.now + request.ttl;
        let row = sqlx::query_as::<_, QueueRow>(
            r#"
            WITH next AS (
                SELECT run_id
                FROM work_queue
                WHERE state = 'ready' AND available_at <= $1
                ORDER BY available_at, created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE work_queue q
            SET state = 'leased',
                lease_owner = $2,
                lease_expires_at = $3,
                updated_at = $1
            FROM next
            WHERE q.run_id = next.run_id
            RETURNING q.payload, q.attempts, q.lease_owner, q.lease_expires_at
            "#,
        )
        .bind(request.now)
        .bind(&request.worker_id)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| queue_error("lease", e))?;

        Ok(row.map(|row| LeasedJob {
            job: row.payload.0,
            lease_owner: row
                .lease_owner
                .unwrap_or_else(|| request.worker_id.clone()),
            expires_at: row.lease_expires_at.unwrap_or(expires_at),
            attempts: row.attempts.max(0) as u32,
        }))
    }

    async fn ack(&self, run_id: RunId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM work_queue WHERE run_id = $1")
            .bind(run_id.to_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| queue_error("ack", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_expired_leases(&self, now: DateTime<Utc>) -> Result<u64> {
        let expired: Vec<(Uuid, i32)> = sqlx::query_as(
            r#"
            SELECT run_id, attempts
            FROM work_queue
            WHERE state = 'leased'
              AND lease_expires_at IS NOT NULL
              AND lease_expires_at < $1
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| queue_error("lease expiry scan", e))?;

        let max_deliveries = i32::from(self.retry.max_attempts());
        let mut released = 0u64;

        for (run_id, attempts) in expired {
            let attempt_next = attempts.saturating_add(1);
            if attempt_next >= max_deliveries {
                warn!(%run_id, attempts, "lease expired too many times; dropping job");
                sqlx::query(
                    "DELETE FROM work_queue WHERE run_id = $1 AND state = 'leased'",
                )
                .bind(run_id)
                .execute(&self.pool)
                .await
                .map_err(|e| queue_error("lease drop", e))?;
                continue;
            }

            let delay = self
                .retry
                .delay_for(RunId::from(run_id), attempt_next.max(0) as u16);
            let available_at =
                now + Duration::from_std(delay).unwrap_or(Duration::zero());
            let result = sqlx::query(
                r#"
                UPDATE work_queue
                SET attempts = attempts + 1,
                    state = 'ready',
                    lease_owner = NULL,
                    lease_expires_at = NULL,
                    available_at = $2,
                    updated_at = $3
                WHERE run_id = $1 AND state = 'leased'
                "#,
            )
            .bind(run_id)
            .bind(available_at)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| queue_error("lease resurrection", e))?;
            released += result.rows_affected();
        }

        Ok(released)
    }
}
