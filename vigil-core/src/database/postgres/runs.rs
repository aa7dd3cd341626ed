use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, QueryBuilder, types::Json};
use tracing::{debug, instrument};
use uuid::Uuid;
use vigil_model::{
    OwnerId, Page, PageRequest, PolicyId, PolicyKind, PolicyStatus, Run,
    RunError, RunId, RunStatus, RunSummary,
};

use super::{
    PostgresStore, applied, push_page,
    rows::{CountRow, RUN_COLUMNS, RunRow, parse_counts},
};
use crate::{
    database::{
        next_revision,
        ports::{
            ClaimOutcome, ClaimRequest, RunFilter, RunRepository,
            RunTransition, TimeoutCutoffs,
        },
        storage_time,
    },
    error::Result,
};

fn push_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &RunFilter) {
    builder.push(" WHERE 1=1");
    if let Some(owner) = filter.owner {
        builder.push(" AND owner_id = ");
        builder.push_bind(owner.to_uuid());
    }
    if let Some(policy_id) = filter.policy_id {
        builder.push(" AND policy_id = ");
        builder.push_bind(policy_id.to_uuid());
    }
    if let Some(status) = filter.status {
        builder.push(" AND status = ");
        builder.push_bind(status.as_str());
    }
}

#[async_trait]
impl RunRepository for PostgresStore {
    #[instrument(skip(self, request), fields(policy_id = %request.policy_id, run_id = %request.run.id), err)]
    async fn claim_dispatch(
        &self,
        request: ClaimRequest,
    ) -> Result<ClaimOutcome> {
        let mut tx = self.pool.begin().await?;

        // Serialises claimers of the same policy for the rest of the tx.
        let locked: Option<(String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT status, updated_at FROM policies WHERE id = $1 FOR UPDATE",
        )
        .bind(request.policy_id.to_uuid())
        .fetch_optional(&mut *tx)
        .await?;

        let Some((status, updated_at)) = locked else {
            return Ok(ClaimOutcome::Stale);
        };
        if status != PolicyStatus::Active.as_str()
            || updated_at != request.expected_updated_at
        {
            debug!("policy changed since it was read; abandoning claim");
            return Ok(ClaimOutcome::Stale);
        }

        let run = &request.run;
        let inserted = sqlx::query(
            r#"
            INSERT INTO runs (
                id, policy_id, owner_id, kind, status, created_at,
                started_at, finished_at, summary, payload, reconciled_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, NULL, NULL, $7, NULL, NULL)
            ON CONFLICT (policy_id) WHERE status IN ('QUEUED', 'RUNNING')
            DO NOTHING
            "#,
        )
        .bind(run.id.to_uuid())
        .bind(run.policy_id.to_uuid())
        .bind(run.owner.to_uuid())
        .bind(run.kind.as_str())
        .bind(run.status.as_str())
        .bind(run.created_at)
        .bind(Json(&run.summary))
        .execute(&mut *tx)
        .await?;

        if !applied(inserted) {
            return Ok(ClaimOutcome::AlreadyInFlight);
        }

        sqlx::query(
            r#"
            UPDATE policies
            SET last_run_at = $2,
                next_run_at = $3,
                trigger_requested_at = NULL,
                updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(request.policy_id.to_uuid())
        .bind(request.now)
        .bind(request.next_run_at)
        .bind(next_revision(updated_at, request.now))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(ClaimOutcome::Claimed(request.run))
    }

    #[instrument(skip(self, error), err)]
    async fn fail_dispatch(
        &self,
        run_id: RunId,
        error: RunError,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let policy_id: Option<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE runs
            SET status = $3, finished_at = $4, summary = $5
            WHERE id = $1 AND status = $2
            RETURNING policy_id
            "#,
        )
        .bind(run_id.to_uuid())
        .bind(RunStatus::Queued.as_str())
        .bind(RunStatus::Failed.as_str())
        .bind(now)
        .bind(Json(RunSummary::failed(error)))
        .fetch_optional(&mut *tx)
        .await?;

        let Some(policy_id) = policy_id else {
            return Ok(false);
        };

        sqlx::query(
            r#"
            UPDATE policies
            SET trigger_requested_at = $2,
                next_run_at = LEAST(COALESCE(next_run_at, $2), $2),
                updated_at = GREATEST($3, updated_at + INTERVAL '1 microsecond')
            WHERE id = $1
            "#,
        )
        .bind(policy_id)
        .bind(now)
        .bind(storage_time(now))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn get_run(&self, id: RunId) -> Result<Option<Run>> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE id = $1"
        ))
        .bind(id.to_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Run::try_from).transpose()
    }

    #[instrument(skip(self, transition), fields(run_id = %transition.run_id, from = %transition.from, to = %transition.to), err)]
    async fn transition_run(
        &self,
        transition: RunTransition,
    ) -> Result<Option<Run>> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            r#"
            UPDATE runs
            SET status = $3,
                started_at = CASE WHEN $5::boolean THEN $4 ELSE started_at END,
                finished_at = CASE WHEN $6::boolean THEN $4 ELSE finished_at END,
                summary = COALESCE($7, summary),
                payload = COALESCE($8, payload)
            WHERE id = $1 AND status = $2
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(transition.run_id.to_uuid())
        .bind(transition.from.as_str())
        .bind(transition.to.as_str())
        .bind(transition.at)
        .bind(transition.to == RunStatus::Running)
        .bind(transition.to.is_terminal())
        .bind(transition.summary.map(Json))
        .bind(transition.payload.map(Json))
        .fetch_optional(&self.pool)
        .await?;
        row.map(Run::try_from).transpose()
    }

    async fn expired_runs(
        &self,
        cutoffs: TimeoutCutoffs,
        limit: usize,
    ) -> Result<Vec<Run>> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            r#"
            SELECT {RUN_COLUMNS}
            FROM runs
            WHERE (status = $1 AND created_at < $3)
               OR (status = $2 AND kind = $4
                   AND COALESCE(started_at, created_at) < $5)
               OR (status = $2 AND kind = $6
                   AND COALESCE(started_at, created_at) < $7)
            ORDER BY created_at ASC
            LIMIT $8
            "#
        ))
        .bind(RunStatus::Queued.as_str())
        .bind(RunStatus::Running.as_str())
        .bind(cutoffs.queued_before)
        .bind(PolicyKind::Discovery.as_str())
        .bind(cutoffs.discovery_started_before)
        .bind(PolicyKind::Scan.as_str())
        .bind(cutoffs.scan_started_before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Run::try_from).collect()
    }

    async fn list_runs(
        &self,
        filter: &RunFilter,
        page: PageRequest,
    ) -> Result<Page<Run>> {
        let mut count =
            QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM runs");
        push_filter(&mut count, filter);
        let total = count
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await?;

        let mut builder =
            QueryBuilder::<Postgres>::new(format!("SELECT {RUN_COLUMNS} FROM runs"));
        push_filter(&mut builder, filter);
        builder.push(" ORDER BY created_at DESC, id DESC");
        push_page(&mut builder, page);

        let rows = builder
            .build_query_as::<RunRow>()
            .fetch_all(&self.pool)
            .await?;
        let items = rows
            .into_iter()
            .map(Run::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(Page::new(items, total.max(0) as u64, page))
    }

    async fn recent_succeeded_runs(
        &self,
        policy_id: PolicyId,
        limit: usize,
    ) -> Result<Vec<RunId>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id
            FROM runs
            WHERE policy_id = $1 AND status = $2
            ORDER BY finished_at DESC NULLS LAST, created_at DESC
            LIMIT $3
            "#,
        )
        .bind(policy_id.to_uuid())
        .bind(RunStatus::Succeeded.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(RunId::from).collect())
    }

    async fn unreconciled_runs(&self, limit: usize) -> Result<Vec<Run>> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            r#"
            SELECT {RUN_COLUMNS}
            FROM runs
            WHERE status = $1 AND reconciled_at IS NULL
            ORDER BY finished_at ASC
            LIMIT $2
            "#
        ))
        .bind(RunStatus::Succeeded.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Run::try_from).collect()
    }

    async fn mark_reconciled(
        &self,
        run_id: RunId,
        summary: &RunSummary,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET summary = $2, reconciled_at = $3
            WHERE id = $1 AND reconciled_at IS NULL
            "#,
        )
        .bind(run_id.to_uuid())
        .bind(Json(summary))
        .bind(at)
        .execute(&self.pool)
        .await?;
        if applied(result) {
            return Ok(true);
        }
        match self.get_run(run_id).await? {
            Some(_) => Ok(false),
            None => Err(crate::error::VigilError::not_found("run", run_id)),
        }
    }

    async fn run_status_counts(
        &self,
        owner: OwnerId,
    ) -> Result<Vec<(RunStatus, u64)>> {
        let rows = sqlx::query_as::<_, CountRow>(
            r#"
            SELECT status AS label, COUNT(*) AS count
            FROM runs
            WHERE owner_id = $1
            GROUP BY status
            "#,
        )
        .bind(owner.to_uuid())
        .fetch_all(&self.pool)
        .await?;
        parse_counts("status", rows)
    }

    async fn last_run_at(
        &self,
        owner: OwnerId,
    ) -> Result<Option<DateTime<Utc>>> {
        let last: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT MAX(created_at) FROM runs WHERE owner_id = $1",
        )
        .bind(owner.to_uuid())
        .fetch_one(&self.pool)
        .await?;
        Ok(last)
    }
}
