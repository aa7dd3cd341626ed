use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, QueryBuilder, types::Json};
use tracing::instrument;
use vigil_model::{
    OwnerId, Page, PageRequest, Policy, PolicyId, PolicyStatus, RunStatus,
};

use super::{
    PostgresStore, applied, push_page,
    rows::{CountRow, POLICY_COLUMNS, PolicyRow, parse_counts},
};
use crate::{
    database::ports::{PolicyFilter, PolicyRepository},
    error::{Result, VigilError},
};

fn push_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &PolicyFilter) {
    builder.push(" WHERE 1=1");
    if let Some(owner) = filter.owner {
        builder.push(" AND owner_id = ");
        builder.push_bind(owner.to_uuid());
    }
    if let Some(status) = filter.status {
        builder.push(" AND status = ");
        builder.push_bind(status.as_str());
    }
    if let Some(kind) = filter.kind {
        builder.push(" AND kind = ");
        builder.push_bind(kind.as_str());
    }
}

#[async_trait]
impl PolicyRepository for PostgresStore {
    #[instrument(skip(self, policy), fields(policy_id = %policy.id), err)]
    async fn insert_policy(&self, policy: &Policy) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO policies (
                id, owner_id, name, kind, spec, targets, intensity,
                schedule_type, schedule_value, status, last_run_at,
                next_run_at, trigger_requested_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(policy.id.to_uuid())
        .bind(policy.owner.to_uuid())
        .bind(&policy.name)
        .bind(policy.kind().as_str())
        .bind(Json(&policy.spec))
        .bind(Json(&policy.targets))
        .bind(policy.intensity.as_str())
        .bind(policy.schedule.schedule_type.as_str())
        .bind(policy.schedule.value.as_deref())
        .bind(policy.status.as_str())
        .bind(policy.last_run_at)
        .bind(policy.next_run_at)
        .bind(policy.trigger_requested_at)
        .bind(policy.created_at)
        .bind(policy.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err))
                if db_err.code().as_deref() == Some("23505") =>
            {
                Err(VigilError::Conflict(format!(
                    "policy {} already exists",
                    policy.id
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_policy(&self, id: PolicyId) -> Result<Option<Policy>> {
        let row = sqlx::query_as::<_, PolicyRow>(&format!(
            "SELECT {POLICY_COLUMNS} FROM policies WHERE id = $1"
        ))
        .bind(id.to_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Policy::try_from).transpose()
    }

    #[instrument(skip(self, policy), fields(policy_id = %policy.id), err)]
    async fn update_policy(
        &self,
        policy: &Policy,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE policies
            SET name = $3,
                spec = $4,
                targets = $5,
                intensity = $6,
                schedule_type = $7,
                schedule_value = $8,
                status = $9,
                last_run_at = $10,
                next_run_at = $11,
                trigger_requested_at = $12,
                updated_at = $13
            WHERE id = $1 AND updated_at = $2
            "#,
        )
        .bind(policy.id.to_uuid())
        .bind(expected_updated_at)
        .bind(&policy.name)
        .bind(Json(&policy.spec))
        .bind(Json(&policy.targets))
        .bind(policy.intensity.as_str())
        .bind(policy.schedule.schedule_type.as_str())
        .bind(policy.schedule.value.as_deref())
        .bind(policy.status.as_str())
        .bind(policy.last_run_at)
        .bind(policy.next_run_at)
        .bind(policy.trigger_requested_at)
        .bind(policy.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(applied(result))
    }

    async fn delete_policy(&self, id: PolicyId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM policies WHERE id = $1")
            .bind(id.to_uuid())
            .execute(&self.pool)
            .await?;
        Ok(applied(result))
    }

    async fn list_policies(
        &self,
        filter: &PolicyFilter,
        page: PageRequest,
    ) -> Result<Page<Policy>> {
        let mut count = QueryBuilder::<Postgres>::new(
            "SELECT COUNT(*) FROM policies",
        );
        push_filter(&mut count, filter);
        let total = count
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await?;

        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "SELECT {POLICY_COLUMNS} FROM policies"
        ));
        push_filter(&mut builder, filter);
        builder.push(" ORDER BY created_at DESC, id DESC");
        push_page(&mut builder, page);

        let rows = builder
            .build_query_as::<PolicyRow>()
            .fetch_all(&self.pool)
            .await?;
        let items = rows
            .into_iter()
            .map(Policy::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(Page::new(items, total.max(0) as u64, page))
    }

    async fn due_policies(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Policy>> {
        let rows = sqlx::query_as::<_, PolicyRow>(&format!(
            r#"
            SELECT {POLICY_COLUMNS}
            FROM policies p
            WHERE p.status = $1
              AND p.next_run_at IS NOT NULL
              AND p.next_run_at <= $2
              AND NOT EXISTS (
                  SELECT 1 FROM runs r
                  WHERE r.policy_id = p.id
                    AND r.status IN ($3, $4)
              )
            ORDER BY p.next_run_at ASC, p.created_at ASC
            LIMIT $5
            "#
        ))
        .bind(PolicyStatus::Active.as_str())
        .bind(now)
        .bind(RunStatus::Queued.as_str())
        .bind(RunStatus::Running.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Policy::try_from).collect()
    }

    async fn policy_status_counts(
        &self,
        owner: OwnerId,
    ) -> Result<Vec<(PolicyStatus, u64)>> {
        let rows = sqlx::query_as::<_, CountRow>(
            r#"
            SELECT status AS label, COUNT(*) AS count
            FROM policies
            WHERE owner_id = $1
            GROUP BY status
            "#,
        )
        .bind(owner.to_uuid())
        .fetch_all(&self.pool)
        .await?;
        parse_counts("status", rows)
    }
}
