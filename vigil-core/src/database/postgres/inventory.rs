use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, Postgres, QueryBuilder};
use tracing::instrument;
use uuid::Uuid;
use vigil_model::{
    Asset, AssetId, AssetStatus, AssetType, Finding, FindingId, OwnerId, Page,
    PageRequest, PolicyId, RunId, Severity,
};

use super::{
    PostgresStore, applied, push_page,
    rows::{
        ASSET_COLUMNS, AssetRow, CountRow, FINDING_COLUMNS, FindingRow,
        parse_column, parse_counts,
    },
};
use crate::{
    database::{
        merge::{
            asset_from_observation, finding_from_observation, merge_asset,
            merge_finding,
        },
        ports::{
            AssetFilter, AssetObservation, AssetUpsert, FindingFilter,
            FindingObservation, FindingUpsert, InventoryRepository,
            RiskTotals,
        },
    },
    error::{Result, VigilError},
};

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn natural_key_conflict(asset: &Asset) -> VigilError {
    VigilError::Conflict(format!(
        "{} asset {} already exists",
        asset.asset_type, asset.identifier
    ))
}

fn escape_like(raw: &str) -> String {
    raw.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn push_asset_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &AssetFilter) {
    builder.push(" WHERE 1=1");
    if let Some(owner) = filter.owner {
        builder.push(" AND owner_id = ");
        builder.push_bind(owner.to_uuid());
    }
    if let Some(q) = filter.q.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
        let pattern = format!("%{}%", escape_like(q));
        builder.push(" AND (name ILIKE ");
        builder.push_bind(pattern.clone());
        builder.push(" OR identifier ILIKE ");
        builder.push_bind(pattern);
        builder.push(")");
    }
    if let Some(asset_type) = filter.asset_type {
        builder.push(" AND asset_type = ");
        builder.push_bind(asset_type.as_str());
    }
    if let Some(exposure) = filter.exposure {
        builder.push(" AND exposure = ");
        builder.push_bind(exposure.as_str());
    }
    if let Some(status) = filter.status {
        builder.push(" AND status = ");
        builder.push_bind(status.as_str());
    }
}

fn push_finding_filter(
    builder: &mut QueryBuilder<'_, Postgres>,
    filter: &FindingFilter,
) {
    builder.push(" WHERE 1=1");
    if let Some(owner) = filter.owner {
        builder.push(" AND owner_id = ");
        builder.push_bind(owner.to_uuid());
    }
    if let Some(asset_id) = filter.asset_id {
        builder.push(" AND asset_id = ");
        builder.push_bind(asset_id.to_uuid());
    }
    if filter.open_only {
        builder.push(" AND resolved_at IS NULL");
    }
}

fn run_uuids(runs: &[RunId]) -> Vec<Uuid> {
    runs.iter().map(RunId::to_uuid).collect()
}

async fn lock_asset_by_key(
    conn: &mut PgConnection,
    owner: OwnerId,
    asset_type: AssetType,
    identifier: &str,
) -> Result<Option<Asset>> {
    let row = sqlx::query_as::<_, AssetRow>(&format!(
        r#"
        SELECT {ASSET_COLUMNS}
        FROM assets
        WHERE owner_id = $1 AND asset_type = $2 AND identifier = $3
        FOR UPDATE
        "#
    ))
    .bind(owner.to_uuid())
    .bind(asset_type.as_str())
    .bind(identifier)
    .fetch_optional(conn)
    .await?;
    row.map(Asset::try_from).transpose()
}

/// Inserts unless the natural key is taken. `false` means another writer
/// got there first.
async fn try_insert_asset(conn: &mut PgConnection, asset: &Asset) -> Result<bool> {
    let tags: Vec<&str> = asset.tags.iter().map(String::as_str).collect();
    let result = sqlx::query(
        r#"
        INSERT INTO assets (
            id, owner_id, name, asset_type, identifier, exposure, risk_score,
            tags, status, description, discovered_by, last_seen_run,
            first_seen, last_seen, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        ON CONFLICT (owner_id, asset_type, identifier) DO NOTHING
        "#,
    )
    .bind(asset.id.to_uuid())
    .bind(asset.owner.to_uuid())
    .bind(&asset.name)
    .bind(asset.asset_type.as_str())
    .bind(&asset.identifier)
    .bind(asset.exposure.as_str())
    .bind(i16::from(asset.risk_score))
    .bind(tags)
    .bind(asset.status.as_str())
    .bind(asset.description.as_deref())
    .bind(asset.discovered_by.map(|p| p.to_uuid()))
    .bind(asset.last_seen_run.map(|r| r.to_uuid()))
    .bind(asset.first_seen)
    .bind(asset.last_seen)
    .bind(asset.created_at)
    .bind(asset.updated_at)
    .execute(conn)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            natural_key_conflict(asset)
        } else {
            e.into()
        }
    })?;
    Ok(applied(result))
}

async fn write_asset(conn: &mut PgConnection, asset: &Asset) -> Result<bool> {
    let tags: Vec<&str> = asset.tags.iter().map(String::as_str).collect();
    let result = sqlx::query(
        r#"
        UPDATE assets
        SET name = $2,
            asset_type = $3,
            identifier = $4,
            exposure = $5,
            risk_score = $6,
            tags = $7,
            status = $8,
            description = $9,
            discovered_by = $10,
            last_seen_run = $11,
            first_seen = $12,
            last_seen = $13,
            updated_at = $14
        WHERE id = $1
        "#,
    )
    .bind(asset.id.to_uuid())
    .bind(&asset.name)
    .bind(asset.asset_type.as_str())
    .bind(&asset.identifier)
    .bind(asset.exposure.as_str())
    .bind(i16::from(asset.risk_score))
    .bind(tags)
    .bind(asset.status.as_str())
    .bind(asset.description.as_deref())
    .bind(asset.discovered_by.map(|p| p.to_uuid()))
    .bind(asset.last_seen_run.map(|r| r.to_uuid()))
    .bind(asset.first_seen)
    .bind(asset.last_seen)
    .bind(asset.updated_at)
    .execute(conn)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            natural_key_conflict(asset)
        } else {
            e.into()
        }
    })?;
    Ok(applied(result))
}

async fn lock_finding_by_key(
    conn: &mut PgConnection,
    owner: OwnerId,
    dedupe_key: &str,
) -> Result<Option<Finding>> {
    let row = sqlx::query_as::<_, FindingRow>(&format!(
        r#"
        SELECT {FINDING_COLUMNS}
        FROM findings
        WHERE owner_id = $1 AND dedupe_key = $2
        FOR UPDATE
        "#
    ))
    .bind(owner.to_uuid())
    .bind(dedupe_key)
    .fetch_optional(conn)
    .await?;
    row.map(Finding::try_from).transpose()
}

async fn try_insert_finding(
    conn: &mut PgConnection,
    finding: &Finding,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO findings (
            id, owner_id, run_id, policy_id, asset_id, severity, dedupe_key,
            title, remediation, discovered_at, last_seen, last_seen_run,
            resolved_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        ON CONFLICT (owner_id, dedupe_key) DO NOTHING
        "#,
    )
    .bind(finding.id.to_uuid())
    .bind(finding.owner.to_uuid())
    .bind(finding.run_id.to_uuid())
    .bind(finding.policy_id.to_uuid())
    .bind(finding.asset_id.map(|a| a.to_uuid()))
    .bind(finding.severity.as_str())
    .bind(&finding.dedupe_key)
    .bind(&finding.title)
    .bind(finding.remediation.as_deref())
    .bind(finding.discovered_at)
    .bind(finding.last_seen)
    .bind(finding.last_seen_run.to_uuid())
    .bind(finding.resolved_at)
    .execute(conn)
    .await?;
    Ok(applied(result))
}

async fn write_finding(conn: &mut PgConnection, finding: &Finding) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE findings
        SET policy_id = $2,
            asset_id = $3,
            severity = $4,
            title = $5,
            remediation = $6,
            last_seen = $7,
            last_seen_run = $8,
            resolved_at = $9
        WHERE id = $1
        "#,
    )
    .bind(finding.id.to_uuid())
    .bind(finding.policy_id.to_uuid())
    .bind(finding.asset_id.map(|a| a.to_uuid()))
    .bind(finding.severity.as_str())
    .bind(&finding.title)
    .bind(finding.remediation.as_deref())
    .bind(finding.last_seen)
    .bind(finding.last_seen_run.to_uuid())
    .bind(finding.resolved_at)
    .execute(conn)
    .await?;
    Ok(())
}

#[async_trait]
impl InventoryRepository for PostgresStore {
    #[instrument(skip(self, asset), fields(asset_id = %asset.id), err)]
    async fn insert_asset(&self, asset: &Asset) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        if try_insert_asset(&mut conn, asset).await? {
            Ok(())
        } else {
            Err(natural_key_conflict(asset))
        }
    }

    async fn get_asset(&self, id: AssetId) -> Result<Option<Asset>> {
        let row = sqlx::query_as::<_, AssetRow>(&format!(
            "SELECT {ASSET_COLUMNS} FROM assets WHERE id = $1"
        ))
        .bind(id.to_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Asset::try_from).transpose()
    }

    async fn find_asset(
        &self,
        owner: OwnerId,
        asset_type: AssetType,
        identifier: &str,
    ) -> Result<Option<Asset>> {
        let row = sqlx::query_as::<_, AssetRow>(&format!(
            r#"
            SELECT {ASSET_COLUMNS}
            FROM assets
            WHERE owner_id = $1 AND asset_type = $2 AND identifier = $3
            "#
        ))
        .bind(owner.to_uuid())
        .bind(asset_type.as_str())
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Asset::try_from).transpose()
    }

    #[instrument(skip(self, asset), fields(asset_id = %asset.id), err)]
    async fn update_asset(&self, asset: &Asset) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        write_asset(&mut conn, asset).await
    }

    async fn delete_asset(&self, id: AssetId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM assets WHERE id = $1")
            .bind(id.to_uuid())
            .execute(&self.pool)
            .await?;
        Ok(applied(result))
    }

    async fn list_assets(
        &self,
        filter: &AssetFilter,
        page: PageRequest,
    ) -> Result<Page<Asset>> {
        let mut count =
            QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM assets");
        push_asset_filter(&mut count, filter);
        let total = count
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await?;

        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "SELECT {ASSET_COLUMNS} FROM assets"
        ));
        push_asset_filter(&mut builder, filter);
        builder.push(" ORDER BY created_at DESC, id DESC");
        push_page(&mut builder, page);

        let rows = builder
            .build_query_as::<AssetRow>()
            .fetch_all(&self.pool)
            .await?;
        let items = rows
            .into_iter()
            .map(Asset::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(Page::new(items, total.max(0) as u64, page))
    }

    #[instrument(skip(self, observation), fields(run_id = %observation.run_id, identifier = %observation.descriptor.identifier), err)]
    async fn upsert_observed_asset(
        &self,
        observation: &AssetObservation,
    ) -> Result<AssetUpsert> {
        let descriptor = &observation.descriptor;
        let mut tx = self.pool.begin().await?;

        let mut existing = lock_asset_by_key(
            &mut tx,
            observation.owner,
            descriptor.asset_type,
            &descriptor.identifier,
        )
        .await?;

        if existing.is_none() {
            let fresh = asset_from_observation(observation);
            if try_insert_asset(&mut tx, &fresh).await? {
                tx.commit().await?;
                return Ok(AssetUpsert {
                    asset_id: fresh.id,
                    created: true,
                });
            }
            // Lost the insert race; merge into the winner instead.
            existing = lock_asset_by_key(
                &mut tx,
                observation.owner,
                descriptor.asset_type,
                &descriptor.identifier,
            )
            .await?;
        }

        let Some(mut asset) = existing else {
            return Err(VigilError::Storage(format!(
                "{} asset {} vanished during upsert",
                descriptor.asset_type, descriptor.identifier
            )));
        };
        merge_asset(&mut asset, observation);
        write_asset(&mut tx, &asset).await?;
        tx.commit().await?;
        Ok(AssetUpsert {
            asset_id: asset.id,
            created: false,
        })
    }

    async fn mark_stale_assets(
        &self,
        policy_id: PolicyId,
        keep_runs: &[RunId],
        at: DateTime<Utc>,
    ) -> Result<Vec<AssetId>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE assets
            SET status = $3, updated_at = GREATEST(updated_at, $5)
            WHERE discovered_by = $1
              AND status = $4
              AND last_seen < $5
              AND (last_seen_run IS NULL OR last_seen_run <> ALL($2))
            RETURNING id
            "#,
        )
        .bind(policy_id.to_uuid())
        .bind(run_uuids(keep_runs))
        .bind(AssetStatus::Stale.as_str())
        .bind(AssetStatus::Active.as_str())
        .bind(at)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(AssetId::from).collect())
    }

    #[instrument(skip(self, observation), fields(run_id = %observation.run_id, key = %observation.dedupe_key), err)]
    async fn upsert_finding(
        &self,
        observation: &FindingObservation,
    ) -> Result<FindingUpsert> {
        let mut tx = self.pool.begin().await?;

        let mut existing = lock_finding_by_key(
            &mut tx,
            observation.owner,
            &observation.dedupe_key,
        )
        .await?;

        if existing.is_none() {
            let fresh = finding_from_observation(observation);
            if try_insert_finding(&mut tx, &fresh).await? {
                tx.commit().await?;
                return Ok(FindingUpsert {
                    finding_id: fresh.id,
                    created: true,
                    asset_id: fresh.asset_id,
                    previous_asset_id: None,
                });
            }
            existing = lock_finding_by_key(
                &mut tx,
                observation.owner,
                &observation.dedupe_key,
            )
            .await?;
        }

        let Some(mut finding) = existing else {
            return Err(VigilError::Storage(format!(
                "finding {} vanished during upsert",
                observation.dedupe_key
            )));
        };
        let upsert = merge_finding(&mut finding, observation);
        write_finding(&mut tx, &finding).await?;
        tx.commit().await?;
        Ok(upsert)
    }

    async fn resolve_absent_findings(
        &self,
        policy_id: PolicyId,
        keep_runs: &[RunId],
        at: DateTime<Utc>,
    ) -> Result<Vec<(FindingId, Option<AssetId>)>> {
        let rows: Vec<(Uuid, Option<Uuid>)> = sqlx::query_as(
            r#"
            UPDATE findings
            SET resolved_at = $3
            WHERE policy_id = $1
              AND resolved_at IS NULL
              AND last_seen <= $3
              AND last_seen_run <> ALL($2)
            RETURNING id, asset_id
            "#,
        )
        .bind(policy_id.to_uuid())
        .bind(run_uuids(keep_runs))
        .bind(at)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, asset)| (id.into(), asset.map(Into::into)))
            .collect())
    }

    async fn open_finding_severities(
        &self,
        asset_id: AssetId,
    ) -> Result<Vec<Severity>> {
        let raw: Vec<String> = sqlx::query_scalar(
            "SELECT severity FROM findings WHERE asset_id = $1 AND resolved_at IS NULL",
        )
        .bind(asset_id.to_uuid())
        .fetch_all(&self.pool)
        .await?;
        raw.iter().map(|s| parse_column("severity", s)).collect()
    }

    async fn set_risk_score(
        &self,
        asset_id: AssetId,
        score: u8,
    ) -> Result<()> {
        sqlx::query("UPDATE assets SET risk_score = $2 WHERE id = $1")
            .bind(asset_id.to_uuid())
            .bind(i16::from(score.min(100)))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_findings(
        &self,
        filter: &FindingFilter,
        page: PageRequest,
    ) -> Result<Page<Finding>> {
        let mut count =
            QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM findings");
        push_finding_filter(&mut count, filter);
        let total = count
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await?;

        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "SELECT {FINDING_COLUMNS} FROM findings"
        ));
        push_finding_filter(&mut builder, filter);
        builder.push(" ORDER BY discovered_at DESC, id DESC");
        push_page(&mut builder, page);

        let rows = builder
            .build_query_as::<FindingRow>()
            .fetch_all(&self.pool)
            .await?;
        let items = rows
            .into_iter()
            .map(Finding::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(Page::new(items, total.max(0) as u64, page))
    }

    async fn open_findings_by_severity(
        &self,
        owner: OwnerId,
    ) -> Result<Vec<(Severity, u64)>> {
        let rows = sqlx::query_as::<_, CountRow>(
            r#"
            SELECT severity AS label, COUNT(*) AS count
            FROM findings
            WHERE owner_id = $1 AND resolved_at IS NULL
            GROUP BY severity
            "#,
        )
        .bind(owner.to_uuid())
        .fetch_all(&self.pool)
        .await?;
        parse_counts("severity", rows)
    }

    async fn active_risk_totals(&self, owner: OwnerId) -> Result<RiskTotals> {
        let (active, sum): (i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*), COALESCE(SUM(risk_score), 0)::BIGINT
            FROM assets
            WHERE owner_id = $1 AND status = $2
            "#,
        )
        .bind(owner.to_uuid())
        .bind(AssetStatus::Active.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(RiskTotals {
            active_assets: active.max(0) as u64,
            risk_sum: sum.max(0) as u64,
        })
    }
}
