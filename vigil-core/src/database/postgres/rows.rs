//! Row shapes returned by the Postgres adapter and their conversion into
//! model records. Enum columns are stored as their wire literals.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, types::Json};
use uuid::Uuid;
use vigil_model::{
    Asset, Finding, JobMessage, Policy, PolicySpec, Run, RunPayload,
    RunSummary, ScheduleDescriptor, TargetSelection,
};

use crate::error::{Result, VigilError};

pub(super) fn parse_column<T>(column: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e| {
        VigilError::Storage(format!("corrupt {column} column: {e}"))
    })
}

pub(super) const POLICY_COLUMNS: &str = r#"
    id, owner_id, name, kind, spec, targets, intensity, schedule_type,
    schedule_value, status, last_run_at, next_run_at, trigger_requested_at,
    created_at, updated_at
"#;

#[derive(Debug, FromRow)]
pub(super) struct PolicyRow {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub kind: String,
    pub spec: Json<PolicySpec>,
    pub targets: Json<TargetSelection>,
    pub intensity: String,
    pub schedule_type: String,
    pub schedule_value: Option<String>,
    pub status: String,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub trigger_requested_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<PolicyRow> for Policy {
    type Error = VigilError;

    fn try_from(row: PolicyRow) -> Result<Self> {
        let spec = row.spec.0;
        let kind: vigil_model::PolicyKind = parse_column("kind", &row.kind)?;
        if spec.kind() != kind {
            return Err(VigilError::Storage(format!(
                "policy {} kind {} disagrees with its spec",
                row.id, row.kind
            )));
        }
        Ok(Policy {
            id: row.id.into(),
            owner: row.owner_id.into(),
            name: row.name,
            spec,
            targets: row.targets.0,
            intensity: parse_column("intensity", &row.intensity)?,
            schedule: ScheduleDescriptor {
                schedule_type: parse_column(
                    "schedule_type",
                    &row.schedule_type,
                )?,
                value: row.schedule_value,
            },
            status: parse_column("status", &row.status)?,
            last_run_at: row.last_run_at,
            next_run_at: row.next_run_at,
            trigger_requested_at: row.trigger_requested_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

pub(super) const RUN_COLUMNS: &str = r#"
    id, policy_id, owner_id, kind, status, created_at, started_at,
    finished_at, summary, payload, reconciled_at
"#;

#[derive(Debug, FromRow)]
pub(super) struct RunRow {
    pub id: Uuid,
    pub policy_id: Uuid,
    pub owner_id: Uuid,
    pub kind: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub summary: Json<RunSummary>,
    pub payload: Option<Json<RunPayload>>,
    pub reconciled_at: Option<DateTime<Utc>>,
}

impl TryFrom<RunRow> for Run {
    type Error = VigilError;

    fn try_from(row: RunRow) -> Result<Self> {
        Ok(Run {
            id: row.id.into(),
            policy_id: row.policy_id.into(),
            owner: row.owner_id.into(),
            kind: parse_column("kind", &row.kind)?,
            status: parse_column("status", &row.status)?,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            summary: row.summary.0,
            payload: row.payload.map(|p| p.0),
            reconciled_at: row.reconciled_at,
        })
    }
}

pub(super) const ASSET_COLUMNS: &str = r#"
    id, owner_id, name, asset_type, identifier, exposure, risk_score, tags,
    status, description, discovered_by, last_seen_run, first_seen, last_seen,
    created_at, updated_at
"#;

#[derive(Debug, FromRow)]
pub(super) struct AssetRow {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub asset_type: String,
    pub identifier: String,
    pub exposure: String,
    pub risk_score: i16,
    pub tags: Vec<String>,
    pub status: String,
    pub description: Option<String>,
    pub discovered_by: Option<Uuid>,
    pub last_seen_run: Option<Uuid>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<AssetRow> for Asset {
    type Error = VigilError;

    fn try_from(row: AssetRow) -> Result<Self> {
        Ok(Asset {
            id: row.id.into(),
            owner: row.owner_id.into(),
            name: row.name,
            asset_type: parse_column("asset_type", &row.asset_type)?,
            identifier: row.identifier,
            exposure: parse_column("exposure", &row.exposure)?,
            risk_score: row.risk_score.clamp(0, 100) as u8,
            tags: row.tags.into_iter().collect(),
            status: parse_column("status", &row.status)?,
            description: row.description,
            discovered_by: row.discovered_by.map(Into::into),
            last_seen_run: row.last_seen_run.map(Into::into),
            first_seen: row.first_seen,
            last_seen: row.last_seen,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

pub(super) const FINDING_COLUMNS: &str = r#"
    id, owner_id, run_id, policy_id, asset_id, severity, dedupe_key, title,
    remediation, discovered_at, last_seen, last_seen_run, resolved_at
"#;

#[derive(Debug, FromRow)]
pub(super) struct FindingRow {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub run_id: Uuid,
    pub policy_id: Uuid,
    pub asset_id: Option<Uuid>,
    pub severity: String,
    pub dedupe_key: String,
    pub title: String,
    pub remediation: Option<String>,
    pub discovered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub last_seen_run: Uuid,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl TryFrom<FindingRow> for Finding {
    type Error = VigilError;

    fn try_from(row: FindingRow) -> Result<Self> {
        Ok(Finding {
            id: row.id.into(),
            owner: row.owner_id.into(),
            run_id: row.run_id.into(),
            policy_id: row.policy_id.into(),
            asset_id: row.asset_id.map(Into::into),
            severity: parse_column("severity", &row.severity)?,
            dedupe_key: row.dedupe_key,
            title: row.title,
            remediation: row.remediation,
            discovered_at: row.discovered_at,
            last_seen: row.last_seen,
            last_seen_run: row.last_seen_run.into(),
            resolved_at: row.resolved_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct QueueRow {
    pub payload: Json<JobMessage>,
    pub attempts: i32,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

/// `(label, count)` pairs from `GROUP BY` queries.
#[derive(Debug, FromRow)]
pub(super) struct CountRow {
    pub label: String,
    pub count: i64,
}

pub(super) fn parse_counts<T>(column: &str, rows: Vec<CountRow>) -> Result<Vec<(T, u64)>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    rows.into_iter()
        .map(|row| {
            Ok((parse_column(column, &row.label)?, row.count.max(0) as u64))
        })
        .collect()
}
