use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use vigil_core::orchestration::{LeaseRequest, LeasedJob};
use vigil_model::JobMessage;

use crate::{
    api::ApiResponse,
    errors::{AppError, AppResult},
    infra::app_state::AppState,
};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LeaseBody {
    pub worker_id: String,
    /// Overrides the configured lease TTL.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LeasedJobBody {
    pub job: JobMessage,
    pub lease_owner: String,
    pub expires_at: DateTime<Utc>,
    pub attempts: u32,
}

impl From<LeasedJob> for LeasedJobBody {
    fn from(leased: LeasedJob) -> Self {
        Self {
            job: leased.job,
            lease_owner: leased.lease_owner,
            expires_at: leased.expires_at,
            attempts: leased.attempts,
        }
    }
}

/// Hands the next ready job to a worker, or `204 No Content` when the
/// queue is empty.
pub async fn lease_job(
    State(state): State<AppState>,
    Json(body): Json<LeaseBody>,
) -> AppResult<Response> {
    let worker_id = body.worker_id.trim();
    if worker_id.is_empty() {
        return Err(AppError::bad_request("worker_id must not be empty"));
    }
    let ttl = match body.ttl_secs {
        Some(secs) => i64::try_from(secs)
            .ok()
            .and_then(Duration::try_seconds)
            .filter(|ttl| *ttl > Duration::zero())
            .ok_or_else(|| AppError::bad_request("ttl_secs out of range"))?,
        None => state.runtime.config().lease.ttl(),
    };

    let leased = state
        .runtime
        .queue()
        .lease(LeaseRequest {
            worker_id: worker_id.to_string(),
            ttl,
            now: Utc::now(),
        })
        .await?;

    match leased {
        Some(leased) => {
            debug!(run_id = %leased.job.run_id, worker_id, "job leased");
            Ok(Json(ApiResponse::success(LeasedJobBody::from(leased)))
                .into_response())
        }
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}
