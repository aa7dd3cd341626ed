use axum::{
    Json,
    extract::{Path, Query, State},
};
use vigil_core::{orchestration::WorkerFailure, services::RunQuery};
use vigil_model::{Page, PageRequest, Run, RunId, RunPayload};

use crate::{
    api::ApiResponse, errors::AppResult, infra::app_state::AppState,
    infra::owner::Owner,
};

pub async fn list_runs(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Query(query): Query<RunQuery>,
    Query(page): Query<PageRequest>,
) -> AppResult<Json<ApiResponse<Page<Run>>>> {
    let page = state.runs.list_runs(owner, query, page).await?;
    Ok(Json(ApiResponse::success(page)))
}

pub async fn get_run(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(id): Path<RunId>,
) -> AppResult<Json<ApiResponse<Run>>> {
    let run = state.runs.get_run(owner, id).await?;
    Ok(Json(ApiResponse::success(run)))
}

// Worker callbacks. Workers address runs by the id carried in the job
// message and are not owner-scoped.

pub async fn start_run(
    State(state): State<AppState>,
    Path(id): Path<RunId>,
) -> AppResult<Json<ApiResponse<Run>>> {
    let run = state.runtime.tracker().mark_running(id).await?;
    Ok(Json(ApiResponse::success(run)))
}

pub async fn succeed_run(
    State(state): State<AppState>,
    Path(id): Path<RunId>,
    Json(payload): Json<RunPayload>,
) -> AppResult<Json<ApiResponse<Run>>> {
    let run = state.runtime.tracker().mark_succeeded(id, payload).await?;
    Ok(Json(ApiResponse::success(run)))
}

pub async fn fail_run(
    State(state): State<AppState>,
    Path(id): Path<RunId>,
    Json(failure): Json<WorkerFailure>,
) -> AppResult<Json<ApiResponse<Run>>> {
    let run = state.runtime.tracker().mark_failed(id, failure).await?;
    Ok(Json(ApiResponse::success(run)))
}
