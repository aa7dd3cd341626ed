use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use tracing::info;
use vigil_core::services::{CreatePolicy, PolicyQuery, UpdatePolicy};
use vigil_model::{Page, PageRequest, Policy, PolicyId};

use crate::{
    api::ApiResponse, errors::AppResult, infra::app_state::AppState,
    infra::owner::Owner,
};

pub async fn create_policy(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Json(request): Json<CreatePolicy>,
) -> AppResult<(StatusCode, Json<ApiResponse<Policy>>)> {
    let policy = state.policies.create_policy(owner, request).await?;
    info!(policy_id = %policy.id, status = %policy.status, "policy created");
    Ok((StatusCode::CREATED, Json(ApiResponse::success(policy))))
}

pub async fn list_policies(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Query(query): Query<PolicyQuery>,
    Query(page): Query<PageRequest>,
) -> AppResult<Json<ApiResponse<Page<Policy>>>> {
    let page = state.policies.list_policies(owner, query, page).await?;
    Ok(Json(ApiResponse::success(page)))
}

pub async fn get_policy(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(id): Path<PolicyId>,
) -> AppResult<Json<ApiResponse<Policy>>> {
    let policy = state.policies.get_policy(owner, id).await?;
    Ok(Json(ApiResponse::success(policy)))
}

pub async fn update_policy(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(id): Path<PolicyId>,
    Json(request): Json<UpdatePolicy>,
) -> AppResult<Json<ApiResponse<Policy>>> {
    let policy = state.policies.update_policy(owner, id, request).await?;
    Ok(Json(ApiResponse::success(policy)))
}

/// Manual retest: the policy becomes due on the next orchestration cycle.
pub async fn trigger_policy(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(id): Path<PolicyId>,
) -> AppResult<(StatusCode, Json<ApiResponse<Policy>>)> {
    let policy = state.policies.trigger_policy(owner, id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::success(policy).with_message("run requested")),
    ))
}

pub async fn delete_policy(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(id): Path<PolicyId>,
) -> AppResult<StatusCode> {
    state.policies.delete_policy(owner, id).await?;
    info!(policy_id = %id, "policy deleted");
    Ok(StatusCode::NO_CONTENT)
}
