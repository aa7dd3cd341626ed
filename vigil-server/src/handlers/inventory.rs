use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use vigil_core::services::{AssetQuery, CreateAsset, FindingQuery, UpdateAsset};
use vigil_model::{Asset, AssetId, Finding, Page, PageRequest};

use crate::{
    api::ApiResponse, errors::AppResult, infra::app_state::AppState,
    infra::owner::Owner,
};

pub async fn create_asset(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Json(request): Json<CreateAsset>,
) -> AppResult<(StatusCode, Json<ApiResponse<Asset>>)> {
    let asset = state.inventory.create_asset(owner, request).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(asset))))
}

pub async fn list_assets(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Query(query): Query<AssetQuery>,
    Query(page): Query<PageRequest>,
) -> AppResult<Json<ApiResponse<Page<Asset>>>> {
    let page = state.inventory.list_assets(owner, query, page).await?;
    Ok(Json(ApiResponse::success(page)))
}

pub async fn get_asset(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(id): Path<AssetId>,
) -> AppResult<Json<ApiResponse<Asset>>> {
    let asset = state.inventory.get_asset(owner, id).await?;
    Ok(Json(ApiResponse::success(asset)))
}

pub async fn update_asset(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(id): Path<AssetId>,
    Json(request): Json<UpdateAsset>,
) -> AppResult<Json<ApiResponse<Asset>>> {
    let asset = state.inventory.update_asset(owner, id, request).await?;
    Ok(Json(ApiResponse::success(asset)))
}

pub async fn delete_asset(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(id): Path<AssetId>,
) -> AppResult<StatusCode> {
    state.inventory.delete_asset(owner, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_findings(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Query(query): Query<FindingQuery>,
    Query(page): Query<PageRequest>,
) -> AppResult<Json<ApiResponse<Page<Finding>>>> {
    let page = state.inventory.list_findings(owner, query, page).await?;
    Ok(Json(ApiResponse::success(page)))
}
