use axum::{Json, extract::State};
use vigil_core::services::Dashboard;

use crate::{
    api::ApiResponse, errors::AppResult, infra::app_state::AppState,
    infra::owner::Owner,
};

pub async fn get_dashboard(
    State(state): State<AppState>,
    Owner(owner): Owner,
) -> AppResult<Json<ApiResponse<Dashboard>>> {
    let dashboard = state.dashboard.dashboard(owner).await?;
    Ok(Json(ApiResponse::success(dashboard)))
}
