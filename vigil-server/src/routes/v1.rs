use axum::{
    Router,
    routing::{get, post},
};

use crate::{
    handlers::{dashboard, inventory, policies, runs, worker},
    infra::app_state::AppState,
};

/// Create all v1 API routes
pub fn create_v1_router() -> Router<AppState> {
    Router::new()
        .merge(create_owner_routes())
        .merge(create_worker_routes())
}

/// Routes scoped to the owner named by the `x-vigil-owner` header.
fn create_owner_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/policies",
            get(policies::list_policies).post(policies::create_policy),
        )
        .route(
            "/policies/{id}",
            get(policies::get_policy)
                .patch(policies::update_policy)
                .delete(policies::delete_policy),
        )
        .route("/policies/{id}/trigger", post(policies::trigger_policy))
        .route("/runs", get(runs::list_runs))
        .route("/runs/{id}", get(runs::get_run))
        .route(
            "/assets",
            get(inventory::list_assets).post(inventory::create_asset),
        )
        .route(
            "/assets/{id}",
            get(inventory::get_asset)
                .patch(inventory::update_asset)
                .delete(inventory::delete_asset),
        )
        .route("/findings", get(inventory::list_findings))
        .route("/dashboard", get(dashboard::get_dashboard))
}

/// Worker callback contract.
fn create_worker_routes() -> Router<AppState> {
    Router::new()
        .route("/worker/lease", post(worker::lease_job))
        .route("/runs/{id}/start", post(runs::start_run))
        .route("/runs/{id}/succeed", post(runs::succeed_run))
        .route("/runs/{id}/fail", post(runs::fail_run))
}
