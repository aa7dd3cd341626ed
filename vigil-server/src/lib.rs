//! # Vigil Server
//!
//! Hosts the orchestration runtime and exposes the HTTP surface around it:
//! owner-scoped policy, run, inventory and dashboard endpoints plus the
//! worker callback contract (`lease`, `start`, `succeed`, `fail`).

pub mod api;
pub mod app;
pub mod errors;
pub mod handlers;
pub mod infra;
pub mod routes;

pub use app::create_app;
pub use infra::app_state::AppState;
