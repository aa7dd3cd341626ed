//! # Vigil Core
//!
//! The orchestration engine behind Vigil's security posture monitoring:
//! discovery and scan policies are scheduled, dispatched to external workers
//! exactly one run at a time per policy, tracked through their lifecycle and
//! reconciled into the asset and finding inventory.
//!
//! ## Feature Flags
//!
//! - `database`: Postgres adapters for storage and the work queue (SQLx)
//! - `pg-tests`: integration tests that need a live `DATABASE_URL`
//!
//! ## Architecture
//!
//! - [`schedule`]: pure schedule evaluation (QUICK / INTERVAL / CRON)
//! - [`database`]: storage ports plus in-memory and Postgres adapters
//! - [`orchestration`]: dispatcher, run tracker, timeout sweep, result
//!   reconciler, work queue and the loop that drives them
//! - [`services`]: owner-scoped application services used by the HTTP layer
//! - [`risk`]: pluggable asset risk scoring
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use vigil_core::{
//!     database::InMemoryStore,
//!     orchestration::{InMemoryWorkQueue, OrchestratorConfig, OrchestratorRuntime},
//!     risk::SeverityWeightedScorer,
//! };
//!
//! async fn run_once() -> vigil_core::Result<()> {
//!     let runtime = OrchestratorRuntime::new(
//!         OrchestratorConfig::default(),
//!         Arc::new(InMemoryStore::new()),
//!         Arc::new(InMemoryWorkQueue::new()),
//!         Arc::new(SeverityWeightedScorer),
//!     );
//!     let report = runtime.tick(chrono::Utc::now()).await;
//!     println!("dispatched {} runs", report.dispatched);
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]

/// Storage ports and adapters
pub mod database;

#[cfg(feature = "database")]
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Error types
pub mod error;

/// Dispatch, run lifecycle, timeouts, reconciliation and the driving loop
pub mod orchestration;

/// Asset risk scoring
pub mod risk;

/// Schedule evaluator
pub mod schedule;

/// Owner-scoped application services
pub mod services;

pub use error::{Result, VigilError};
