//! Configuration for the Vigil server.
//!
//! Values are resolved from a `.env` file, an optional TOML file and
//! environment overrides, in that order of increasing precedence. The
//! orchestrator section maps directly onto
//! [`vigil_core::orchestration::OrchestratorConfig`].

#![allow(missing_docs)]

pub mod loader;
pub mod models;
pub mod sources;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions};
pub use models::{Config, ConfigMetadata, DatabaseConfig, ServerConfig};
pub use sources::{EnvConfig, FileConfig};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings};
