//! Policy dispatch and run lifecycle.
//!
//! The dispatcher turns due policies into queued runs under the single-flight
//! rule, workers report back through the run tracker, the sweep reclaims runs
//! nobody finished and the reconciler folds results into inventory. The
//! runtime drives all of it on a fixed cadence.

pub mod config;
pub mod dispatcher;
#[cfg(feature = "database")]
pub mod postgres_queue;
pub mod queue;
pub mod reconciler;
pub mod retry;
pub mod runtime;
pub mod sweep;
pub mod tracker;

pub use config::*;
pub use dispatcher::*;
#[cfg(feature = "database")]
pub use postgres_queue::*;
pub use queue::*;
pub use reconciler::*;
pub use retry::*;
pub use runtime::*;
pub use sweep::*;
pub use tracker::*;
