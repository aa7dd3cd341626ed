//! Owner-scoped services behind the inbound API.
//!
//! These are thin read/write wrappers over the store. Ownership is checked
//! here: a record that exists but belongs to someone else is reported as not
//! found.

pub mod dashboard;
pub mod inventory;
pub mod policies;
pub mod runs;

pub use dashboard::{Dashboard, DashboardService};
pub use inventory::{
    AssetQuery, CreateAsset, FindingQuery, InventoryService, UpdateAsset,
};
pub use policies::{CreatePolicy, PolicyQuery, PolicyService, UpdatePolicy};
pub use runs::{RunQuery, RunService};
