//! Shared domain records for the vigil orchestration engine.
//!
//! Everything here is plain data: identifiers, policy definitions, run
//! records, inventory and the job contract handed to workers. Persistence
//! and scheduling logic live in `vigil-core`.
#![allow(missing_docs)]

#[macro_use]
mod text_enum;

pub mod asset;
pub mod error;
pub mod finding;
pub mod ids;
pub mod job;
pub mod page;
pub mod policy;
pub mod run;

pub use asset::{Asset, AssetStatus, AssetType, Exposure};
pub use error::ModelError;
pub use finding::{Finding, Severity};
pub use ids::{AssetId, FindingId, OwnerId, PolicyId, RunId};
pub use job::JobMessage;
pub use page::{Page, PageRequest};
pub use policy::{
    DiscoverySpec, Intensity, Policy, PolicyKind, PolicySpec, PolicyStatus, ScanSpec, ScanType,
    ScheduleDescriptor, ScheduleType, TargetSelection,
};
pub use run::{
    AssetDescriptor, AssetLocator, ErrorCategory, FindingDescriptor, Run, RunError, RunPayload,
    RunStatus, RunSummary,
};
