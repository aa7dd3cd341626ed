pub mod inventory;
pub mod policies;
pub mod runs;

pub use inventory::{
    AssetFilter, AssetObservation, AssetUpsert, FindingFilter,
    FindingObservation, FindingUpsert, InventoryRepository, RiskTotals,
};
pub use policies::{PolicyFilter, PolicyRepository};
pub use runs::{
    ClaimOutcome, ClaimRequest, RunFilter, RunRepository, RunTransition,
    TimeoutCutoffs,
};

/// Everything the engine needs from durable storage.
pub trait Store: PolicyRepository + RunRepository + InventoryRepository {}

impl<T> Store for T where
    T: PolicyRepository + RunRepository + InventoryRepository
{
}
