use std::{fmt, sync::Arc};

use vigil_core::{
    orchestration::OrchestratorRuntime,
    services::{DashboardService, InventoryService, PolicyService, RunService},
};

/// Shared handler state. Every service reads and writes through the same
/// store the orchestration runtime drives.
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<OrchestratorRuntime>,
    pub policies: PolicyService,
    pub runs: RunService,
    pub inventory: InventoryService,
    pub dashboard: DashboardService,
}

impl AppState {
    pub fn new(runtime: Arc<OrchestratorRuntime>) -> Self {
        let store = runtime.store();
        Self {
            policies: PolicyService::new(store.clone()),
            runs: RunService::new(store.clone()),
            inventory: InventoryService::new(store.clone()),
            dashboard: DashboardService::new(store),
            runtime,
        }
    }
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("runtime", &self.runtime)
            .finish_non_exhaustive()
    }
}
