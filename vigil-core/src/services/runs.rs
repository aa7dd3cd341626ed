use std::sync::Arc;

use serde::{Deserialize, Serialize};
use vigil_model::{OwnerId, Page, PageRequest, PolicyId, Run, RunId, RunStatus};

use crate::{
    database::{
        Store,
        ports::{RunFilter, RunRepository},
    },
    error::{Result, VigilError},
};

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RunQuery {
    pub policy_id: Option<PolicyId>,
    pub status: Option<RunStatus>,
}

/// Read access to run history.
#[derive(Clone)]
pub struct RunService {
    store: Arc<dyn Store>,
}

impl std::fmt::Debug for RunService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunService").finish_non_exhaustive()
    }
}

impl RunService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn get_run(&self, owner: OwnerId, id: RunId) -> Result<Run> {
        self.store
            .get_run(id)
            .await?
            .filter(|run| run.owner == owner)
            .ok_or_else(|| VigilError::not_found("run", id))
    }

    pub async fn list_runs(
        &self,
        owner: OwnerId,
        query: RunQuery,
        page: PageRequest,
    ) -> Result<Page<Run>> {
        let filter = RunFilter {
            owner: Some(owner),
            policy_id: query.policy_id,
            status: query.status,
        };
        self.store.list_runs(&filter, page.normalized()).await
    }
}
