use async_trait::async_trait;
use chrono::{DateTime, Utc};
use vigil_model::{
    OwnerId, Page, PageRequest, Policy, PolicyId, PolicyKind, PolicyStatus,
};

use crate::error::Result;

#[derive(Debug, Clone, Default)]
pub struct PolicyFilter {
    pub owner: Option<OwnerId>,
    pub status: Option<PolicyStatus>,
    pub kind: Option<PolicyKind>,
}

impl PolicyFilter {
    pub fn for_owner(owner: OwnerId) -> Self {
        Self {
            owner: Some(owner),
            ..Self::default()
        }
    }

    pub fn matches(&self, policy: &Policy) -> bool {
        self.owner.is_none_or(|o| policy.owner == o)
            && self.status.is_none_or(|s| policy.status == s)
            && self.kind.is_none_or(|k| policy.kind() == k)
    }
}

#[async_trait]
pub trait PolicyRepository: Send + Sync {
    async fn insert_policy(&self, policy: &Policy) -> Result<()>;

    async fn get_policy(&self, id: PolicyId) -> Result<Option<Policy>>;

    /// Compare-and-swap on `updated_at`. Returns `false` when the stored row
    /// moved on since `expected_updated_at` was read (or is gone).
    async fn update_policy(
        &self,
        policy: &Policy,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Deletes the policy and, with it, every run it owns.
    async fn delete_policy(&self, id: PolicyId) -> Result<bool>;

    /// Newest first.
    async fn list_policies(
        &self,
        filter: &PolicyFilter,
        page: PageRequest,
    ) -> Result<Page<Policy>>;

    /// ACTIVE policies with `next_run_at <= now` and no in-flight run,
    /// earliest due first.
    async fn due_policies(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Policy>>;

    async fn policy_status_counts(
        &self,
        owner: OwnerId,
    ) -> Result<Vec<(PolicyStatus, u64)>>;
}
