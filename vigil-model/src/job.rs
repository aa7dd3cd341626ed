use serde::{Deserialize, Serialize};

use crate::ids::{OwnerId, PolicyId, RunId};
use crate::policy::{Intensity, PolicyKind, PolicySpec, TargetSelection};

/// Message placed on the work queue for an external worker. Workers
/// report back against `run_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    pub run_id: RunId,
    pub policy_id: PolicyId,
    pub owner: OwnerId,
    pub kind: PolicyKind,
    pub spec: PolicySpec,
    pub targets: TargetSelection,
    pub intensity: Intensity,
}
