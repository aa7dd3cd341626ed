#![allow(dead_code)]

use std::sync::Arc;

use axum_test::TestServer;
use vigil_core::{
    orchestration::{OrchestratorConfig, OrchestratorRuntime},
    services::{CreateAsset, CreatePolicy},
};
use vigil_model::{
    AssetType, DiscoverySpec, Intensity, OwnerId, PolicySpec, ScanSpec,
    ScheduleDescriptor, TargetSelection,
};
use vigil_server::{AppState, create_app, infra::orchestration::in_memory_runtime};

pub const OWNER_HEADER: &str = "x-vigil-owner";

pub struct TestApp {
    pub server: TestServer,
    pub runtime: Arc<OrchestratorRuntime>,
    pub owner: OwnerId,
}

impl TestApp {
    pub fn new() -> anyhow::Result<Self> {
        let mut config = OrchestratorConfig::default();
        config.retry.backoff_base_ms = 1;
        config.retry.backoff_max_ms = 2;
        config.retry.jitter_ratio = 0.0;
        let runtime = in_memory_runtime(config);
        let server = TestServer::new(create_app(AppState::new(runtime.clone())))
            .map_err(|err| anyhow::anyhow!(err.to_string()))?;
        Ok(Self {
            server,
            runtime,
            owner: OwnerId::new(),
        })
    }

    pub fn owner_header(&self) -> String {
        self.owner.to_string()
    }
}

pub fn discovery_policy(schedule: ScheduleDescriptor) -> CreatePolicy {
    CreatePolicy {
        name: "external domains".into(),
        spec: PolicySpec::Discovery(DiscoverySpec {
            asset_type: AssetType::Domain,
            stale_after_runs: None,
        }),
        targets: TargetSelection::Manual(vec!["example.com".into()]),
        intensity: Intensity::default(),
        schedule,
        activate: true,
    }
}

pub fn scan_policy(targets: TargetSelection) -> CreatePolicy {
    CreatePolicy {
        name: "perimeter scan".into(),
        spec: PolicySpec::Scan(ScanSpec::default()),
        targets,
        intensity: Intensity::Light,
        schedule: ScheduleDescriptor::quick(),
        activate: true,
    }
}

pub fn domain_asset(name: &str) -> CreateAsset {
    CreateAsset {
        name: name.to_string(),
        asset_type: AssetType::Domain,
        identifier: None,
        exposure: None,
        tags: vec!["prod".into()],
        description: None,
    }
}
