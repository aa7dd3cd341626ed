use std::{collections::BTreeSet, sync::Arc};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use vigil_model::{
    Asset, AssetId, AssetStatus, AssetType, Exposure, Finding, OwnerId, Page,
    PageRequest,
};

use crate::{
    database::{
        Store,
        ports::{AssetFilter, FindingFilter, InventoryRepository},
        storage_time,
    },
    error::{Result, VigilError},
};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CreateAsset {
    pub name: String,
    pub asset_type: AssetType,
    /// Defaults to `name`.
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub exposure: Option<Exposure>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct UpdateAsset {
    pub name: Option<String>,
    pub exposure: Option<Exposure>,
    /// Replaces the tag set.
    pub tags: Option<Vec<String>>,
    pub status: Option<AssetStatus>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AssetQuery {
    pub q: Option<String>,
    pub asset_type: Option<AssetType>,
    pub exposure: Option<Exposure>,
    pub status: Option<AssetStatus>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct FindingQuery {
    pub asset_id: Option<AssetId>,
    pub open_only: bool,
}

#[derive(Clone)]
pub struct InventoryService {
    store: Arc<dyn Store>,
}

impl std::fmt::Debug for InventoryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InventoryService").finish_non_exhaustive()
    }
}

impl InventoryService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Registers an asset by hand. It starts ACTIVE with no risk until a
    /// scan reports findings against it.
    #[instrument(skip(self, request), fields(asset_type = %request.asset_type), err)]
    pub async fn create_asset(
        &self,
        owner: OwnerId,
        request: CreateAsset,
    ) -> Result<Asset> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(VigilError::Configuration("asset name is required".into()));
        }
        let raw_identifier = request.identifier.as_deref().unwrap_or(name);
        let identifier = request
            .asset_type
            .normalize_identifier(raw_identifier)
            .ok_or_else(|| {
                VigilError::Configuration("asset identifier is required".into())
            })?;

        if self
            .store
            .find_asset(owner, request.asset_type, &identifier)
            .await?
            .is_some()
        {
            return Err(VigilError::Conflict(format!(
                "{} asset {identifier} already exists",
                request.asset_type
            )));
        }

        let now = storage_time(Utc::now());
        let asset = Asset {
            id: AssetId::new(),
            owner,
            name: name.to_string(),
            asset_type: request.asset_type,
            identifier,
            exposure: request.exposure.unwrap_or_default(),
            risk_score: 0,
            tags: clean_tags(request.tags),
            status: AssetStatus::Active,
            description: clean_text(request.description),
            discovered_by: None,
            last_seen_run: None,
            first_seen: now,
            last_seen: now,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_asset(&asset).await?;
        info!(asset_id = %asset.id, "asset registered");
        Ok(asset)
    }

    pub async fn get_asset(&self, owner: OwnerId, id: AssetId) -> Result<Asset> {
        self.store
            .get_asset(id)
            .await?
            .filter(|asset| asset.owner == owner)
            .ok_or_else(|| VigilError::not_found("asset", id))
    }

    #[instrument(skip(self, request), err)]
    pub async fn update_asset(
        &self,
        owner: OwnerId,
        id: AssetId,
        request: UpdateAsset,
    ) -> Result<Asset> {
        let mut asset = self.get_asset(owner, id).await?;
        if let Some(name) = request.name {
            let name = name.trim();
            if name.is_empty() {
                return Err(VigilError::Configuration(
                    "asset name must not be blank".into(),
                ));
            }
            asset.name = name.to_string();
        }
        if let Some(exposure) = request.exposure {
            asset.exposure = exposure;
        }
        if let Some(tags) = request.tags {
            asset.tags = clean_tags(tags);
        }
        if let Some(status) = request.status {
            asset.status = status;
        }
        if request.description.is_some() {
            asset.description = clean_text(request.description);
        }
        asset.updated_at = storage_time(Utc::now()).max(asset.updated_at);

        if !self.store.update_asset(&asset).await? {
            return Err(VigilError::not_found("asset", id));
        }
        Ok(asset)
    }

    /// Findings that referenced the asset survive as asset-agnostic.
    #[instrument(skip(self), err)]
    pub async fn delete_asset(&self, owner: OwnerId, id: AssetId) -> Result<()> {
        self.get_asset(owner, id).await?;
        if !self.store.delete_asset(id).await? {
            return Err(VigilError::not_found("asset", id));
        }
        info!(asset_id = %id, "asset deleted");
        Ok(())
    }

    pub async fn list_assets(
        &self,
        owner: OwnerId,
        query: AssetQuery,
        page: PageRequest,
    ) -> Result<Page<Asset>> {
        let filter = AssetFilter {
            owner: Some(owner),
            q: query.q.filter(|q| !q.trim().is_empty()),
            asset_type: query.asset_type,
            exposure: query.exposure,
            status: query.status,
        };
        self.store.list_assets(&filter, page.normalized()).await
    }

    pub async fn list_findings(
        &self,
        owner: OwnerId,
        query: FindingQuery,
        page: PageRequest,
    ) -> Result<Page<Finding>> {
        let filter = FindingFilter {
            owner: Some(owner),
            asset_id: query.asset_id,
            open_only: query.open_only,
        };
        self.store.list_findings(&filter, page.normalized()).await
    }
}

fn clean_tags(tags: Vec<String>) -> BTreeSet<String> {
    tags.into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

fn clean_text(text: Option<String>) -> Option<String> {
    text.map(|t| t.trim().to_string()).filter(|t| !t.is_empty())
}
