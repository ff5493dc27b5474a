use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use cmap_core::{CampaignKey, CampaignRecord, Coordinate, ExistingCampaign, PlaceCacheEntry};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{0}")]
    Message(String),
}

/// Cache and category lookups used while enriching a batch.
#[async_trait]
pub trait EnrichmentStore: Send + Sync {
    /// Place-cache row for a title regardless of age; freshness is the caller's call.
    async fn place_cache(&self, title: &str) -> Result<Option<PlaceCacheEntry>, StoreError>;

    async fn put_place_cache(
        &self,
        title: &str,
        address: &str,
        coordinate: Coordinate,
        category_text: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn geocode_cache(&self, address: &str) -> Result<Option<Coordinate>, StoreError>;

    async fn put_geocode_cache(
        &self,
        address: &str,
        coordinate: Coordinate,
    ) -> Result<(), StoreError>;

    /// Create-or-fetch the id of a raw category string.
    async fn raw_category_id(&self, raw_text: &str) -> Result<i64, StoreError>;

    async fn mapped_category_id(&self, raw_category_id: i64) -> Result<Option<i64>, StoreError>;
}

/// Campaign persistence: snapshot of known rows and the replace-and-classify step.
#[async_trait]
pub trait CampaignStore: Send + Sync {
    async fn load_existing(&self) -> Result<HashMap<CampaignKey, ExistingCampaign>, StoreError>;

    /// Replace every row sharing a composite key with the incoming batch inside
    /// one transaction and report which inserted ids are genuinely new.
    async fn replace_campaigns(
        &self,
        batch: &[CampaignRecord],
    ) -> Result<ReplaceOutcome, StoreError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplaceOutcome {
    /// Inserted ids whose key was unknown before this run.
    pub new_ids: Vec<i64>,
    /// Inserted ids that replaced a previously stored row.
    pub refreshed_ids: Vec<i64>,
    /// Rows whose insert failed and were skipped.
    pub failed_rows: usize,
}

impl ReplaceOutcome {
    pub fn classify(
        inserted: Vec<(CampaignKey, i64)>,
        pre_existing: &HashSet<CampaignKey>,
        failed_rows: usize,
    ) -> Self {
        let (refreshed, new): (Vec<_>, Vec<_>) = inserted
            .into_iter()
            .partition(|(key, _)| pre_existing.contains(key));
        Self {
            new_ids: new.into_iter().map(|(_, id)| id).collect(),
            refreshed_ids: refreshed.into_iter().map(|(_, id)| id).collect(),
            failed_rows,
        }
    }

    pub fn stored(&self) -> usize {
        self.new_ids.len() + self.refreshed_ids.len()
    }
}
