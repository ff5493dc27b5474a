//! In-process store used for dry runs and tests. Mirrors the Postgres
//! semantics: hashed cache keys, replace-by-composite-key, alert detaching.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cmap_core::{
    content_hash, CampaignKey, CampaignRecord, Coordinate, ExistingCampaign, PlaceCacheEntry,
};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::store::{CampaignStore, EnrichmentStore, ReplaceOutcome, StoreError};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredCampaign {
    pub id: i64,
    pub record: CampaignRecord,
}

#[derive(Debug, Clone, Default)]
struct State {
    next_campaign_id: i64,
    campaigns: BTreeMap<i64, CampaignRecord>,
    alerts: BTreeMap<i64, Option<i64>>,
    next_alert_id: i64,
    place_cache: HashMap<String, PlaceCacheEntry>,
    geocode_cache: HashMap<String, Coordinate>,
    raw_categories: HashMap<String, i64>,
    next_raw_category_id: i64,
    category_mappings: HashMap<i64, i64>,
    failing_keys: HashSet<CampaignKey>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_place_cache(&self, title: &str, entry: PlaceCacheEntry) {
        self.state
            .lock()
            .await
            .place_cache
            .insert(content_hash(title), entry);
    }

    pub async fn seed_geocode(&self, address: &str, coordinate: Coordinate) {
        self.state
            .lock()
            .await
            .geocode_cache
            .insert(content_hash(address), coordinate);
    }

    /// Map a raw category string onto a standard category id.
    pub async fn map_category(&self, raw_text: &str, standard_category_id: i64) -> i64 {
        let mut state = self.state.lock().await;
        let raw_id = state.raw_category_id(raw_text);
        state.category_mappings.insert(raw_id, standard_category_id);
        raw_id
    }

    pub async fn add_alert(&self, campaign_id: i64) -> i64 {
        let mut state = self.state.lock().await;
        state.next_alert_id += 1;
        let id = state.next_alert_id;
        state.alerts.insert(id, Some(campaign_id));
        id
    }

    pub async fn alert_campaign(&self, alert_id: i64) -> Option<i64> {
        self.state
            .lock()
            .await
            .alerts
            .get(&alert_id)
            .copied()
            .flatten()
    }

    /// Make every insert for `key` fail, like a constraint violation would.
    pub async fn fail_insert_for(&self, key: CampaignKey) {
        self.state.lock().await.failing_keys.insert(key);
    }

    pub async fn campaigns(&self) -> Vec<StoredCampaign> {
        self.state
            .lock()
            .await
            .campaigns
            .iter()
            .map(|(id, record)| StoredCampaign {
                id: *id,
                record: record.clone(),
            })
            .collect()
    }

    pub async fn place_cache_updated_at(&self, title: &str) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .await
            .place_cache
            .get(&content_hash(title))
            .map(|entry| entry.updated_at)
    }
}

impl State {
    fn raw_category_id(&mut self, raw_text: &str) -> i64 {
        if let Some(id) = self.raw_categories.get(raw_text) {
            return *id;
        }
        self.next_raw_category_id += 1;
        let id = self.next_raw_category_id;
        self.raw_categories.insert(raw_text.to_string(), id);
        id
    }
}

#[async_trait]
impl CampaignStore for MemoryStore {
    async fn load_existing(&self) -> Result<HashMap<CampaignKey, ExistingCampaign>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .campaigns
            .values()
            .map(|record| {
                let key = record.key();
                let campaign = ExistingCampaign {
                    key: key.clone(),
                    address: record.address.clone(),
                    lat: record.lat,
                    lng: record.lng,
                    category_id: record.category_id,
                };
                (key, campaign)
            })
            .collect())
    }

    async fn replace_campaigns(
        &self,
        batch: &[CampaignRecord],
    ) -> Result<ReplaceOutcome, StoreError> {
        if batch.is_empty() {
            return Ok(ReplaceOutcome::default());
        }

        let mut guard = self.state.lock().await;
        // Work on a copy so an error before commit leaves the store untouched.
        let mut staged = guard.clone();

        let incoming: HashSet<CampaignKey> = batch.iter().map(CampaignRecord::key).collect();
        let replaced: Vec<(i64, CampaignKey)> = staged
            .campaigns
            .iter()
            .filter_map(|(id, record)| {
                let key = record.key();
                incoming.contains(&key).then_some((*id, key))
            })
            .collect();
        let pre_existing: HashSet<CampaignKey> =
            replaced.iter().map(|(_, key)| key.clone()).collect();
        let replaced_ids: HashSet<i64> = replaced.iter().map(|(id, _)| *id).collect();

        for campaign_id in staged.alerts.values_mut() {
            if campaign_id.is_some_and(|id| replaced_ids.contains(&id)) {
                *campaign_id = None;
            }
        }
        staged.campaigns.retain(|id, _| !replaced_ids.contains(id));

        let mut inserted = Vec::with_capacity(batch.len());
        let mut failed_rows = 0usize;
        let mut live: HashSet<CampaignKey> = staged.campaigns.values().map(|r| r.key()).collect();
        for record in batch {
            let key = record.key();
            if staged.failing_keys.contains(&key) || live.contains(&key) {
                warn!(key = %key, "campaign insert failed; row skipped");
                failed_rows += 1;
                continue;
            }
            staged.next_campaign_id += 1;
            let id = staged.next_campaign_id;
            staged.campaigns.insert(id, record.clone());
            live.insert(key.clone());
            inserted.push((key, id));
        }

        *guard = staged;
        let outcome = ReplaceOutcome::classify(inserted, &pre_existing, failed_rows);
        info!(
            stored = outcome.stored(),
            new = outcome.new_ids.len(),
            failed = outcome.failed_rows,
            "campaign batch stored in memory"
        );
        Ok(outcome)
    }
}

#[async_trait]
impl EnrichmentStore for MemoryStore {
    async fn place_cache(&self, title: &str) -> Result<Option<PlaceCacheEntry>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .place_cache
            .get(&content_hash(title))
            .cloned())
    }

    async fn put_place_cache(
        &self,
        title: &str,
        address: &str,
        coordinate: Coordinate,
        category_text: Option<&str>,
    ) -> Result<(), StoreError> {
        if title.is_empty() {
            return Ok(());
        }
        let entry = PlaceCacheEntry {
            address: Some(address.to_string()),
            lat: Some(coordinate.lat),
            lng: Some(coordinate.lng),
            category_text: category_text.map(ToString::to_string),
            updated_at: Utc::now(),
        };
        self.state
            .lock()
            .await
            .place_cache
            .insert(content_hash(title), entry);
        Ok(())
    }

    async fn geocode_cache(&self, address: &str) -> Result<Option<Coordinate>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .geocode_cache
            .get(&content_hash(address))
            .copied())
    }

    async fn put_geocode_cache(
        &self,
        address: &str,
        coordinate: Coordinate,
    ) -> Result<(), StoreError> {
        if address.is_empty() {
            return Ok(());
        }
        self.state
            .lock()
            .await
            .geocode_cache
            .insert(content_hash(address), coordinate);
        Ok(())
    }

    async fn raw_category_id(&self, raw_text: &str) -> Result<i64, StoreError> {
        Ok(self.state.lock().await.raw_category_id(raw_text))
    }

    async fn mapped_category_id(&self, raw_category_id: i64) -> Result<Option<i64>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .category_mappings
            .get(&raw_category_id)
            .copied())
    }
}
