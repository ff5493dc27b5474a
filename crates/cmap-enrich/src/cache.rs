use std::sync::Arc;

use chrono::{DateTime, Utc};
use cmap_core::{Coordinate, PlaceCacheEntry};
use cmap_storage::EnrichmentStore;
use tracing::{debug, warn};

/// Read-through view over the place and geocode caches.
///
/// Store failures degrade to misses on read and are logged on write; the
/// caches never decide whether a job succeeds.
#[derive(Clone)]
pub struct CacheStore {
    store: Arc<dyn EnrichmentStore>,
}

impl CacheStore {
    pub fn new(store: Arc<dyn EnrichmentStore>) -> Self {
        Self { store }
    }

    /// Place-cache entry for `title` if it was written within the TTL.
    pub async fn fresh_place(&self, title: &str, now: DateTime<Utc>) -> Option<PlaceCacheEntry> {
        match self.store.place_cache(title).await {
            Ok(Some(entry)) if entry.is_fresh(now) => {
                debug!(title, "place cache hit");
                Some(entry)
            }
            Ok(Some(entry)) => {
                debug!(title, updated_at = %entry.updated_at, "place cache entry expired");
                None
            }
            Ok(None) => None,
            Err(err) => {
                warn!(title, error = %err, "place cache lookup failed");
                None
            }
        }
    }

    pub async fn put_place(
        &self,
        title: &str,
        address: &str,
        coordinate: Coordinate,
        category_text: Option<&str>,
    ) {
        if let Err(err) = self
            .store
            .put_place_cache(title, address, coordinate, category_text)
            .await
        {
            warn!(title, error = %err, "place cache write failed");
        }
    }

    pub async fn geocode(&self, address: &str) -> Option<Coordinate> {
        match self.store.geocode_cache(address).await {
            Ok(hit) => hit,
            Err(err) => {
                warn!(address, error = %err, "geocode cache lookup failed");
                None
            }
        }
    }

    pub async fn put_geocode(&self, address: &str, coordinate: Coordinate) {
        if let Err(err) = self.store.put_geocode_cache(address, coordinate).await {
            warn!(address, error = %err, "geocode cache write failed");
        }
    }

    /// Map a raw provider category to a standard category id. Unmapped text
    /// and lookup failures both yield `None`.
    pub async fn resolve_category(&self, raw_text: Option<&str>) -> Option<i64> {
        let raw_text = raw_text.map(str::trim).filter(|t| !t.is_empty())?;
        let raw_id = match self.store.raw_category_id(raw_text).await {
            Ok(id) => id,
            Err(err) => {
                warn!(raw_text, error = %err, "raw category lookup failed");
                return None;
            }
        };
        match self.store.mapped_category_id(raw_id).await {
            Ok(mapped) => mapped,
            Err(err) => {
                warn!(raw_text, error = %err, "category mapping lookup failed");
                None
            }
        }
    }
}
