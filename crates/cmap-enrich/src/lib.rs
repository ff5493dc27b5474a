//! Geo-enrichment of visit-type campaigns: credential rotation, provider
//! lookups, the two caches, drift correction and the worker pool.

pub mod cache;
pub mod client;
pub mod drift;
pub mod keys;
pub mod pool;

#[cfg(test)]
mod testing;

use cmap_storage::{FetchError, StoreError};
use thiserror::Error;

pub use cache::CacheStore;
pub use client::{EnrichClient, Endpoints, PlaceHit, GEOCODE_URL, PLACE_SEARCH_URL, STRIKE_LIMIT};
pub use drift::{DriftCorrector, DRIFT_THRESHOLD_METERS};
pub use keys::{ApiKeyPair, KeyPool};
pub use pool::{Credentials, EnrichConfig, EnrichJob, EnrichResult, EnrichmentPool, Resolution};

pub const CRATE_NAME: &str = "cmap-enrich";

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("no place-search credentials configured")]
    NoKeys,
    #[error("all place-search credentials exhausted")]
    KeysExhausted,
    #[error(transparent)]
    Transport(#[from] FetchError),
    #[error("invalid provider response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("enrichment cancelled")]
    Cancelled,
}
