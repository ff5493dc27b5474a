//! Core domain model for campaign listings, their composite identity and
//! the enrichment bookkeeping shared by every pipeline stage.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub mod geo;

pub use geo::{clean_search_query, content_hash, decode_map_xy, haversine_meters, Coordinate};

pub const CRATE_NAME: &str = "cmap-core";

/// Campaign type tag of listings that need a physical location.
pub const VISIT_CAMPAIGN_TYPE: &str = "방문형";

/// Place-cache entries older than this are treated as misses.
pub const PLACE_CACHE_TTL_DAYS: i64 = 30;

/// Composite identity of a stored campaign. No two live rows share it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CampaignKey {
    pub platform: String,
    pub title: String,
    pub offer: String,
    pub channel: String,
}

impl CampaignKey {
    pub fn new(
        platform: impl Into<String>,
        title: impl Into<String>,
        offer: impl Into<String>,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            platform: platform.into(),
            title: title.into(),
            offer: offer.into(),
            channel: channel.into(),
        }
    }
}

impl fmt::Display for CampaignKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.platform, self.title, self.offer, self.channel
        )
    }
}

/// Parse-stage output contract: one normalized listing.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CampaignRecord {
    pub platform: String,
    pub title: String,
    pub offer: String,
    pub channel: String,
    pub source: String,
    pub company: String,
    pub company_link: Option<String>,
    pub content_link: Option<String>,
    pub campaign_type: Option<String>,
    pub region: Option<String>,
    pub apply_from: Option<DateTime<Utc>>,
    pub apply_deadline: Option<DateTime<Utc>>,
    pub review_deadline: Option<DateTime<Utc>>,
    pub address: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub category_id: Option<i64>,
    pub img_url: Option<String>,
    pub search_text: String,
}

impl CampaignRecord {
    pub fn key(&self) -> CampaignKey {
        CampaignKey::new(
            self.platform.clone(),
            self.title.clone(),
            self.offer.clone(),
            self.channel.clone(),
        )
    }

    pub fn is_visit_type(&self) -> bool {
        self.campaign_type.as_deref() == Some(VISIT_CAMPAIGN_TYPE)
    }

    pub fn coordinate(&self) -> Option<Coordinate> {
        Some(Coordinate::new(self.lat?, self.lng?))
    }
}

/// Snapshot of a previously stored campaign, used for drift comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExistingCampaign {
    pub key: CampaignKey,
    pub address: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub category_id: Option<i64>,
}

impl ExistingCampaign {
    pub fn coordinate(&self) -> Option<Coordinate> {
        Some(Coordinate::new(self.lat?, self.lng?))
    }
}

/// Row of the place (local search) cache, keyed by the title hash.
///
/// `category_text` is the raw, unmapped category string exactly as the
/// place-search provider returned it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceCacheEntry {
    pub address: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub category_text: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl PlaceCacheEntry {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now - self.updated_at < Duration::days(PLACE_CACHE_TTL_DAYS)
    }
}

/// Counters mutated concurrently by enrichment workers.
#[derive(Debug, Default)]
pub struct EnrichStats {
    total: AtomicU32,
    cache_hits: AtomicU32,
    api_calls: AtomicU32,
    geocode_calls: AtomicU32,
    drift_fixes: AtomicU32,
    skipped: AtomicU32,
    errors: AtomicU32,
}

impl EnrichStats {
    pub fn set_total(&self, total: u32) {
        self.total.store(total, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_api_call(&self) {
        self.api_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_geocode(&self) {
        self.geocode_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drift_fix(&self) {
        self.drift_fixes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EnrichStatsSnapshot {
        EnrichStatsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            api_calls: self.api_calls.load(Ordering::Relaxed),
            geocode_calls: self.geocode_calls.load(Ordering::Relaxed),
            drift_fixes: self.drift_fixes.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`EnrichStats`] taken after the worker pool drains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichStatsSnapshot {
    pub total: u32,
    pub cache_hits: u32,
    pub api_calls: u32,
    pub geocode_calls: u32,
    pub drift_fixes: u32,
    pub skipped: u32,
    pub errors: u32,
}

impl fmt::Display for EnrichStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total={} cache_hits={} api_calls={} geocodes={} drift_fixes={} skipped={} errors={}",
            self.total,
            self.cache_hits,
            self.api_calls,
            self.geocode_calls,
            self.drift_fixes,
            self.skipped,
            self.errors
        )
    }
}
