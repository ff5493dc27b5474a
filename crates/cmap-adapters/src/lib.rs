//! Source adapter contracts and the per-source scrape/parse implementations.

use std::collections::HashSet;

use async_trait::async_trait;
use cmap_core::{CampaignKey, CampaignRecord};
use cmap_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

pub mod inflexer;
pub mod reviewnote;

pub use inflexer::{InflexerAdapter, InflexerListing};
pub use reviewnote::{ReviewnoteAdapter, ReviewnoteCampaign};

pub const CRATE_NAME: &str = "cmap-adapters";

#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub run_id: Uuid,
    /// Upper bound on scraped listings; 0 means unlimited.
    pub max_items: usize,
    pub cancel: CancellationToken,
}

impl AdapterContext {
    pub fn new(run_id: Uuid, max_items: usize, cancel: CancellationToken) -> Self {
        Self {
            run_id,
            max_items,
            cancel,
        }
    }

    pub fn limit_reached(&self, collected: usize) -> bool {
        self.max_items > 0 && collected >= self.max_items
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("scrape cancelled")]
    Cancelled,
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// One scraped listing, typed per source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum RawListing {
    Reviewnote(ReviewnoteCampaign),
    Inflexer(InflexerListing),
}

impl RawListing {
    pub fn to_record(&self) -> CampaignRecord {
        match self {
            RawListing::Reviewnote(campaign) => reviewnote::parse_campaign(campaign),
            RawListing::Inflexer(listing) => inflexer::parse_listing(listing),
        }
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    fn requires_keyword(&self) -> bool {
        false
    }

    async fn scrape(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        keyword: Option<&str>,
    ) -> Result<Vec<RawListing>, AdapterError>;

    /// Normalize raw listings and drop in-batch duplicates by composite key.
    fn parse(&self, raw: &[RawListing]) -> Vec<CampaignRecord> {
        let records = dedup_by_key(raw.iter().map(RawListing::to_record));
        info!(
            source = self.source_id(),
            raw = raw.len(),
            parsed = records.len(),
            "parsed listings"
        );
        records
    }
}

/// Keep the first record for each composite key, preserving order.
pub fn dedup_by_key(records: impl IntoIterator<Item = CampaignRecord>) -> Vec<CampaignRecord> {
    let mut seen: HashSet<CampaignKey> = HashSet::new();
    records
        .into_iter()
        .filter(|record| seen.insert(record.key()))
        .collect()
}

pub fn adapter_for_source(source_id: &str) -> Option<Box<dyn SourceAdapter>> {
    match source_id {
        reviewnote::SOURCE_ID | reviewnote::PLATFORM_NAME => {
            Some(Box::new(ReviewnoteAdapter::default()))
        }
        inflexer::SOURCE_ID => Some(Box::new(InflexerAdapter::default())),
        _ => None,
    }
}

pub fn known_sources() -> &'static [&'static str] {
    &[reviewnote::SOURCE_ID, inflexer::SOURCE_ID]
}


#[cfg(test)]
mod tests {
    use super::*;

    fn record(title: &str, company: &str) -> CampaignRecord {
        CampaignRecord {
            platform: "p".into(),
            title: title.into(),
            offer: "o".into(),
            channel: "blog".into(),
            company: company.into(),
            ..Default::default()
        }
    }

    #[test]
    fn dedup_keeps_first_occurrence_in_order() {
        let out = dedup_by_key(vec![
            record("a", "first"),
            record("b", "b"),
            record("a", "second"),
        ]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].company, "first");
        assert_eq!(out[1].title, "b");
    }

    #[test]
    fn adapters_resolve_by_source_id() {
        assert_eq!(
            adapter_for_source("reviewnote").map(|a| a.source_id()),
            Some("reviewnote")
        );
        assert_eq!(
            adapter_for_source("리뷰노트").map(|a| a.source_id()),
            Some("reviewnote")
        );
        let inflexer = adapter_for_source("inflexer").unwrap();
        assert!(inflexer.requires_keyword());
        assert!(adapter_for_source("unknown").is_none());
        assert_eq!(known_sources(), &["reviewnote", "inflexer"]);
    }

    #[test]
    fn raw_listings_are_tagged_by_source() {
        let raw = RawListing::Inflexer(InflexerListing {
            title: "t".into(),
            ..Default::default()
        });
        let json = serde_json::to_value(&raw).unwrap();
        assert_eq!(json["source"], "inflexer");
        let back: RawListing = serde_json::from_value(json).unwrap();
        assert_eq!(back, raw);
    }

    #[test]
    fn context_limit_of_zero_is_unlimited() {
        let ctx = AdapterContext::new(Uuid::nil(), 0, CancellationToken::new());
        assert!(!ctx.limit_reached(10_000));
        let ctx = AdapterContext::new(Uuid::nil(), 5, CancellationToken::new());
        assert!(!ctx.limit_reached(4));
        assert!(ctx.limit_reached(5));
    }
}
