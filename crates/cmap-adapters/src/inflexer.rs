//! Keyword search on inflexer.net, merged with its map endpoint's coordinates.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use cmap_core::CampaignRecord;
use cmap_storage::{HttpFetcher, HttpRequest};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{AdapterContext, AdapterError, RawListing, SourceAdapter};

pub const SOURCE_ID: &str = "inflexer";
pub const SEARCH_URL: &str = "https://inflexer.net:5000/search";
pub const MAP_URL: &str = "https://inflexer.net:5000/map";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub is_valid: bool,
    #[serde(default)]
    pub result: Vec<InflexerListing>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MapResponse {
    #[serde(default)]
    pub result: Vec<MapPoint>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MapPoint {
    #[serde(default)]
    pub title: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InflexerListing {
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub offer: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub media: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    pub apl_due_dt: Option<String>,
    pub pub_due_dt: Option<String>,
    pub apl_stt_dt: Option<String>,
    /// Search keyword that produced this listing.
    #[serde(default)]
    pub keyword: String,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct InflexerAdapter {
    search_url: String,
    map_url: String,
}

impl Default for InflexerAdapter {
    fn default() -> Self {
        Self::new(SEARCH_URL, MAP_URL)
    }
}

impl InflexerAdapter {
    pub fn new(search_url: impl Into<String>, map_url: impl Into<String>) -> Self {
        Self {
            search_url: search_url.into(),
            map_url: map_url.into(),
        }
    }
}

#[async_trait]
impl SourceAdapter for InflexerAdapter {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn requires_keyword(&self) -> bool {
        true
    }

    async fn scrape(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        keyword: Option<&str>,
    ) -> Result<Vec<RawListing>, AdapterError> {
        let keyword = keyword
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| AdapterError::Message("inflexer requires a keyword".to_string()))?;
        if ctx.cancel.is_cancelled() {
            return Err(AdapterError::Cancelled);
        }

        let search_request = HttpRequest::get(&self.search_url)
            .query("query", keyword)
            .header("Accept", "application/json");
        let map_request = HttpRequest::get(&self.map_url)
            .query("query", keyword)
            .query("type", "VST")
            .header("Accept", "application/json");

        let (search, map) = tokio::join!(
            http.fetch_json::<SearchResponse>(ctx.run_id, SOURCE_ID, &search_request),
            http.fetch_json::<MapResponse>(ctx.run_id, SOURCE_ID, &map_request),
        );

        let search = search?;
        if !search.is_valid {
            warn!(keyword, "search response flagged invalid");
            return Ok(Vec::new());
        }
        if search.result.is_empty() {
            info!(keyword, "search returned no listings");
            return Ok(Vec::new());
        }

        let points: HashMap<String, MapPoint> = match map {
            Ok(map) => {
                info!(points = map.result.len(), "map coordinates fetched");
                map.result
                    .into_iter()
                    .map(|point| (point.title.clone(), point))
                    .collect()
            }
            Err(err) => {
                warn!(keyword, error = %err, "map lookup failed; continuing without coordinates");
                HashMap::new()
            }
        };

        let listings: Vec<RawListing> = search
            .result
            .into_iter()
            .map(|mut listing| {
                listing.keyword = keyword.to_string();
                if let Some(point) = points.get(&listing.title) {
                    listing.lat = point.latitude;
                    listing.lng = point.longitude;
                }
                RawListing::Inflexer(listing)
            })
            .collect();
        info!(keyword, total = listings.len(), "scrape finished");
        Ok(listings)
    }
}

fn channel_for(media: &str) -> &'static str {
    match media.trim() {
        "BP_" => "blog",
        "IP_" | "IP_IP_" => "instagram",
        "IR_" => "reels",
        "BC_" => "clip",
        "BP_BC_" => "blog,clip",
        "IP_IR_" => "instagram,reels",
        "BP_IP_" => "blog,instagram",
        "YP_" => "youtube",
        "YS_" | "SR_" => "shorts",
        "YP_YS_" => "youtube,shorts",
        _ => "etc",
    }
}

fn campaign_type_for(kind: &str) -> Option<&'static str> {
    match kind.trim() {
        "PRS" => Some("기자단"),
        "VST" => Some("방문형"),
        "SHP" => Some("배송형"),
        "서울오빠_기타" => Some("구매평"),
        _ => None,
    }
}

fn parse_date(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .map(|naive| naive.and_utc())
}

pub fn parse_listing(raw: &InflexerListing) -> CampaignRecord {
    let title = raw.title.trim().to_string();
    let keyword = (!raw.keyword.is_empty()).then(|| raw.keyword.clone());
    let link = (!raw.url.is_empty()).then(|| raw.url.clone());

    CampaignRecord {
        platform: raw.domain.trim().to_string(),
        source: SOURCE_ID.to_string(),
        company: title.clone(),
        offer: raw.offer.trim().to_string(),
        channel: channel_for(&raw.media).to_string(),
        campaign_type: campaign_type_for(&raw.kind).map(ToString::to_string),
        search_text: keyword.clone().unwrap_or_default(),
        region: keyword,
        content_link: link.clone(),
        company_link: link,
        apply_deadline: parse_date(raw.apl_due_dt.as_deref()),
        review_deadline: parse_date(raw.pub_due_dt.as_deref()),
        apply_from: parse_date(raw.apl_stt_dt.as_deref()),
        lat: raw.lat,
        lng: raw.lng,
        title,
        ..Default::default()
    }
}
