//! Paged campaign API of reviewnote.co.kr.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cmap_core::CampaignRecord;
use cmap_storage::{HttpFetcher, HttpRequest};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{AdapterContext, AdapterError, RawListing, SourceAdapter};

pub const SOURCE_ID: &str = "reviewnote";
pub const PLATFORM_NAME: &str = "리뷰노트";
pub const CAMPAIGNS_URL: &str = "https://www.reviewnote.co.kr/api/v2/campaigns";
const IMAGE_BASE_URL: &str = "https://reviewnote.s3.ap-northeast-2.amazonaws.com/";
const CAMPAIGN_PAGE_URL: &str = "https://www.reviewnote.co.kr/campaigns";
const PAGE_LIMIT: usize = 100;
const PAGE_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CampaignPage {
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub objects: Vec<ReviewnoteCampaign>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewnoteCampaign {
    pub id: i64,
    #[serde(default)]
    pub title: String,
    pub status: Option<String>,
    #[serde(default)]
    pub sort: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub offer: String,
    pub image_key: Option<String>,
    pub city: Option<String>,
    pub apply_end_at: Option<String>,
    pub review_end_at: Option<String>,
    #[serde(default)]
    pub applicant_count: i64,
    #[serde(default)]
    pub is_premium: bool,
    pub category: Option<NamedRef>,
    pub sido: Option<NamedRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamedRef {
    #[serde(default, alias = "title")]
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct ReviewnoteAdapter {
    campaigns_url: String,
}

impl Default for ReviewnoteAdapter {
    fn default() -> Self {
        Self::new(CAMPAIGNS_URL)
    }
}

impl ReviewnoteAdapter {
    pub fn new(campaigns_url: impl Into<String>) -> Self {
        Self {
            campaigns_url: campaigns_url.into(),
        }
    }
}

#[async_trait]
impl SourceAdapter for ReviewnoteAdapter {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    async fn scrape(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        _keyword: Option<&str>,
    ) -> Result<Vec<RawListing>, AdapterError> {
        let mut listings = Vec::new();
        let mut page = 0u32;

        loop {
            if ctx.cancel.is_cancelled() {
                return Err(AdapterError::Cancelled);
            }

            let request = HttpRequest::get(&self.campaigns_url)
                .query("limit", PAGE_LIMIT.to_string())
                .query("page", page.to_string())
                .header("Accept", "application/json");
            let body: CampaignPage = http.fetch_json(ctx.run_id, SOURCE_ID, &request).await?;

            let fetched = body.objects.len();
            if fetched == 0 {
                info!(page, "no more campaigns");
                break;
            }

            for campaign in body.objects {
                if ctx.limit_reached(listings.len()) {
                    break;
                }
                listings.push(RawListing::Reviewnote(campaign));
            }
            info!(page, fetched, total = listings.len(), "fetched campaign page");

            if ctx.limit_reached(listings.len()) || fetched < PAGE_LIMIT {
                break;
            }
            page += 1;
            tokio::time::sleep(PAGE_DELAY).await;
        }

        Ok(listings)
    }
}

fn channel_for(raw: &str) -> String {
    match raw {
        "BLOG" => "blog".to_string(),
        "BLOG_CLIP" => "blog,clip".to_string(),
        "INSTAGRAM" => "instagram".to_string(),
        "REELS" => "reels".to_string(),
        "YOUTUBE" => "youtube".to_string(),
        "SHORTS" => "shorts".to_string(),
        "TIKTOK" => "tiktok".to_string(),
        other => other.to_lowercase(),
    }
}

fn campaign_type_for(sort: &str) -> Option<&'static str> {
    match sort {
        "VISIT" => Some("방문형"),
        "DELIVERY" => Some("배송형"),
        "PURCHASE" => Some("구매형"),
        _ => None,
    }
}

fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?.trim();
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn parse_campaign(raw: &ReviewnoteCampaign) -> CampaignRecord {
    let title = raw.title.trim().to_string();
    let link = format!("{CAMPAIGN_PAGE_URL}/{}", raw.id);

    let region = raw.city.as_deref().map(|city| {
        match raw.sido.as_ref().map(|s| s.name.as_str()) {
            Some(sido) if !sido.is_empty() && sido != city => format!("{city} {sido}"),
            _ => city.to_string(),
        }
    });

    CampaignRecord {
        platform: PLATFORM_NAME.to_string(),
        source: PLATFORM_NAME.to_string(),
        company: title.clone(),
        offer: raw.offer.trim().to_string(),
        channel: channel_for(&raw.channel),
        campaign_type: campaign_type_for(&raw.sort).map(ToString::to_string),
        region,
        content_link: Some(link.clone()),
        company_link: Some(link),
        img_url: raw
            .image_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .map(|key| format!("{IMAGE_BASE_URL}{key}")),
        apply_deadline: parse_timestamp(raw.apply_end_at.as_deref()),
        review_deadline: parse_timestamp(raw.review_end_at.as_deref()),
        search_text: title.clone(),
        title,
        ..Default::default()
    }
}
