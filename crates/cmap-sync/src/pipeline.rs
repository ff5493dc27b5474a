use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use cmap_adapters::{adapter_for_source, AdapterContext, SourceAdapter};
use cmap_core::EnrichStatsSnapshot;
use cmap_enrich::{EnrichmentPool, Endpoints};
use cmap_storage::{
    CampaignStore, EnrichmentStore, HttpClientConfig, HttpFetcher, HttpTransport, MemoryStore,
    PgStore, ReqwestTransport,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::alerts::{alert_sink_from_config, AlertSink, NoopAlertSink};
use crate::SyncConfig;

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub source: String,
    pub keyword: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub scraped: usize,
    pub parsed: usize,
    pub enrich_stats: EnrichStatsSnapshot,
    pub stored: usize,
    pub failed_rows: usize,
    pub new_campaign_ids: Vec<i64>,
}

impl fmt::Display for SyncRunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run_id={} source={} keyword={} scraped={} parsed={} stored={} new={} failed={}",
            self.run_id,
            self.source,
            self.keyword.as_deref().unwrap_or("-"),
            self.scraped,
            self.parsed,
            self.stored,
            self.new_campaign_ids.len(),
            self.failed_rows
        )
    }
}

/// Scrape → Parse → Enrich → Save for one source, then hand new ids to the alert sink.
pub struct SyncPipeline {
    config: SyncConfig,
    http: HttpFetcher,
    campaigns: Arc<dyn CampaignStore>,
    enrichment: EnrichmentPool,
    alerts: Box<dyn AlertSink>,
}

impl SyncPipeline {
    /// Postgres-backed pipeline with the configured alert sink.
    pub async fn connect(config: SyncConfig) -> Result<Self> {
        let store = PgStore::connect(&config.database_url)
            .await
            .context("connecting to postgres")?;
        let alerts = alert_sink_from_config(&config)?;
        Self::build(config, Arc::new(store), alerts)
    }

    /// In-process store and no alerts; nothing leaves the process except the
    /// source and provider HTTP calls.
    pub fn dry_run(config: SyncConfig) -> Result<Self> {
        Self::build(config, Arc::new(MemoryStore::new()), Box::new(NoopAlertSink))
    }

    fn build<S>(config: SyncConfig, store: Arc<S>, alerts: Box<dyn AlertSink>) -> Result<Self>
    where
        S: CampaignStore + EnrichmentStore + 'static,
    {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let enrich_transport = ReqwestTransport::new(&HttpClientConfig {
            timeout: Duration::from_secs(config.enrich_timeout_secs),
            ..Default::default()
        })?;
        Ok(Self::with_parts(
            config,
            http,
            Arc::new(enrich_transport),
            store,
            alerts,
        ))
    }

    pub fn with_parts<S>(
        config: SyncConfig,
        http: HttpFetcher,
        enrich_transport: Arc<dyn HttpTransport>,
        store: Arc<S>,
        alerts: Box<dyn AlertSink>,
    ) -> Self
    where
        S: CampaignStore + EnrichmentStore + 'static,
    {
        let enrichment = EnrichmentPool::new(
            enrich_transport,
            store.clone(),
            config.credentials(),
            config.enrich.clone(),
        );
        Self {
            config,
            http,
            campaigns: store,
            enrichment,
            alerts,
        }
    }

    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.enrichment = self.enrichment.with_endpoints(endpoints);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_source(
        &self,
        source_id: &str,
        keyword: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<SyncRunSummary> {
        let adapter = adapter_for_source(source_id)
            .with_context(|| format!("no adapter registered for {source_id}"))?;
        self.run_once(adapter.as_ref(), keyword, cancel).await
    }

    pub async fn run_once(
        &self,
        adapter: &dyn SourceAdapter,
        keyword: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let source = adapter.source_id();
        let span = info_span!("sync_run", %run_id, source);
        self.run_inner(run_id, adapter, keyword, cancel)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        adapter: &dyn SourceAdapter,
        keyword: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let keyword = keyword.map(str::trim).filter(|k| !k.is_empty());
        if adapter.requires_keyword() && keyword.is_none() {
            bail!("source {} requires a keyword", adapter.source_id());
        }

        let ctx = AdapterContext::new(run_id, self.config.scrape_max_items, cancel.clone());
        let raw = adapter
            .scrape(&self.http, &ctx, keyword)
            .await
            .with_context(|| format!("scraping {}", adapter.source_id()))?;
        info!(scraped = raw.len(), "scrape complete");

        let mut records = adapter.parse(&raw);
        let mut summary = SyncRunSummary {
            run_id,
            source: adapter.source_id().to_string(),
            keyword: keyword.map(ToString::to_string),
            started_at,
            finished_at: started_at,
            scraped: raw.len(),
            parsed: records.len(),
            enrich_stats: EnrichStatsSnapshot::default(),
            stored: 0,
            failed_rows: 0,
            new_campaign_ids: Vec::new(),
        };
        if records.is_empty() {
            info!("nothing to save");
            summary.finished_at = Utc::now();
            return Ok(summary);
        }

        let existing = match self.campaigns.load_existing().await {
            Ok(existing) => existing,
            Err(err) => {
                warn!(error = %err, "loading existing campaigns failed; drift checks disabled");
                HashMap::new()
            }
        };

        if self.config.search_keys.is_empty() {
            warn!("no place-search credentials configured; visit campaigns stay unresolved");
        }
        summary.enrich_stats = self.enrichment.enrich(&mut records, &existing, cancel).await;
        info!(stats = %summary.enrich_stats, "enrichment complete");

        if cancel.is_cancelled() {
            bail!("run cancelled before save");
        }

        let outcome = self
            .campaigns
            .replace_campaigns(&records)
            .await
            .context("saving campaigns")?;
        info!(
            new = outcome.new_ids.len(),
            refreshed = outcome.refreshed_ids.len(),
            failed = outcome.failed_rows,
            "campaigns saved"
        );

        if let Err(err) = self.alerts.notify(&outcome.new_ids).await {
            warn!(error = %err, count = outcome.new_ids.len(), "alert delivery failed");
        }

        summary.stored = outcome.stored();
        summary.failed_rows = outcome.failed_rows;
        summary.new_campaign_ids = outcome.new_ids;
        summary.finished_at = Utc::now();
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use cmap_adapters::{AdapterError, RawListing, ReviewnoteCampaign};
    use cmap_storage::{BackoffPolicy, FetchError, FetchedResponse, HttpRequest, StatusCode};
    use cmap_core::CampaignKey;
    use serde_json::json;

    use crate::alerts::AlertReport;

    struct FixedAdapter {
        listings: Vec<RawListing>,
        keyword_required: bool,
    }

    #[async_trait]
    impl SourceAdapter for FixedAdapter {
        fn source_id(&self) -> &'static str {
            "fixed"
        }

        fn requires_keyword(&self) -> bool {
            self.keyword_required
        }

        async fn scrape(
            &self,
            _http: &HttpFetcher,
            ctx: &AdapterContext,
            _keyword: Option<&str>,
        ) -> Result<Vec<RawListing>, AdapterError> {
            if ctx.cancel.is_cancelled() {
                return Err(AdapterError::Cancelled);
            }
            Ok(self.listings.clone())
        }
    }

    /// Answers every place search with one hit in Mapo-gu.
    struct PlaceTransport {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HttpTransport for PlaceTransport {
        async fn send(&self, _request: &HttpRequest) -> Result<FetchedResponse, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let body = json!({
                "lastBuildDate": "Mon, 19 Oct 2026 10:00:00 +0900",
                "total": 1,
                "items": [{
                    "title": "가게",
                    "category": "한식>냉면",
                    "address": "",
                    "roadAddress": "서울 마포구 숭문길 26",
                    "mapx": "1269460000",
                    "mapy": "375444000"
                }]
            });
            Ok(FetchedResponse {
                status: StatusCode::OK,
                final_url: "https://fake.test".into(),
                body: body.to_string().into_bytes(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        calls: Mutex<Vec<Vec<i64>>>,
        fail: bool,
    }

    #[async_trait]
    impl AlertSink for Arc<RecordingSink> {
        async fn notify(&self, campaign_ids: &[i64]) -> Result<Option<AlertReport>> {
            self.calls.lock().unwrap().push(campaign_ids.to_vec());
            if self.fail {
                bail!("alert service unreachable");
            }
            Ok(Some(AlertReport::default()))
        }
    }

    fn campaign(id: i64, sort: &str) -> RawListing {
        RawListing::Reviewnote(ReviewnoteCampaign {
            id,
            title: format!("캠페인 {id}"),
            sort: sort.into(),
            channel: "BLOG".into(),
            offer: "식사권".into(),
            ..Default::default()
        })
    }

    fn config() -> SyncConfig {
        let mut config = SyncConfig::from_lookup(|key| match key {
            "NAVER_SEARCH_CLIENT_ID" => Some("search-id".into()),
            "NAVER_SEARCH_CLIENT_SECRET" => Some("search-secret".into()),
            _ => None,
        });
        config.enrich.api_delay = Duration::ZERO;
        config
    }

    fn pipeline(
        store: Arc<MemoryStore>,
        sink: Arc<RecordingSink>,
    ) -> (SyncPipeline, Arc<PlaceTransport>) {
        let transport = Arc::new(PlaceTransport {
            calls: AtomicUsize::new(0),
        });
        let http = HttpFetcher::with_transport(transport.clone(), BackoffPolicy::default());
        let pipeline =
            SyncPipeline::with_parts(config(), http, transport.clone(), store, Box::new(sink));
        (pipeline, transport)
    }

    #[tokio::test]
    async fn second_run_reports_no_new_campaigns() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::default());
        let (pipeline, transport) = pipeline(store.clone(), sink.clone());
        let adapter = FixedAdapter {
            listings: vec![campaign(1, "VISIT"), campaign(2, "DELIVERY"), campaign(1, "VISIT")],
            keyword_required: false,
        };
        let cancel = CancellationToken::new();

        let first = pipeline.run_once(&adapter, None, &cancel).await.unwrap();
        assert_eq!(first.scraped, 3);
        assert_eq!(first.parsed, 2);
        assert_eq!(first.stored, 2);
        assert_eq!(first.new_campaign_ids.len(), 2);
        assert_eq!(first.enrich_stats.total, 1);
        assert_eq!(first.enrich_stats.api_calls, 1);
        assert_eq!(first.enrich_stats.skipped, 1);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);

        let stored = store.campaigns().await;
        let visit = stored
            .iter()
            .find(|c| c.record.title == "캠페인 1")
            .unwrap();
        assert_eq!(visit.record.address.as_deref(), Some("서울 마포구 숭문길 26"));
        assert!(visit.record.lat.is_some());

        let second = pipeline.run_once(&adapter, None, &cancel).await.unwrap();
        assert!(second.new_campaign_ids.is_empty());
        assert_eq!(second.stored, 2);
        assert_eq!(second.enrich_stats.cache_hits, 1);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.campaigns().await.len(), 2);

        let calls = sink.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], first.new_campaign_ids);
        assert!(calls[1].is_empty());
    }

    #[tokio::test]
    async fn alert_failure_does_not_fail_the_run() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });
        let (pipeline, _) = pipeline(store.clone(), sink.clone());
        let adapter = FixedAdapter {
            listings: vec![campaign(5, "DELIVERY")],
            keyword_required: false,
        };

        let summary = pipeline
            .run_once(&adapter, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.new_campaign_ids.len(), 1);
        assert_eq!(sink.calls.lock().unwrap().len(), 1);
        assert_eq!(store.campaigns().await.len(), 1);
    }

    #[tokio::test]
    async fn failed_rows_are_reported() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::default());
        store
            .fail_insert_for(CampaignKey::new("리뷰노트", "캠페인 8", "식사권", "blog"))
            .await;
        let (pipeline, _) = pipeline(store.clone(), sink);
        let adapter = FixedAdapter {
            listings: vec![campaign(8, "DELIVERY"), campaign(9, "DELIVERY")],
            keyword_required: false,
        };

        let summary = pipeline
            .run_once(&adapter, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.stored, 1);
        assert_eq!(summary.failed_rows, 1);
    }

    #[tokio::test]
    async fn keyword_sources_reject_missing_keyword() {
        let store = Arc::new(MemoryStore::new());
        let (pipeline, _) = pipeline(store, Arc::new(RecordingSink::default()));
        let adapter = FixedAdapter {
            listings: vec![campaign(1, "VISIT")],
            keyword_required: true,
        };
        let err = pipeline
            .run_once(&adapter, Some("  "), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("requires a keyword"));
    }

    #[tokio::test]
    async fn cancelled_run_saves_nothing() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::default());
        let (pipeline, _) = pipeline(store.clone(), sink.clone());
        let adapter = FixedAdapter {
            listings: vec![campaign(1, "VISIT")],
            keyword_required: false,
        };
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(pipeline.run_once(&adapter, None, &cancel).await.is_err());
        assert!(store.campaigns().await.is_empty());
        assert!(sink.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_scrape_skips_enrich_and_save() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::default());
        let (pipeline, transport) = pipeline(store, sink.clone());
        let adapter = FixedAdapter {
            listings: Vec::new(),
            keyword_required: false,
        };
        let summary = pipeline
            .run_once(&adapter, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.parsed, 0);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
        assert!(sink.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_source_is_an_error() {
        let store = Arc::new(MemoryStore::new());
        let (pipeline, _) = pipeline(store, Arc::new(RecordingSink::default()));
        assert!(pipeline
            .run_source("nope", None, &CancellationToken::new())
            .await
            .is_err());
    }
}
