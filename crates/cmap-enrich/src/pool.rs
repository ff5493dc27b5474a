//! Fixed-size worker pool resolving addresses and coordinates for visit-type campaigns.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cmap_core::{
    CampaignKey, CampaignRecord, Coordinate, EnrichStats, EnrichStatsSnapshot, ExistingCampaign,
};
use cmap_storage::{EnrichmentStore, HttpTransport};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::CacheStore;
use crate::client::{EnrichClient, Endpoints};
use crate::drift::DriftCorrector;
use crate::keys::{ApiKeyPair, KeyPool};
use crate::EnrichError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichConfig {
    pub max_workers: usize,
    /// Pause each worker takes between consecutive jobs.
    pub api_delay: Duration,
    /// When false the pool runs a single worker.
    pub parallel: bool,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            max_workers: 3,
            api_delay: Duration::from_millis(200),
            parallel: true,
        }
    }
}

impl EnrichConfig {
    pub fn worker_count(&self) -> usize {
        if self.parallel {
            self.max_workers.max(1)
        } else {
            1
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub search_keys: Vec<ApiKeyPair>,
    pub map_key: Option<ApiKeyPair>,
}

#[derive(Debug, Clone)]
pub struct EnrichJob {
    pub index: usize,
    pub title: String,
    pub existing: Option<ExistingCampaign>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    pub address: Option<String>,
    pub coordinate: Option<Coordinate>,
    pub category_id: Option<i64>,
}

#[derive(Debug)]
pub struct EnrichResult {
    pub index: usize,
    pub outcome: Result<Resolution, EnrichError>,
}

impl Resolution {
    /// Copy resolved fields onto the record. Missing fields leave it untouched.
    pub fn apply_to(self, record: &mut CampaignRecord) {
        if let Some(address) = self.address {
            record.address = Some(address);
        }
        if let Some(coordinate) = self.coordinate {
            record.lat = Some(coordinate.lat);
            record.lng = Some(coordinate.lng);
        }
        if let Some(category_id) = self.category_id {
            record.category_id = Some(category_id);
        }
    }
}

pub struct EnrichmentPool {
    transport: Arc<dyn HttpTransport>,
    store: Arc<dyn EnrichmentStore>,
    credentials: Credentials,
    endpoints: Endpoints,
    config: EnrichConfig,
    drift: DriftCorrector,
}

impl EnrichmentPool {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        store: Arc<dyn EnrichmentStore>,
        credentials: Credentials,
        config: EnrichConfig,
    ) -> Self {
        Self {
            transport,
            store,
            credentials,
            endpoints: Endpoints::default(),
            config,
            drift: DriftCorrector::default(),
        }
    }

    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Enrich every visit-type record in `batch` in place.
    ///
    /// Per-job failures are counted and leave that record untouched; they
    /// never abort the pool.
    pub async fn enrich(
        &self,
        batch: &mut [CampaignRecord],
        existing: &HashMap<CampaignKey, ExistingCampaign>,
        cancel: &CancellationToken,
    ) -> EnrichStatsSnapshot {
        let stats = Arc::new(EnrichStats::default());

        let mut jobs = Vec::new();
        for (index, record) in batch.iter().enumerate() {
            if record.is_visit_type() {
                jobs.push(EnrichJob {
                    index,
                    title: record.title.clone(),
                    existing: existing.get(&record.key()).cloned(),
                });
            } else {
                stats.record_skipped();
            }
        }

        info!(
            visit = jobs.len(),
            total = batch.len(),
            "starting enrichment of visit-type campaigns"
        );
        if jobs.is_empty() {
            return stats.snapshot();
        }
        stats.set_total(u32::try_from(jobs.len()).unwrap_or(u32::MAX));

        let (job_tx, job_rx) = mpsc::channel(jobs.len());
        let (result_tx, mut result_rx) = mpsc::channel(jobs.len());
        for job in jobs {
            if job_tx.send(job).await.is_err() {
                break;
            }
        }
        drop(job_tx);

        let job_rx = Arc::new(Mutex::new(job_rx));
        let cache = CacheStore::new(self.store.clone());
        let mut workers = JoinSet::new();
        for id in 0..self.config.worker_count() {
            let worker = Worker {
                id,
                client: EnrichClient::new(
                    self.transport.clone(),
                    KeyPool::for_worker(&self.credentials.search_keys, id),
                    self.credentials.map_key.clone(),
                    self.endpoints.clone(),
                )
                .for_worker(id),
                cache: cache.clone(),
                drift: self.drift,
                stats: stats.clone(),
                delay: self.config.api_delay,
                cancel: cancel.clone(),
            };
            workers.spawn(worker.run(job_rx.clone(), result_tx.clone()));
        }
        drop(result_tx);

        while let Some(result) = result_rx.recv().await {
            let Some(record) = batch.get_mut(result.index) else {
                error!(index = result.index, "enrichment result for unknown index");
                continue;
            };
            match result.outcome {
                Ok(resolution) => resolution.apply_to(record),
                Err(err) => {
                    stats.record_error();
                    debug!(title = %record.title, error = %err, "enrichment job failed");
                }
            }
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "enrichment worker panicked");
            }
        }

        let snapshot = stats.snapshot();
        info!(stats = %snapshot, "enrichment finished");
        snapshot
    }
}

struct Worker {
    id: usize,
    client: EnrichClient,
    cache: CacheStore,
    drift: DriftCorrector,
    stats: Arc<EnrichStats>,
    delay: Duration,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(
        mut self,
        jobs: Arc<Mutex<mpsc::Receiver<EnrichJob>>>,
        results: mpsc::Sender<EnrichResult>,
    ) {
        info!(worker = self.id, keys = self.client.keys().len(), "enrichment worker started");

        loop {
            let next = jobs.lock().await.recv().await;
            let Some(job) = next else { break };

            if self.cancel.is_cancelled() {
                let cancelled = EnrichResult {
                    index: job.index,
                    outcome: Err(EnrichError::Cancelled),
                };
                if results.send(cancelled).await.is_err() {
                    break;
                }
                continue;
            }

            let outcome = self.enrich_one(&job).await;
            if let Err(err) = &outcome {
                warn!(worker = self.id, title = %job.title, error = %err, "enrichment failed");
            }
            if results
                .send(EnrichResult {
                    index: job.index,
                    outcome,
                })
                .await
                .is_err()
            {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = self.cancel.cancelled() => {}
            }
        }

        info!(worker = self.id, "enrichment worker stopped");
    }

    async fn enrich_one(&mut self, job: &EnrichJob) -> Result<Resolution, EnrichError> {
        if let Some(entry) = self.cache.fresh_place(&job.title, Utc::now()).await {
            self.stats.record_cache_hit();
            let category_id = self
                .cache
                .resolve_category(entry.category_text.as_deref())
                .await;
            let coordinate = match (entry.lat, entry.lng) {
                (Some(lat), Some(lng)) => Some(Coordinate::new(lat, lng)),
                _ => None,
            };
            return Ok(Resolution {
                address: entry.address,
                coordinate,
                category_id,
            });
        }

        self.stats.record_api_call();
        let Some(hit) = self.client.place_search(&job.title).await? else {
            debug!(worker = self.id, title = %job.title, "no place-search match");
            return Ok(Resolution::default());
        };

        let address = hit.preferred_address().map(str::to_string);
        let mut coordinate = hit.coordinate();
        let category_text = hit.category_text().map(str::to_string);
        let category_id = self.cache.resolve_category(category_text.as_deref()).await;

        if let (Some(address), None) = (&address, coordinate) {
            coordinate = self.geocode_through_cache(address).await;
        }

        let previous = job.existing.as_ref().and_then(ExistingCampaign::coordinate);
        if let (Some(address), Some(resolved), Some(previous)) = (&address, coordinate, previous) {
            coordinate = Some(
                self.drift
                    .correct(
                        &self.client,
                        &self.cache,
                        &self.stats,
                        address,
                        previous,
                        resolved,
                    )
                    .await,
            );
        }

        if let (Some(address), Some(coordinate)) = (&address, coordinate) {
            self.cache
                .put_place(&job.title, address, coordinate, category_text.as_deref())
                .await;
        }

        Ok(Resolution {
            address,
            coordinate,
            category_id,
        })
    }

    async fn geocode_through_cache(&self, address: &str) -> Option<Coordinate> {
        if let Some(hit) = self.cache.geocode(address).await {
            return Some(hit);
        }
        match self.client.geocode(address).await {
            Ok(Some(coordinate)) => {
                self.stats.record_geocode();
                self.cache.put_geocode(address, coordinate).await;
                Some(coordinate)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(worker = self.id, address, error = %err, "geocode failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{GEOCODE_URL, PLACE_SEARCH_URL};
    use crate::testing::{geocode_body, json, place_body, FakeTransport};
    use chrono::Duration as ChronoDuration;
    use cmap_core::{PlaceCacheEntry, VISIT_CAMPAIGN_TYPE};
    use cmap_storage::{FetchError, MemoryStore};

    fn record(title: &str, campaign_type: &str) -> CampaignRecord {
        CampaignRecord {
            platform: "리뷰노트".into(),
            title: title.into(),
            offer: "체험".into(),
            channel: "blog".into(),
            campaign_type: Some(campaign_type.into()),
            ..Default::default()
        }
    }

    fn visit(title: &str) -> CampaignRecord {
        record(title, VISIT_CAMPAIGN_TYPE)
    }

    fn credentials() -> Credentials {
        Credentials {
            search_keys: ["k-one", "k-two", "k-three"]
                .into_iter()
                .map(|id| ApiKeyPair::new(id, "secret"))
                .collect(),
            map_key: Some(ApiKeyPair::new("map", "map-secret")),
        }
    }

    fn pool(
        transport: &Arc<FakeTransport>,
        store: &Arc<MemoryStore>,
        max_workers: usize,
    ) -> EnrichmentPool {
        EnrichmentPool::new(
            transport.clone(),
            store.clone(),
            credentials(),
            EnrichConfig {
                max_workers,
                ..EnrichConfig::default()
            },
        )
    }

    fn cached(address: &str, lat: f64, lng: f64, age_days: i64) -> PlaceCacheEntry {
        PlaceCacheEntry {
            address: Some(address.into()),
            lat: Some(lat),
            lng: Some(lng),
            category_text: Some("한식>냉면".into()),
            updated_at: Utc::now() - ChronoDuration::days(age_days),
        }
    }

    #[test]
    fn sequential_mode_forces_one_worker() {
        let config = EnrichConfig {
            max_workers: 5,
            parallel: false,
            ..EnrichConfig::default()
        };
        assert_eq!(config.worker_count(), 1);
        assert_eq!(EnrichConfig::default().worker_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_visit_campaigns_are_only_counted_as_skipped() {
        let transport = FakeTransport::new(|_| Ok(json(500, "{}")));
        let store = Arc::new(MemoryStore::new());
        let mut batch = vec![record("배송 상품", "배송형"), record("기자단", "기자단")];
        let before = batch.clone();

        let stats = pool(&transport, &store, 3)
            .enrich(&mut batch, &HashMap::new(), &CancellationToken::new())
            .await;

        assert_eq!(batch, before);
        assert_eq!(
            stats,
            EnrichStatsSnapshot {
                skipped: 2,
                ..Default::default()
            }
        );
        assert!(transport.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_cache_hit_skips_the_provider() {
        let transport = FakeTransport::new(|_| Ok(json(500, "{}")));
        let store = Arc::new(MemoryStore::new());
        store
            .seed_place_cache("을밀대", cached("서울 마포구 숭문길 24", 37.5443, 126.9453, 5))
            .await;
        store.map_category("한식>냉면", 11).await;
        let mut batch = vec![visit("을밀대")];

        let stats = pool(&transport, &store, 2)
            .enrich(&mut batch, &HashMap::new(), &CancellationToken::new())
            .await;

        assert!(transport.requests().is_empty());
        assert_eq!(batch[0].address.as_deref(), Some("서울 마포구 숭문길 24"));
        assert_eq!(batch[0].coordinate(), Some(Coordinate::new(37.5443, 126.9453)));
        assert_eq!(batch[0].category_id, Some(11));
        assert_eq!((stats.cache_hits, stats.api_calls), (1, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_cache_entry_triggers_a_search() {
        let transport = FakeTransport::new(|_| {
            Ok(place_body("서울 마포구 숭문길 26", "1269460000", "375444000", "한식>냉면"))
        });
        let store = Arc::new(MemoryStore::new());
        store
            .seed_place_cache("을밀대", cached("서울 마포구 숭문길 24", 37.5443, 126.9453, 45))
            .await;
        let mut batch = vec![visit("을밀대")];

        let stats = pool(&transport, &store, 1)
            .enrich(&mut batch, &HashMap::new(), &CancellationToken::new())
            .await;

        assert_eq!(transport.count_to(PLACE_SEARCH_URL), 1);
        assert_eq!((stats.cache_hits, stats.api_calls), (0, 1));
        assert_eq!(batch[0].address.as_deref(), Some("서울 마포구 숭문길 26"));
        // The refreshed entry is fresh again.
        let entry = store.place_cache("을밀대").await.unwrap().unwrap();
        assert!(entry.is_fresh(Utc::now()));
        assert_eq!(entry.category_text.as_deref(), Some("한식>냉면"));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_coordinates_fall_back_to_geocode_and_fill_its_cache() {
        let transport = FakeTransport::new(|req| {
            if req.url == GEOCODE_URL {
                Ok(geocode_body(35.1587, 129.1604))
            } else {
                Ok(place_body("부산 해운대구 해운대해변로 264", "", "", ""))
            }
        });
        let store = Arc::new(MemoryStore::new());
        let mut batch = vec![visit("해운대 횟집")];

        let stats = pool(&transport, &store, 1)
            .enrich(&mut batch, &HashMap::new(), &CancellationToken::new())
            .await;

        assert_eq!(batch[0].coordinate(), Some(Coordinate::new(35.1587, 129.1604)));
        assert_eq!(stats.geocode_calls, 1);
        assert_eq!(
            store
                .geocode_cache("부산 해운대구 해운대해변로 264")
                .await
                .unwrap(),
            Some(Coordinate::new(35.1587, 129.1604))
        );
        assert!(store.place_cache("해운대 횟집").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn drifted_coordinate_is_corrected_from_geocode() {
        let address = "서울 용산구 한강대로 405";
        let transport = FakeTransport::new(|req| {
            if req.url == GEOCODE_URL {
                Ok(geocode_body(37.5298, 126.9648))
            } else {
                // ~8 km away from the stored point.
                Ok(place_body("서울 용산구 한강대로 405", "1270276000", "374979000", ""))
            }
        });
        let store = Arc::new(MemoryStore::new());
        store
            .seed_geocode(address, Coordinate::new(37.4979, 127.0276))
            .await;

        let mut batch = vec![visit("서울역 카페")];
        let key = batch[0].key();
        let existing = HashMap::from([(
            key.clone(),
            ExistingCampaign {
                key,
                address: Some(address.into()),
                lat: Some(37.5298),
                lng: Some(126.9648),
                category_id: None,
            },
        )]);

        let stats = pool(&transport, &store, 1)
            .enrich(&mut batch, &existing, &CancellationToken::new())
            .await;

        assert_eq!(batch[0].coordinate(), Some(Coordinate::new(37.5298, 126.9648)));
        assert_eq!(transport.count_to(GEOCODE_URL), 1);
        assert_eq!(
            store.geocode_cache(address).await.unwrap(),
            Some(Coordinate::new(37.5298, 126.9648))
        );
        assert_eq!((stats.drift_fixes, stats.geocode_calls), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn results_land_on_their_own_index() {
        let transport = FakeTransport::new(|req| {
            let query = req.query_value("query").unwrap_or_default();
            let n: u32 = query.trim_start_matches("가게").parse().unwrap_or(0);
            Ok(place_body(
                &format!("주소 {n}"),
                &format!("{}", 1_270_000_000 + n * 10_000),
                "375000000",
                "",
            ))
        });
        let store = Arc::new(MemoryStore::new());
        let mut batch = Vec::new();
        for n in 0..12u32 {
            if n % 4 == 3 {
                batch.push(record(&format!("가게{n}"), "배송형"));
            } else {
                batch.push(visit(&format!("가게{n}")));
            }
        }

        let stats = pool(&transport, &store, 3)
            .enrich(&mut batch, &HashMap::new(), &CancellationToken::new())
            .await;

        for (n, record) in batch.iter().enumerate() {
            if n % 4 == 3 {
                assert_eq!(record.address, None);
                continue;
            }
            assert_eq!(record.address.as_deref(), Some(format!("주소 {n}").as_str()));
            let expected_lng = (1_270_000_000 + n as u32 * 10_000) as f64 / 1e7;
            assert!((record.lng.unwrap() - expected_lng).abs() < 1e-9);
        }
        assert_eq!((stats.total, stats.skipped, stats.api_calls), (9, 3, 9));
        assert_eq!(stats.errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_keys_count_as_errors_and_leave_records_alone() {
        let transport = FakeTransport::new(|_| Ok(json(429, "{}")));
        let store = Arc::new(MemoryStore::new());
        let mut batch = vec![visit("첫번째"), visit("두번째")];

        let stats = pool(&transport, &store, 1)
            .enrich(&mut batch, &HashMap::new(), &CancellationToken::new())
            .await;

        assert_eq!(stats.errors, 2);
        assert!(batch.iter().all(|r| r.address.is_none() && r.lat.is_none()));
        // Three strikes on each of three keys, then the worker's pool stays exhausted.
        assert_eq!(transport.count_to(PLACE_SEARCH_URL), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_run_issues_no_calls() {
        let transport = FakeTransport::new(|_| Err(FetchError::Transport("unreachable".into())));
        let store = Arc::new(MemoryStore::new());
        let mut batch = vec![visit("하나"), visit("둘"), visit("셋")];
        let cancel = CancellationToken::new();
        cancel.cancel();

        let stats = pool(&transport, &store, 2)
            .enrich(&mut batch, &HashMap::new(), &cancel)
            .await;

        assert!(transport.requests().is_empty());
        assert_eq!((stats.total, stats.errors), (3, 3));
    }
}
