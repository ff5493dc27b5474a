//! Place-search and geocode calls with credential rotation and rate-limit backoff.

use std::sync::Arc;
use std::time::Duration;

use cmap_core::{clean_search_query, decode_map_xy, Coordinate};
use cmap_storage::{FetchError, FetchedResponse, HttpRequest, HttpTransport, StatusCode};
use rand::Rng;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::keys::{ApiKeyPair, KeyPool};
use crate::EnrichError;

pub const PLACE_SEARCH_URL: &str = "https://openapi.naver.com/v1/search/local.json";
pub const GEOCODE_URL: &str = "https://maps.apigw.ntruss.com/map-geocode/v2/geocode";

/// 429 responses tolerated per key within one search before it is discarded.
pub const STRIKE_LIMIT: u32 = 3;
const INITIAL_BACKOFF_SECS: f64 = 0.4;
const BACKOFF_FACTOR: f64 = 1.7;
const MAX_BACKOFF_SECS: f64 = 6.0;
const BACKOFF_JITTER_SECS: f64 = 0.3;
const TRANSPORT_RETRY_MIN_MS: u64 = 500;
const TRANSPORT_RETRY_MAX_MS: u64 = 800;

pub const GEOCODE_ATTEMPTS: u32 = 3;
const GEOCODE_BACKOFF_BASE_SECS: u64 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub place_search: String,
    pub geocode: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            place_search: PLACE_SEARCH_URL.to_string(),
            geocode: GEOCODE_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlaceSearchResponse {
    #[serde(default)]
    pub items: Vec<PlaceHit>,
}

/// One local-search hit.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PlaceHit {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub link: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub telephone: String,
    #[serde(default)]
    pub address: String,
    #[serde(default, rename = "roadAddress")]
    pub road_address: String,
    #[serde(default)]
    pub mapx: String,
    #[serde(default)]
    pub mapy: String,
}

impl PlaceHit {
    /// Road address when present, otherwise the lot-number address.
    pub fn preferred_address(&self) -> Option<&str> {
        [self.road_address.trim(), self.address.trim()]
            .into_iter()
            .find(|a| !a.is_empty())
    }

    pub fn coordinate(&self) -> Option<Coordinate> {
        if self.mapx.is_empty() || self.mapy.is_empty() {
            return None;
        }
        decode_map_xy(&self.mapx, &self.mapy)
    }

    pub fn category_text(&self) -> Option<&str> {
        let category = self.category.trim();
        (!category.is_empty()).then_some(category)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeocodeResponse {
    #[serde(default, rename = "errorMessage")]
    pub error_message: String,
    #[serde(default)]
    pub addresses: Vec<GeocodeAddress>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeocodeAddress {
    /// Longitude as a decimal string.
    #[serde(default)]
    pub x: String,
    /// Latitude as a decimal string.
    #[serde(default)]
    pub y: String,
}

impl GeocodeAddress {
    pub fn coordinate(&self) -> Option<Coordinate> {
        let lat: f64 = self.y.trim().parse().ok()?;
        let lng: f64 = self.x.trim().parse().ok()?;
        let coordinate = Coordinate::new(lat, lng);
        coordinate.is_plausible().then_some(coordinate)
    }
}

/// External lookup client. Each instance owns its key queue, so one worker's
/// discarded keys never affect another's.
pub struct EnrichClient {
    transport: Arc<dyn HttpTransport>,
    keys: KeyPool,
    map_key: Option<ApiKeyPair>,
    endpoints: Endpoints,
    worker: Option<usize>,
}

impl EnrichClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        keys: KeyPool,
        map_key: Option<ApiKeyPair>,
        endpoints: Endpoints,
    ) -> Self {
        Self {
            transport,
            keys,
            map_key,
            endpoints,
            worker: None,
        }
    }

    pub fn for_worker(mut self, worker: usize) -> Self {
        self.worker = Some(worker);
        self
    }

    pub fn keys(&self) -> &KeyPool {
        &self.keys
    }

    /// First place-search hit for `query`, or `None` when the provider has no match.
    ///
    /// Fails only when no usable key remains.
    pub async fn place_search(&mut self, query: &str) -> Result<Option<PlaceHit>, EnrichError> {
        let query = clean_search_query(query);

        if self.keys.is_empty() {
            return Err(if self.keys.is_exhausted() {
                EnrichError::KeysExhausted
            } else {
                error!(worker = ?self.worker, "no place-search credentials configured");
                EnrichError::NoKeys
            });
        }

        while let Some(key) = self.keys.head().cloned() {
            let request = HttpRequest::get(&self.endpoints.place_search)
                .query("query", &query)
                .query("display", "1")
                .header("X-Naver-Client-Id", &key.client_id)
                .header("X-Naver-Client-Secret", &key.client_secret);

            let mut strikes = 0u32;
            let mut backoff = INITIAL_BACKOFF_SECS;

            loop {
                info!(
                    worker = ?self.worker,
                    key = %key.masked_id(),
                    keys_left = self.keys.len(),
                    query = %query,
                    "place search"
                );

                let response = match self.send_with_transport_retry(&request).await {
                    Ok(response) => response,
                    Err(err) => {
                        warn!(key = %key.masked_id(), error = %err, "retry failed; discarding key");
                        self.keys.discard_head();
                        break;
                    }
                };

                if response.status == StatusCode::TOO_MANY_REQUESTS {
                    strikes += 1;
                    if strikes >= STRIKE_LIMIT {
                        warn!(key = %key.masked_id(), strikes, "rate limited; discarding key");
                        self.keys.discard_head();
                        break;
                    }
                    let pause = rate_limit_pause(backoff);
                    warn!(
                        key = %key.masked_id(),
                        strikes,
                        wait_secs = pause.as_secs_f64(),
                        "rate limited; backing off"
                    );
                    tokio::time::sleep(pause).await;
                    backoff *= BACKOFF_FACTOR;
                    continue;
                }

                if response.status != StatusCode::OK {
                    warn!(
                        key = %key.masked_id(),
                        status = response.status.as_u16(),
                        "place search rejected; discarding key"
                    );
                    self.keys.discard_head();
                    break;
                }

                let body: PlaceSearchResponse = serde_json::from_slice(&response.body)?;
                return Ok(body.items.into_iter().next());
            }
        }

        error!(worker = ?self.worker, query = %query, "all place-search keys exhausted");
        Err(EnrichError::KeysExhausted)
    }

    async fn send_with_transport_retry(
        &self,
        request: &HttpRequest,
    ) -> Result<FetchedResponse, FetchError> {
        match self.transport.send(request).await {
            Ok(response) => Ok(response),
            Err(err) => {
                warn!(error = %err, "place search transport failure; retrying once");
                tokio::time::sleep(transport_retry_pause()).await;
                self.transport.send(request).await
            }
        }
    }

    /// Coordinates for an address from the geocode provider.
    ///
    /// 429 is retried with exponential backoff; any other failure aborts.
    pub async fn geocode(&self, address: &str) -> Result<Option<Coordinate>, EnrichError> {
        let Some(map_key) = &self.map_key else {
            debug!(address, "geocode credentials not configured");
            return Ok(None);
        };

        let request = HttpRequest::get(&self.endpoints.geocode)
            .query("query", address)
            .header("x-ncp-apigw-api-key-id", &map_key.client_id)
            .header("x-ncp-apigw-api-key", &map_key.client_secret);

        for attempt in 0..GEOCODE_ATTEMPTS {
            let response = self.transport.send(&request).await.map_err(|err| {
                warn!(address, error = %err, "geocode failed");
                err
            })?;

            if response.status == StatusCode::TOO_MANY_REQUESTS {
                if attempt + 1 == GEOCODE_ATTEMPTS {
                    break;
                }
                let wait = Duration::from_secs(GEOCODE_BACKOFF_BASE_SECS << attempt);
                warn!(
                    address,
                    attempt = attempt + 1,
                    wait_secs = wait.as_secs(),
                    "geocode rate limited; retrying"
                );
                tokio::time::sleep(wait).await;
                continue;
            }

            if response.status != StatusCode::OK {
                warn!(address, status = response.status.as_u16(), "geocode rejected");
                return Err(status_error(&response));
            }

            let body: GeocodeResponse = serde_json::from_slice(&response.body)?;
            if body.addresses.is_empty() {
                debug!(address, message = %body.error_message, "geocode found no address");
                return Ok(None);
            }
            return Ok(body.addresses.first().and_then(GeocodeAddress::coordinate));
        }

        error!(address, "geocode retries exhausted");
        Err(EnrichError::Transport(FetchError::HttpStatus {
            status: StatusCode::TOO_MANY_REQUESTS.as_u16(),
            url: self.endpoints.geocode.clone(),
        }))
    }
}

fn status_error(response: &FetchedResponse) -> EnrichError {
    EnrichError::Transport(FetchError::HttpStatus {
        status: response.status.as_u16(),
        url: response.final_url.clone(),
    })
}

fn rate_limit_pause(backoff_secs: f64) -> Duration {
    let jitter = rand::thread_rng().gen_range(0.0..BACKOFF_JITTER_SECS);
    Duration::from_secs_f64(backoff_secs.min(MAX_BACKOFF_SECS) + jitter)
}

fn transport_retry_pause() -> Duration {
    let ms = rand::thread_rng().gen_range(TRANSPORT_RETRY_MIN_MS..=TRANSPORT_RETRY_MAX_MS);
    Duration::from_millis(ms)
}
