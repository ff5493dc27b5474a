//! Persistence and HTTP plumbing: the campaign/cache store seams with their
//! Postgres and in-memory implementations, plus the shared fetcher.

pub mod http;
pub mod memory;
pub mod postgres;
pub mod store;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, HttpRequest, HttpTransport, ReqwestTransport, RetryDisposition,
    StatusCode,
};
pub use memory::{MemoryStore, StoredCampaign};
pub use postgres::PgStore;
pub use store::{CampaignStore, EnrichmentStore, ReplaceOutcome, StoreError};

pub const CRATE_NAME: &str = "cmap-storage";
