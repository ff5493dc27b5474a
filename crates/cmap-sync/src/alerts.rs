use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::SyncConfig;

pub const ALERTS_PATH: &str = "/v1/internal/process-campaign-alerts";
const ALERT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize)]
struct AlertRequest<'a> {
    campaign_ids: &'a [i64],
}

/// Counts reported back by the alert service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AlertReport {
    #[serde(default)]
    pub processed_count: u64,
    #[serde(default)]
    pub alerts_created: u64,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Receiver of the new-campaign id set after a successful save.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// `Ok(None)` when nothing was sent.
    async fn notify(&self, campaign_ids: &[i64]) -> Result<Option<AlertReport>>;
}

pub struct NoopAlertSink;

#[async_trait]
impl AlertSink for NoopAlertSink {
    async fn notify(&self, campaign_ids: &[i64]) -> Result<Option<AlertReport>> {
        if !campaign_ids.is_empty() {
            info!(count = campaign_ids.len(), "alert delivery disabled; skipping");
        }
        Ok(None)
    }
}

pub struct HttpAlertSink {
    endpoint: String,
    api_key: String,
    http: reqwest::Client,
}

impl HttpAlertSink {
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(ALERT_TIMEOUT)
            .build()
            .context("building alert client")?;
        Ok(Self {
            endpoint: format!("{}{ALERTS_PATH}", base_url.trim_end_matches('/')),
            api_key: api_key.into(),
            http,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl AlertSink for HttpAlertSink {
    async fn notify(&self, campaign_ids: &[i64]) -> Result<Option<AlertReport>> {
        if campaign_ids.is_empty() {
            return Ok(None);
        }

        let resp = self
            .http
            .post(&self.endpoint)
            .header("X-API-Key", &self.api_key)
            .json(&AlertRequest { campaign_ids })
            .send()
            .await
            .with_context(|| format!("posting alerts to {}", self.endpoint))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "alert service returned non-success");
            anyhow::bail!("alert service returned {status}");
        }

        let report: AlertReport = resp.json().await.context("decoding alert response")?;
        info!(
            processed = report.processed_count,
            created = report.alerts_created,
            errors = report.errors.len(),
            "campaign alerts processed"
        );
        Ok(Some(report))
    }
}

/// HTTP sink when the alert service is enabled and configured, no-op otherwise.
pub fn alert_sink_from_config(config: &SyncConfig) -> Result<Box<dyn AlertSink>> {
    if !config.server_api_enabled || config.server_api_base_url.is_empty() {
        return Ok(Box::new(NoopAlertSink));
    }
    Ok(Box::new(HttpAlertSink::new(
        &config.server_api_base_url,
        config.server_api_key.clone(),
    )?))
}
