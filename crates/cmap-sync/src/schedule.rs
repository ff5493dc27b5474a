use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use cmap_adapters::{adapter_for_source, known_sources};
use serde::Deserialize;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{SyncPipeline, SyncRunSummary};

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub jobs: Vec<SourceJob>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceJob {
    pub source: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub keywords: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

/// One scheduled run: a source and an optional keyword.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedRun {
    pub source: String,
    pub keyword: Option<String>,
}

impl SourceRegistry {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing source registry")?;
        for job in &registry.jobs {
            let adapter = adapter_for_source(&job.source).with_context(|| {
                format!(
                    "unknown source {:?}; expected one of {:?}",
                    job.source,
                    known_sources()
                )
            })?;
            if job.enabled && adapter.requires_keyword() && job.keywords.is_empty() {
                anyhow::bail!("source {} needs at least one keyword", job.source);
            }
        }
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Enabled jobs expanded to one run per keyword.
    pub fn planned_runs(&self) -> Vec<PlannedRun> {
        self.jobs
            .iter()
            .filter(|job| job.enabled)
            .flat_map(|job| {
                let keywords: Vec<Option<String>> = if job.keywords.is_empty() {
                    vec![None]
                } else {
                    job.keywords.iter().cloned().map(Some).collect()
                };
                keywords.into_iter().map(|keyword| PlannedRun {
                    source: job.source.clone(),
                    keyword,
                })
            })
            .collect()
    }
}

/// Run every planned run in order. A failed run is logged and the rest continue.
pub async fn run_registry(
    pipeline: &SyncPipeline,
    registry: &SourceRegistry,
    cancel: &CancellationToken,
) -> Vec<SyncRunSummary> {
    let mut summaries = Vec::new();
    for run in registry.planned_runs() {
        if cancel.is_cancelled() {
            warn!("cancelled; skipping remaining scheduled runs");
            break;
        }
        match pipeline
            .run_source(&run.source, run.keyword.as_deref(), cancel)
            .await
        {
            Ok(summary) => {
                info!(%summary, "scheduled run finished");
                summaries.push(summary);
            }
            Err(err) => {
                error!(source = %run.source, keyword = ?run.keyword, error = ?err, "scheduled run failed");
            }
        }
    }
    summaries
}

/// Cron job running the whole registry. `None` when scheduling is disabled.
pub async fn maybe_build_scheduler(
    pipeline: Arc<SyncPipeline>,
    registry: SourceRegistry,
    cancel: CancellationToken,
) -> Result<Option<JobScheduler>> {
    if !pipeline.config().scheduler_enabled {
        return Ok(None);
    }

    let cron = pipeline.config().sync_cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let registry = Arc::new(registry);
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = pipeline.clone();
        let registry = registry.clone();
        let cancel = cancel.clone();
        Box::pin(async move {
            info!(runs = registry.planned_runs().len(), "scheduled sync triggered");
            run_registry(&pipeline, &registry, &cancel).await;
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY: &str = r#"
jobs:
  - source: reviewnote
  - source: inflexer
    keywords: ["강남", "성수"]
  - source: inflexer
    enabled: false
    keywords: ["판교"]
"#;

    #[test]
    fn expands_keywords_into_runs() {
        let registry = SourceRegistry::from_yaml(REGISTRY).unwrap();
        let runs = registry.planned_runs();
        assert_eq!(
            runs,
            vec![
                PlannedRun {
                    source: "reviewnote".into(),
                    keyword: None
                },
                PlannedRun {
                    source: "inflexer".into(),
                    keyword: Some("강남".into())
                },
                PlannedRun {
                    source: "inflexer".into(),
                    keyword: Some("성수".into())
                },
            ]
        );
    }

    #[test]
    fn rejects_unknown_sources_and_missing_keywords() {
        let err = SourceRegistry::from_yaml("jobs:\n  - source: mystery\n").unwrap_err();
        assert!(format!("{err:#}").contains("unknown source"));

        let err = SourceRegistry::from_yaml("jobs:\n  - source: inflexer\n").unwrap_err();
        assert!(err.to_string().contains("needs at least one keyword"));

        assert!(SourceRegistry::from_yaml("jobs:\n  - source: inflexer\n    enabled: false\n").is_ok());
    }

    #[tokio::test]
    async fn workspace_registry_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../sources.yaml");
        let registry = SourceRegistry::load(&path).await.unwrap();
        assert!(!registry.planned_runs().is_empty());
    }

    #[tokio::test]
    async fn scheduler_is_skipped_when_disabled() {
        let pipeline = SyncPipeline::dry_run(crate::SyncConfig::from_lookup(|_| None)).unwrap();
        let registry = SourceRegistry::from_yaml(REGISTRY).unwrap();
        let sched = maybe_build_scheduler(Arc::new(pipeline), registry, CancellationToken::new())
            .await
            .unwrap();
        assert!(sched.is_none());
    }
}
