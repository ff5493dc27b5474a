//! Pipeline orchestration: scrape, parse, enrich and save one source per run,
//! plus the alert hand-off and the cron schedule over `sources.yaml`.

pub mod alerts;
pub mod config;
pub mod pipeline;
pub mod schedule;

pub use alerts::{alert_sink_from_config, AlertReport, AlertSink, HttpAlertSink, NoopAlertSink};
pub use config::SyncConfig;
pub use pipeline::{SyncPipeline, SyncRunSummary};
pub use schedule::{maybe_build_scheduler, run_registry, PlannedRun, SourceRegistry, SourceJob};

pub const CRATE_NAME: &str = "cmap-sync";
