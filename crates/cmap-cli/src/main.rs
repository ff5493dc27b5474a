use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cmap_storage::PgStore;
use cmap_sync::{maybe_build_scheduler, SourceRegistry, SyncConfig, SyncPipeline};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cmap-cli")]
#[command(about = "Campaign map scraper: scrape, enrich and store campaign listings")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once for a single source.
    Run {
        /// Source id, e.g. `reviewnote` or `inflexer`.
        source: String,
        #[arg(long)]
        keyword: Option<String>,
        /// Use an in-memory store and skip alert delivery.
        #[arg(long)]
        dry_run: bool,
    },
    /// Run every job in sources.yaml on the configured cron until Ctrl-C.
    Schedule,
    /// Apply pending database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("cmap=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let cancel = CancellationToken::new();
    spawn_ctrl_c(cancel.clone());

    match cli.command {
        Commands::Run {
            source,
            keyword,
            dry_run,
        } => {
            let pipeline = if dry_run {
                SyncPipeline::dry_run(config)?
            } else {
                SyncPipeline::connect(config).await?
            };
            let summary = pipeline
                .run_source(&source, keyword.as_deref(), &cancel)
                .await?;
            println!("sync complete: {summary}");
            println!("enrich: {}", summary.enrich_stats);
        }
        Commands::Schedule => {
            let registry = SourceRegistry::load(&config.sources_path()).await?;
            let pipeline = Arc::new(SyncPipeline::connect(config).await?);
            let Some(mut sched) =
                maybe_build_scheduler(pipeline, registry, cancel.clone()).await?
            else {
                warn!("scheduler disabled; set CMAP_SCHEDULER_ENABLED=true");
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; Ctrl-C to stop");
            cancel.cancelled().await;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
    }

    Ok(())
}

fn spawn_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            cancel.cancel();
        }
    });
}
