//! Accounting Agent - Container usage accounting
//!
//! Runs one accounting pass per invocation: replay the container agent
//! log, poll the monitoring service, or both.

use accounting_lib::{
    lifecycle::FileEventLog,
    records::{DirectoryOutbox, ImageResolver, NoImages, StaticImages},
    store::{DocumentStore, ElasticStore, MemoryStore},
    usage::CadvisorSource,
    AccountingEngine,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

use crate::config::{AgentConfig, StoreBackend, DEFAULT_CONFIG_PATH};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "accounting-agent")]
#[command(author, version, about = "Container usage accounting agent", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, short, env = "ACCOUNTING_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay new agent log events into lifecycle documents
    Replay,

    /// Sample the monitoring service and write accounting records
    Poll,

    /// Replay, then poll, then account for containers the poll missed
    Cycle,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let cli = Cli::parse();
    let config = AgentConfig::load(&cli.config)?;
    info!(
        version = AGENT_VERSION,
        config = %cli.config.display(),
        site = config.site.as_deref().unwrap_or("-"),
        "Starting accounting-agent"
    );

    let engine = build_engine(&config)?;
    let result = run(&engine, &config, &cli.command).await;

    if let Some(path) = &config.metrics_textfile {
        if let Err(e) = write_metrics(&engine, path) {
            warn!(path = %path.display(), error = %e, "Failed to write metrics textfile");
        }
    }

    result
}

fn build_engine(config: &AgentConfig) -> Result<AccountingEngine> {
    let store: Arc<dyn DocumentStore> = match config.store.backend {
        StoreBackend::Elasticsearch => Arc::new(
            ElasticStore::new(&config.elastic_config())
                .with_context(|| format!("Invalid store url {}", config.store.url))?,
        ),
        StoreBackend::Memory => {
            warn!("Using the in-memory store; nothing is persisted");
            Arc::new(MemoryStore::new())
        }
    };

    let images: Arc<dyn ImageResolver> = if config.images.is_empty() {
        Arc::new(NoImages)
    } else {
        Arc::new(StaticImages::new(config.images.clone()))
    };

    let mut builder = AccountingEngine::builder(store)
        .config(config.engine_config()?)
        .images(images);

    if let Some(directory) = &config.outbox.directory {
        builder = builder.publisher(Arc::new(DirectoryOutbox::new(directory)));
    }

    Ok(builder.build())
}

async fn run(engine: &AccountingEngine, config: &AgentConfig, command: &Commands) -> Result<()> {
    match command {
        Commands::Replay => {
            let log = FileEventLog::new(&config.event_log.path);
            let report = engine
                .replay_lifecycle(&log)
                .await
                .context("Lifecycle replay failed")?;
            info!(
                containers = report.outcome.states.len(),
                applied = report.outcome.applied,
                ignored = report.outcome.ignored,
                lines_skipped = report.lines_skipped,
                "Replay finished"
            );
        }
        Commands::Poll => {
            let source = CadvisorSource::new(&config.cadvisor_config())
                .context("Invalid monitoring configuration")?;
            let report = engine.poll_usage(&source).await.context("Usage poll failed")?;
            info!(
                records = report.records.len(),
                samples_skipped = report.samples_skipped,
                instance_splits = report.instance_splits,
                "Poll finished"
            );
        }
        Commands::Cycle => {
            let log = FileEventLog::new(&config.event_log.path);
            let source = CadvisorSource::new(&config.cadvisor_config())
                .context("Invalid monitoring configuration")?;
            let report = engine
                .run_cycle(&log, &source)
                .await
                .context("Accounting cycle failed")?;
            info!(
                records = report.records_written(),
                lifecycle_only = report.lifecycle_only.len(),
                instance_splits = report.poll.instance_splits,
                "Cycle finished"
            );
        }
    }

    Ok(())
}

/// Write the metrics exposition next to the target and rename it into place
fn write_metrics(engine: &AccountingEngine, path: &Path) -> Result<()> {
    let rendered = engine.metrics().render().context("Failed to encode metrics")?;
    let tmp_path = path.with_extension("prom.tmp");
    std::fs::write(&tmp_path, rendered)
        .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("Failed to rename {} into place", tmp_path.display()))?;
    Ok(())
}
