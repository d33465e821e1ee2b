use anyhow::{Context, Result};
use clap::Parser;
use fleetwatch::{
    DescriptorProbe, FleetSignal, FleetWatcher, HttpInvoker, JournalStore, JsonFileSource,
    WatcherConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fleetwatch")]
#[command(about = "Watches a fleet of operation targets and supervises calls into them")]
struct Cli {
    /// Watcher configuration (JSON). Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Target list (JSON array). Overrides `auto_sync.targets_path`.
    #[arg(long)]
    targets: Option<PathBuf>,

    /// Log filter, e.g. `info` or `fleetwatch=debug`. `RUST_LOG` wins when set.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => WatcherConfig::from_file(path)
            .await
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => WatcherConfig::default(),
    };
    if let Some(targets) = cli.targets {
        config = config.targets_path(targets);
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }

    init_tracing(&config)?;

    let store = JournalStore::open(&config.database.path, config.database.compact_every)
        .await
        .with_context(|| format!("opening store at {}", config.database.path.display()))?;

    let mut builder = FleetWatcher::builder(config.clone())
        .probe(Arc::new(DescriptorProbe::default()))
        .invoker(Arc::new(HttpInvoker::new()))
        .store(Arc::new(store));
    match &config.auto_sync.targets_path {
        Some(path) => builder = builder.source(Arc::new(JsonFileSource::new(path.clone()))),
        None => warn!("no target list configured; the fleet starts empty"),
    }
    let watcher = builder.build().context("building watcher")?;

    let mut signals = watcher.subscribe();
    let signal_log = tokio::spawn(async move {
        loop {
            match signals.recv().await {
                Ok(FleetSignal::TargetDown {
                    name,
                    consecutive_failures,
                }) => warn!(target_name = %name, consecutive_failures, "target down, remediation needed"),
                Ok(FleetSignal::TargetRecovered { name }) => info!(target_name = %name, "target recovered"),
                Ok(FleetSignal::Reconciled { added, removed }) => {
                    info!(?added, ?removed, "target set changed")
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "signal log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    watcher.start().await.context("starting watcher")?;
    watcher.run_health_cycle().await;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    info!("shutdown requested");

    watcher.stop().await.context("stopping watcher")?;
    signal_log.abort();
    Ok(())
}

fn init_tracing(config: &WatcherConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .context("invalid log filter")?;

    match &config.logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}
