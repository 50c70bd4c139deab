//! `macwatchd`: watches a capture directory and writes a vendor report for
//! every Kismet capture dropped into it.

mod kismet;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use macwatch_config::util::millis;
use macwatch_config::{ConfigLoad, ConfigLoader, ConfigLoaderOptions};
use macwatch_core::{
    EnrichmentProcessor, FileProcessor, IngestPipeline, OutputLayout,
    PipelineConfig, RateLimitedClient, VendorKey,
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::kismet::KismetSource;

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "macwatchd")]
#[command(
    about = "Watch a directory for Kismet captures and resolve device vendors"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct RunArgs {
    /// Config file (TOML or JSON)
    #[arg(short, long, env = "MACWATCH_CONFIG_PATH", global = true)]
    config: Option<PathBuf>,

    /// Env file to load instead of ./.env
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Directory to watch (overrides config)
    #[arg(short, long)]
    watch_dir: Option<PathBuf>,

    /// Rescan cadence, e.g. "5m" (overrides config)
    #[arg(long, value_parser = humantime::parse_duration)]
    rescan_interval: Option<Duration>,

    /// Minimum spacing between vendor lookups, e.g. "3s" (overrides config)
    #[arg(long, value_parser = humantime::parse_duration)]
    min_interval: Option<Duration>,

    /// Queue capacity (clamped to the hard ceiling)
    #[arg(long)]
    queue_size: Option<usize>,

    /// Where enriched captures are moved
    #[arg(long)]
    processed_dir: Option<PathBuf>,

    /// Where captures that failed processing are moved
    #[arg(long)]
    failed_dir: Option<PathBuf>,

    /// Where vendor reports are written (defaults to the watch directory)
    #[arg(long)]
    report_dir: Option<PathBuf>,

    /// Skip the startup capacity probe even if a probe key is configured
    #[arg(long, default_value_t = false)]
    skip_probe: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load and validate configuration, print the effective settings and exit
    Check,
    /// Enrich a single capture file and exit
    Process {
        /// Capture file to process
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn,reqwest=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_runtime_config(&cli.run)?;

    match cli.command {
        Some(Command::Check) => {
            let rendered = serde_json::to_string_pretty(&config)
                .context("failed to render configuration")?;
            println!("{rendered}");
            Ok(())
        }
        Some(Command::Process { path }) => process_one(&config, path).await,
        None => run_watcher(config, cli.run.skip_probe).await,
    }
}

fn load_runtime_config(args: &RunArgs) -> anyhow::Result<PipelineConfig> {
    let ConfigLoad {
        config,
        warnings,
        source,
    } = ConfigLoader::with_options(ConfigLoaderOptions {
        config_path: args.config.clone(),
        env_file: args.env_file.clone(),
    })
    .load_with(|config| apply_cli_overrides(args, config))
    .context("failed to load configuration")?;

    match &source {
        Some(path) => info!(path = %path.display(), "configuration file loaded"),
        None => info!("no configuration file found, using defaults and environment"),
    }
    for warning in warnings {
        warn!(message = %warning, "configuration warning");
    }

    info!(
        watch.root = %config.watch.root.display(),
        watch.extension = %config.watch.extension,
        queue.capacity = config.queue.effective_capacity(),
        lookup.min_interval_ms = config.lookup.min_interval_ms,
        lookup.max_interval_ms = config.lookup.max_interval_ms,
        lookup.failure_threshold = config.lookup.failure_threshold,
        lookup.authenticated = config.lookup.api_key.is_some(),
        "configuration in effect"
    );
    Ok(config)
}

/// Flags win over the file and the environment but still go through
/// validation.
fn apply_cli_overrides(args: &RunArgs, config: &mut PipelineConfig) {
    if let Some(dir) = &args.watch_dir {
        config.watch.root = dir.clone();
    }
    if let Some(every) = args.rescan_interval {
        config.watch.rescan_interval_ms = millis(every);
    }
    if let Some(interval) = args.min_interval {
        config.lookup.min_interval_ms = millis(interval);
    }
    if let Some(size) = args.queue_size {
        config.queue.max_size = size;
    }
    if let Some(dir) = &args.processed_dir {
        config.output.processed_dir = Some(dir.clone());
    }
    if let Some(dir) = &args.failed_dir {
        config.output.failed_dir = Some(dir.clone());
    }
    if let Some(dir) = &args.report_dir {
        config.output.report_dir = Some(dir.clone());
    }
}

fn build_processor(
    config: &PipelineConfig,
) -> anyhow::Result<(
    Arc<RateLimitedClient>,
    EnrichmentProcessor<KismetSource>,
)> {
    let client = Arc::new(
        RateLimitedClient::from_config(&config.lookup)
            .context("failed to build vendor lookup client")?,
    );
    let layout = OutputLayout::resolve(&config.output, &config.watch.root);
    let processor =
        EnrichmentProcessor::new(KismetSource, Arc::clone(&client), layout);
    Ok((client, processor))
}

async fn process_one(
    config: &PipelineConfig,
    path: PathBuf,
) -> anyhow::Result<()> {
    let (client, processor) = build_processor(config)?;
    processor
        .process(&path)
        .await
        .with_context(|| format!("failed to process {}", path.display()))?;

    let stats = client.stats().await;
    info!(
        cached = stats.cached,
        not_found = stats.negative_cached,
        circuit = ?stats.circuit,
        "capture processed"
    );
    Ok(())
}

async fn run_watcher(
    config: PipelineConfig,
    skip_probe: bool,
) -> anyhow::Result<()> {
    let (client, processor) = build_processor(&config)?;

    if !skip_probe && let Some(raw) = &config.lookup.probe_key {
        match VendorKey::parse(raw) {
            Ok(key) => {
                if client.probe_capacity(&key).await.is_none() {
                    warn!("capacity probe did not complete, keeping defaults");
                }
            }
            Err(err) => warn!(error = %err, "ignoring invalid probe key"),
        }
    }

    let pipeline = IngestPipeline::start(&config, Arc::new(processor))
        .await
        .context("failed to start ingest pipeline")?;
    let token = pipeline.shutdown_token();

    tokio::select! {
        _ = shutdown_signal() => info!("shutdown signal received"),
        _ = token.cancelled() => {}
    }

    let stats = pipeline.shutdown().await?;
    let lookups = client.stats().await;
    info!(
        processed = stats.processed,
        errors = stats.errored,
        moved_back = stats.moved_back,
        vendors_cached = lookups.cached,
        circuit_trips = lookups.times_opened,
        retry_pending = lookups.retry_pending,
        "macwatchd stopped"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
