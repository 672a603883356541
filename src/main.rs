// ============================================================================
// PULSE CLI
// ============================================================================
// `pulse run` reads JSON-lines samples from stdin (or a file), feeds them to
// the engine and prints delivered alerts to stdout as JSON. Logs go to
// stderr (or the configured log file).
// ============================================================================

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result as AnyhowResult};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use pulse_engine::config::EngineConfig;
use pulse_engine::logging::init_logging;
use pulse_engine::{
    ChannelSink, MetricsEngine, SubmitOutcome, SubscriptionFilter, Tags, TimeWindow, Timestamp, ENGINE_NAME,
    ENGINE_VERSION,
};

#[derive(Parser, Debug)]
#[command(
    name = "pulse",
    version,
    about = "In-process metrics analysis engine",
    long_about = "Pulse ingests time-stamped metric samples, keeps bounded in-memory history, \
                  detects anomalies, trends and threshold breaches, and emits alerts."
)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "pulse.toml", env = "PULSE_CONFIG")]
    config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "PULSE_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ingest JSON-lines samples and print alerts
    Run {
        /// Read samples from this file instead of stdin
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Analyse every metric once the input is exhausted
        #[arg(short, long)]
        analyze: bool,
    },

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version
    Version,
}

/// One line of input
#[derive(Debug, Deserialize)]
struct InputSample {
    metric: String,
    value: f64,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    tags: Tags,
}

fn handle_validate(path: &Path, verbose: bool) -> AnyhowResult<()> {
    let config = EngineConfig::load(path).with_context(|| format!("Invalid configuration at {}", path.display()))?;
    println!("Configuration is valid");
    if verbose {
        println!("{}", toml::to_string_pretty(&config).context("Failed to render configuration")?);
    }
    println!("  instance:        {}", config.engine.instance_name);
    println!("  workers:         {}", config.effective_worker_count());
    println!("  retention:       {:?}", config.storage.retention);
    println!("  thresholds for:  {} metrics", config.thresholds.len());
    Ok(())
}

fn handle_generate_config(output: Option<&Path>) -> AnyhowResult<()> {
    let rendered = EngineConfig::generate_default_config();
    match output {
        Some(path) => {
            fs::write(path, &rendered).with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Default configuration written to {}", path.display());
        }
        None => println!("{rendered}"),
    }
    Ok(())
}

fn load_config(path: &Path) -> AnyhowResult<EngineConfig> {
    if path.exists() {
        EngineConfig::load(path).with_context(|| format!("Failed to load config from {}", path.display()))
    } else {
        EngineConfig::from_env().context("Failed to load config from environment")
    }
}

async fn run(config: EngineConfig, input: Option<PathBuf>, analyze: bool) -> AnyhowResult<()> {
    let engine = Arc::new(MetricsEngine::new(config).context("Failed to build engine")?);
    engine.start();

    let (tx, mut rx) = mpsc::channel(256);
    let subscription = engine
        .subscribe("stdout", SubscriptionFilter::default(), Arc::new(ChannelSink::new("stdout", tx)))
        .context("Failed to register stdout subscriber")?;
    let printer = tokio::spawn(async move {
        while let Some(alert) = rx.recv().await {
            match serde_json::to_string(&alert) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, "Failed to render alert"),
            }
        }
    });

    let reader: Box<dyn AsyncRead + Unpin + Send> = match &input {
        Some(path) => Box::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdin()),
    };
    let mut lines = BufReader::new(reader).lines();
    let (mut accepted, mut rejected, mut malformed) = (0u64, 0u64, 0u64);
    let mut interrupted = false;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let line = tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted, shutting down");
                interrupted = true;
                break;
            }
            line = lines.next_line() => line.context("Failed to read input")?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let sample: InputSample = match serde_json::from_str(&line) {
            Ok(sample) => sample,
            Err(e) => {
                malformed += 1;
                warn!(error = %e, "Skipping malformed input line");
                continue;
            }
        };
        let at = sample.timestamp.map(Timestamp::from_datetime).unwrap_or_else(Timestamp::now);
        match engine.submit_sample_at(&sample.metric, sample.value, sample.tags, at).await {
            SubmitOutcome::Accepted => accepted += 1,
            SubmitOutcome::Rejected(_) => rejected += 1,
        }
    }
    info!(accepted, rejected, malformed, "Input finished");

    if analyze && !interrupted {
        for metric in engine.get_metric_names() {
            match engine.request_analysis(&metric, TimeWindow::ShortTerm).await {
                Ok(handle) => {
                    if let Err(e) = handle.wait().await {
                        warn!(metric = %metric, error = %e, "Analysis failed");
                    }
                }
                Err(e) => warn!(metric = %metric, error = %e, "Analysis not queued"),
            }
        }
    }

    let shutdown = engine.shutdown().await;
    let stats = engine.stats();
    eprintln!("{}", engine.metrics().render());
    eprintln!("{}", serde_json::to_string_pretty(&stats).context("Failed to render stats")?);

    // The subscription holds the only sender; the printer drains and exits
    // once it is removed.
    engine.unsubscribe(&subscription);
    drop(engine);
    if tokio::time::timeout(Duration::from_secs(1), printer).await.is_err() {
        warn!("Alert printer did not finish");
    }
    shutdown.context("Engine did not stop cleanly")?;
    Ok(())
}

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Version) => {
            println!("{ENGINE_NAME} v{ENGINE_VERSION}");
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => return handle_generate_config(output.as_deref()),
        Some(Commands::Validate { verbose }) => return handle_validate(&cli.config, *verbose),
        _ => {}
    }

    let config = load_config(&cli.config)?;
    let mut logging = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging.level = level.clone();
    }
    let _guard = init_logging(&logging).context("Failed to initialize logging")?;
    info!("{} v{}", ENGINE_NAME, ENGINE_VERSION);

    let (input, analyze) = match cli.command {
        Some(Commands::Run { input, analyze }) => (input, analyze),
        _ => (None, false),
    };
    run(config, input, analyze).await
}
