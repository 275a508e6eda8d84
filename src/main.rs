//! poolwatch CLI entry point.
//!
//! Provides `start`, `check`, and `scan` subcommands for running the watcher
//! daemon, validating configuration, or replaying an existing log offline.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{debug, info};

use poolwatch::config::{load_config, load_detection_config, WatcherConfig};
use poolwatch::logging;
use poolwatch::monitor::Monitor;
use poolwatch::notifier::WebhookNotifier;
use poolwatch::pipeline::Pipeline;

/// Env var naming the config file when `--config` is not given.
const ENV_CONFIG_PATH: &str = "POOLWATCH_CONFIG";

/// poolwatch: blue/green failover and error-rate alerts from access logs.
#[derive(Parser)]
#[command(name = "poolwatch", version, about)]
struct Cli {
    /// Path to a TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Tail the access log and send alerts until interrupted.
    Start,
    /// Validate configuration, print the effective settings, and exit.
    Check,
    /// Run detection over an existing log file without sending alerts.
    Scan {
        /// Access-log file to read from the beginning.
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // A missing .env file is fine.
    let dotenv = dotenvy::dotenv();

    let config_path = cli
        .config
        .or_else(|| std::env::var_os(ENV_CONFIG_PATH).map(PathBuf::from));

    let result = match cli.command {
        Command::Start => handle_start(config_path.as_deref()).await,
        Command::Check => handle_check(config_path.as_deref()),
        Command::Scan { file } => handle_scan(config_path.as_deref(), &file),
    };

    if let Err(e) = dotenv {
        debug!(error = %e, "no .env file loaded");
    }
    result
}

/// Run the watcher daemon.
async fn handle_start(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config_path).context("invalid configuration")?;

    let _logging_guard = match &config.logging.dir {
        Some(dir) => Some(logging::init_production(dir)?),
        None => {
            logging::init_cli()?;
            None
        }
    };

    log_effective_config(&config);

    let notifier = WebhookNotifier::new(
        config.webhook_url()?,
        config.notifier.footer.clone(),
        config.notifier_timeout(),
    )
    .context("failed to create webhook notifier")?;

    let monitor = Monitor::from_config(&config, Arc::new(notifier));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("received shutdown signal, stopping at next poll");
        if shutdown_tx.send(true).is_err() {
            debug!("monitor already stopped");
        }
    });

    monitor.run(shutdown_rx).await?;
    Ok(())
}

/// Validate configuration and print it.
fn handle_check(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config_path).context("invalid configuration")?;
    print_config(&config);
    println!("configuration OK");
    Ok(())
}

/// Replay a file through the detection pipeline and print what it finds.
fn handle_scan(config_path: Option<&Path>, file: &Path) -> anyhow::Result<()> {
    logging::init_cli()?;
    let config = load_detection_config(config_path).context("invalid configuration")?;

    let handle = std::fs::File::open(file)
        .with_context(|| format!("failed to open {}", file.display()))?;
    let mut pipeline = Pipeline::from_config(&config);

    let mut stdout = std::io::stdout().lock();
    let counters = pipeline
        .scan(BufReader::new(handle), &mut stdout)
        .with_context(|| format!("failed to scan {}", file.display()))?;

    writeln!(stdout, "{}", serde_json::to_string_pretty(&counters)?)?;
    Ok(())
}

fn log_effective_config(config: &WatcherConfig) {
    info!(
        log_path = %config.log.path.display(),
        error_rate_pct = config.thresholds.error_rate_pct,
        window_size = config.thresholds.window_size,
        cooldown_secs = config.alerts.cooldown_secs,
        maintenance_mode = config.alerts.maintenance_mode,
        primary_pool = config.alerts.primary_pool.as_deref().unwrap_or("-"),
        webhook = %config.redacted_webhook_url(),
        "poolwatch starting"
    );
}

fn print_config(config: &WatcherConfig) {
    println!("log path:          {}", config.log.path.display());
    println!("poll interval:     {}ms", config.log.poll_interval_ms);
    println!("start at end:      {}", config.log.start_at_end);
    println!("error threshold:   {}%", config.thresholds.error_rate_pct);
    println!("window size:       {} requests", config.thresholds.window_size);
    println!(
        "min requests:      {}",
        config
            .thresholds
            .min_requests
            .unwrap_or(config.thresholds.window_size)
    );
    println!("alert cooldown:    {}s", config.alerts.cooldown_secs);
    println!("maintenance mode:  {}", config.alerts.maintenance_mode);
    println!(
        "recovery:          {}",
        match &config.alerts.primary_pool {
            Some(pool) => format!("return to primary `{pool}`"),
            None => "return to previous pool".to_owned(),
        }
    );
    println!("webhook:           {}", config.redacted_webhook_url());
    println!("notifier timeout:  {}s", config.notifier.timeout_secs);
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            debug!(error = %e, "SIGTERM handler unavailable, using Ctrl-C only");
            if let Err(e) = tokio::signal::ctrl_c().await {
                debug!(error = %e, "Ctrl-C handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        debug!(error = %e, "Ctrl-C handler unavailable");
        std::future::pending::<()>().await;
    }
}
