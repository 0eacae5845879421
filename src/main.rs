// main.rs
// Description: Entry point. Sets up logging and configuration, then runs the reconciliation once or daily.

// IMPORTS AND MODS

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::prelude::*;

mod aggregate;
mod classify;
mod config;
mod enrich;
mod pipeline;
mod records;
mod retry;
mod scheduler;
mod sirix;
mod store;
mod utils;

use config::load_config;
use pipeline::run_once;
use sirix::SirixClient;
use store::StoreClient;

#[derive(Parser, Debug)]
#[command(
    name = "allocation_sync",
    version,
    about = "Reconciles CRM trading accounts into per-country plan allocation"
)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, value_name = "PATH", default_value = "config.toml")]
    config: PathBuf,

    /// Run the pipeline once and exit instead of scheduling daily runs
    #[arg(long)]
    once: bool,
}

// LOGGING

fn open_log(dir: &Path, name: &str) -> Box<dyn std::io::Write> {
    let path = dir.join(name);
    match fs::OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => Box::new(file),
        Err(_) => Box::new(std::io::sink()),
    }
}

fn init_logging(log_dir: &str) -> Result<()> {
    let dir = PathBuf::from(log_dir);
    fs::create_dir_all(&dir).with_context(|| format!("Failed to create log dir {}", log_dir))?;
    let timer = ChronoLocal::new("%Y-%m-%d %H:%M:%S %Z".to_string());

    let cmd_dir = dir.clone();
    let cmd_log = tracing_subscriber::fmt::layer()
        .with_writer(move || open_log(&cmd_dir, "cmd_log.txt"))
        .with_ansi(false)
        .with_file(true)
        .with_timer(timer.clone())
        .with_filter(tracing_subscriber::filter::LevelFilter::from_level(
            Level::INFO,
        ));
    let error_dir = dir.clone();
    let error_log = tracing_subscriber::fmt::layer()
        .with_writer(move || open_log(&error_dir, "error_log.txt"))
        .with_ansi(false)
        .with_file(true)
        .with_timer(timer.clone())
        .with_filter(tracing_subscriber::filter::LevelFilter::from_level(
            Level::ERROR,
        ));
    let run_dir = dir;
    let run_log = tracing_subscriber::fmt::layer()
        .with_writer(move || open_log(&run_dir, "run_log.txt"))
        .with_ansi(false)
        .with_timer(timer)
        .with_filter(filter_fn(|metadata| metadata.target() == "summary"));
    tracing_subscriber::registry()
        .with(cmd_log)
        .with(error_log)
        .with(run_log)
        .with(tracing_subscriber::fmt::layer().with_filter(
            tracing_subscriber::filter::LevelFilter::from_level(Level::INFO),
        ))
        .try_init()
        .map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))?;
    Ok(())
}

// MAIN FUNCTION

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = load_config(&cli.config)?;
    init_logging(&config.report.log_dir.value)?;
    info!("Starting allocation sync (config: {})", cli.config.display());

    let missing = config.missing_credentials();
    if !missing.is_empty() {
        error!("[FATAL] Missing env vars: {}", missing.join(", "));
        return Err(anyhow!("Missing required configuration: {}", missing.join(", ")));
    }

    let store = StoreClient::new(&config)?;
    let sirix = SirixClient::new(&config)?;

    if cli.once {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("[EXIT] Stopped by user.");
            }
            result = run_once(&config, &store, &sirix) => {
                result.map_err(|e| anyhow!("Run failed: {}", e))?;
            }
        }
        return Ok(());
    }

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("[EXIT] Received SIGINT, stopping scheduler.");
        }
        _ = scheduler::run_daily(&config, &store, &sirix) => {
            error!("Scheduler loop ended unexpectedly");
        }
    }
    info!("Shutdown complete");
    Ok(())
}
