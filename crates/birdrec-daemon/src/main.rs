//! birdrec Daemon - Main entry point
//!
//! Discovers recorders on the local network, runs the recording schedule and
//! serves the control API.

mod analyzer;
mod api;
mod config;
mod orchestrator;
mod scheduler;
mod server;
mod state;
mod ws;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "birdrec")]
#[command(about = "Discovery, scheduling and control for ESP32 bird recorders")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "birdrec.toml")]
    config: PathBuf,

    /// Bind address for the control API
    #[arg(short, long)]
    bind: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Run a single scan and exit
    #[arg(long)]
    scan_once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("birdrec v{}", env!("CARGO_PKG_VERSION"));

    let mut config = config::load_config(&args.config)?;

    if let Some(bind) = args.bind {
        config.daemon.bind = bind;
    }

    info!(
        mode = ?config.discovery.mode,
        service = %config.discovery.service_type,
        interval_secs = config.discovery.interval_secs,
        utc_offset = %config.schedule.utc_offset,
        "Configuration loaded"
    );

    let state = state::AppState::new(config.clone())?;

    if args.scan_once {
        info!("Running single discovery scan");
        let devices = state.scanner.scan_once().await?;
        println!("Discovered {} devices:", devices.len());
        for device in devices {
            println!("  - {}", device);
            match state.client().metadata(&device).await {
                Ok(birdrec_core::MetadataResponse::Parsed(meta)) => {
                    if let Some(version) = &meta.firmware_version {
                        println!("    Firmware: {}", version);
                    }
                    if let Some(serial) = &meta.serial_number {
                        println!("    Serial: {}", serial);
                    }
                }
                Ok(birdrec_core::MetadataResponse::Fallback(raw)) => {
                    println!("    Info: {}", raw.trim());
                }
                Err(e) => warn!(device = %device.name, error = %e, "Metadata unavailable"),
            }
        }
        return Ok(());
    }

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl-C");
                return;
            }
            info!("Shutting down");
            cancel.cancel();
        }
    });

    server::run(state, &config.daemon.bind, cancel).await
}
