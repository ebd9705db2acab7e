// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Command-line demonstration host for the tracker driver core.
//!
//! # Usage
//!
//! ```bash
//! # Auto-discover the tracker and start tracking
//! ndi-trackerd
//!
//! # Use an explicit serial port
//! ndi-trackerd --port /dev/ttyUSB0
//!
//! # Using a configuration file
//! ndi-trackerd --config tracker.toml
//!
//! # Generate an example configuration file
//! ndi-trackerd gen-config --output tracker.toml
//! ```

use clap::{Parser, Subcommand};
use ndi_tracker_driver::{DriverConfig, DriverEvent};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ndi-trackerd")]
#[command(about = "NDI Polaris/Aurora tracker driver")]
#[command(version)]
struct Args {
    /// Configuration file path (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial port override (skips auto-discovery)
    #[arg(short, long)]
    port: Option<String>,

    /// Enable the stray-marker block on each tracking tick
    #[arg(long)]
    strays: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate an example configuration file
    GenConfig {
        #[arg(short, long, default_value = "tracker.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Some(cmd) = args.command {
        return match cmd {
            Commands::GenConfig { output } => cmd_gen_config(output),
            Commands::Validate { config } => cmd_validate(config),
        };
    }

    let mut config = match &args.config {
        Some(path) => DriverConfig::from_toml_file(path)?,
        None => DriverConfig::default(),
    };
    if args.strays {
        config.track_stray_markers = true;
    }

    let (driver, handle, mut events) = ndi_tracker_driver::Driver::new(config);
    let _worker = driver.spawn();

    tracing::info!("connecting...");
    handle.connect(args.port.clone()).await?;

    let event_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                DriverEvent::Connected(port) if port.is_empty() => {
                    tracing::warn!("disconnected");
                }
                DriverEvent::Connected(port) => {
                    tracing::info!(port = %port, "connected");
                }
                DriverEvent::Tracking(on) => {
                    tracing::info!(tracking = on, "tracking state changed");
                }
                DriverEvent::ToolsUpdated => {
                    tracing::info!("tool list updated");
                }
                DriverEvent::FirmwareInfo { query, value } => {
                    tracing::info!(query, value = %value, "firmware info");
                }
            }
        }
    });

    handle.toggle_tracking(true).await?;
    tracing::info!("tracking started, press Ctrl+C to stop...");

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");
    handle.toggle_tracking(false).await.ok();
    handle.disconnect().await.ok();
    event_task.abort();

    Ok(())
}

fn cmd_gen_config(output: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = DriverConfig::default();
    let toml_str = toml::to_string_pretty(&config)?;
    std::fs::write(&output, toml_str)?;
    println!("Wrote example configuration to {}", output.display());
    Ok(())
}

fn cmd_validate(path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = DriverConfig::from_toml_file(&path)?;
    println!("{} is valid ({} tool(s) configured)", path.display(), config.tools.len());
    Ok(())
}
