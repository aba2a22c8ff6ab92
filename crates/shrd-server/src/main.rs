//! Shared DASD server: entry point.
//!
//! Loads the TOML configuration, opens every configured device, and serves
//! them to remote emulator instances until Ctrl-C.
//!
//! # Usage
//!
//! ```text
//! shrd-server [OPTIONS]
//!
//! Options:
//!   --config <PATH>      Configuration file [default: shrd-server.toml]
//!   --bind <ADDR>        Override [server] bind_address
//!   --port <PORT>        Override [server] port
//!   --trace <N>          Keep the last N requests and log them at shutdown
//! ```
//!
//! # Environment variable overrides
//!
//! | Variable           | Description                        |
//! |--------------------|------------------------------------|
//! | `SHRD_CONFIG`      | Configuration file path            |
//! | `SHRD_BIND`        | Bind address                       |
//! | `SHRD_PORT`        | Listener port                      |
//! | `SHRD_TRACE`       | Trace ring size                    |
//! | `RUST_LOG`         | `tracing` filter, overrides config |

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use shrd_server::infrastructure::device::handler_for;
use shrd_server::infrastructure::storage::config::load_config;
use shrd_server::{start, DeviceRegistry};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Shared DASD server.
#[derive(Debug, Parser)]
#[command(
    name = "shrd-server",
    about = "Serves emulated disk devices to remote emulator instances",
    version
)]
struct Cli {
    /// Path to the TOML configuration file.  A missing file means defaults.
    #[arg(long, default_value = "shrd-server.toml", env = "SHRD_CONFIG")]
    config: PathBuf,

    /// IP address to bind to, overriding the configuration.
    #[arg(long, env = "SHRD_BIND")]
    bind: Option<String>,

    /// TCP port to listen on, overriding the configuration.
    #[arg(long, env = "SHRD_PORT")]
    port: Option<u16>,

    /// Size of the request trace ring, overriding the configuration.
    #[arg(long, env = "SHRD_TRACE")]
    trace: Option<usize>,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    // Level is overridden by `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.server.log_level)),
        )
        .init();

    info!("shared device server starting");

    let registry = Arc::new(DeviceRegistry::new(config.sharing.to_settings()));
    registry
        .trace()
        .resize(cli.trace.unwrap_or(config.server.trace_size));

    for entry in &config.devices {
        let (devnum, handler) = handler_for(entry)?;
        registry
            .register(devnum, handler)
            .with_context(|| format!("failed to open device {}", entry.devnum))?;
    }
    if config.devices.is_empty() {
        warn!("no devices configured; every CONNECT will be refused");
    }

    let bind = cli.bind.unwrap_or(config.server.bind_address);
    let port = cli.port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{bind}:{port}")
        .parse()
        .with_context(|| format!("invalid bind address {bind}:{port}"))?;

    let server = start(addr, Arc::clone(&registry)).await?;
    info!("serving {} device(s).  Press Ctrl-C to exit.", registry.devices().len());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutdown signal received");

    let trace = Arc::clone(server.trace());
    server.shutdown().await;
    for entry in trace.snapshot() {
        info!("trace: {entry}");
    }
    registry.close_all();

    info!("shared device server stopped");
    Ok(())
}
