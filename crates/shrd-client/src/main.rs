//! Shared DASD client: diagnostic entry point.
//!
//! Connects to a shared device server and runs one diagnostic request.
//!
//! # Usage
//!
//! ```text
//! shrd-client [OPTIONS] <COMMAND>
//!
//! Commands:
//!   query <SELECTOR>   used | devchar | devid | serial | cylinders | origin | blocks | blksize
//!   read <BLOCK>       Read one track/block and print it as hex
//!   sense              Print the device's sense bytes
//!
//! Options:
//!   --config <PATH>    Configuration file [default: shrd-client.toml]
//!   --host <HOST>      Override [remote] host
//!   --port <PORT>      Override [remote] port
//!   --devnum <ADDR>    Override [remote] devnum, e.g. 0:0190
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use shrd_client::infrastructure::storage::config::load_config;
use shrd_client::{RemoteDevice, RequestEngine};
use shrd_core::protocol::QuerySelector;
use shrd_core::Cache;

// ── CLI argument definitions ──────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "shrd-client", about = "Diagnostics against a shared DASD server", version)]
struct Cli {
    /// Path to the TOML configuration file.  A missing file means defaults.
    #[arg(long, default_value = "shrd-client.toml", env = "SHRD_CLIENT_CONFIG")]
    config: PathBuf,

    #[arg(long, env = "SHRD_HOST")]
    host: Option<String>,

    #[arg(long, env = "SHRD_PORT")]
    port: Option<u16>,

    /// Device address on the server, `[lcss:]devnum` in hex.
    #[arg(long, env = "SHRD_DEVNUM")]
    devnum: Option<String>,

    #[command(subcommand)]
    command: Action,
}

#[derive(Debug, Subcommand)]
enum Action {
    /// Ask the device for one attribute.
    Query {
        #[arg(value_enum)]
        selector: Selector,
    },
    /// Read one track or block and dump it.
    Read { block: u32 },
    /// Fetch the sense bytes of the last device error.
    Sense,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Selector {
    Used,
    Devchar,
    Devid,
    Serial,
    Cylinders,
    Origin,
    Blocks,
    Blksize,
}

impl From<Selector> for QuerySelector {
    fn from(s: Selector) -> Self {
        match s {
            Selector::Used => QuerySelector::Used,
            Selector::Devchar => QuerySelector::DeviceCharacteristics,
            Selector::Devid => QuerySelector::DeviceId,
            Selector::Serial => QuerySelector::SerialNumber,
            Selector::Cylinders => QuerySelector::CkdCylinders,
            Selector::Origin => QuerySelector::FbaOrigin,
            Selector::Blocks => QuerySelector::FbaBlockCount,
            Selector::Blksize => QuerySelector::FbaBlockSize,
        }
    }
}

fn hex_dump(data: &[u8]) -> String {
    data.chunks(16)
        .enumerate()
        .map(|(row, chunk)| {
            let bytes: Vec<String> = chunk.iter().map(|b| format!("{b:02X}")).collect();
            format!("{:08X}  {}", row * 16, bytes.join(" "))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = load_config(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    if let Some(host) = cli.host {
        config.remote.host = host;
    }
    if let Some(port) = cli.port {
        config.remote.port = port;
    }
    if let Some(devnum) = cli.devnum {
        config.remote.devnum = devnum;
    }

    let engine_config = config.engine_config().context("invalid [remote] section")?;
    let devnum = engine_config.devnum;
    let addr = engine_config.addr.clone();
    let mut engine = RequestEngine::new(engine_config);
    engine
        .connect()
        .await
        .with_context(|| format!("cannot connect to {addr}"))?;
    info!("session {} on device {devnum:04X}", engine.id());

    let mut device = RemoteDevice::new(engine, devnum, Cache::new(config.cache.slots));
    let outcome = match cli.command {
        Action::Query { selector } => device
            .query(selector.into())
            .await
            .map(|data| println!("{}", hex_dump(&data))),
        Action::Read { block } => device
            .read(block)
            .await
            .map(|data| println!("{} bytes\n{}", data.len(), hex_dump(&data))),
        Action::Sense => device
            .sense()
            .await
            .map(|sense| println!("{}", hex_dump(&sense))),
    };
    device.close().await.context("failed to disconnect")?;
    outcome.context("request failed")?;
    Ok(())
}
