//! BtleJuice proxy
//!
//! Drives the real peripheral as a BLE central and relays its GATT operations to one
//! controlling client over a WebSocket (default port 8000).

mod ipc;

use anyhow::{Context, Result};
use btlejuice_core::{AppSettings, BluerCentral, RelayConfig, RelayEngine};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "btlejuice-proxy")]
#[command(about = "BLE GATT relay proxy", long_about = None)]
#[command(version)]
struct Cli {
    /// WebSocket listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Bluetooth adapter to use as central (e.g. hci0)
    #[arg(short = 'i', long)]
    adapter: Option<String>,

    /// Seconds allowed for attribute discovery
    #[arg(long)]
    discovery_timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // core logs through the log crate
    let _ = tracing_log::LogTracer::init();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,btlejuice_core=debug")),
        )
        .try_init();

    let cli = Cli::parse();
    let mut settings = AppSettings::load().proxy;
    if let Some(listen) = cli.listen {
        settings.listen = listen;
    }
    if cli.adapter.is_some() {
        settings.adapter = cli.adapter;
    }
    if let Some(secs) = cli.discovery_timeout {
        settings.discovery_timeout_secs = secs;
    }

    tracing::info!("BtleJuice proxy starting...");

    let listener = TcpListener::bind(&settings.listen)
        .await
        .with_context(|| format!("cannot listen on {}", settings.listen))?;
    tracing::info!("Listening on ws://{}", settings.listen);

    let (central, central_events) =
        BluerCentral::new(settings.adapter.as_deref(), settings.default_mtu).await?;
    let engine = RelayEngine::new(
        Arc::new(central),
        RelayConfig {
            discovery_timeout: Duration::from_secs(settings.discovery_timeout_secs),
        },
    );

    let (commands_tx, commands_rx) = mpsc::channel(64);
    let engine_handle = tokio::spawn(engine.run(commands_rx, central_events));
    let server_handle = tokio::spawn(ipc::run_ws_server(listener, commands_tx));

    tokio::select! {
        res = engine_handle => {
            tracing::error!("Relay engine exited: {:?}", res);
        }
        res = server_handle => {
            tracing::error!("WebSocket server exited: {:?}", res);
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
    }

    Ok(())
}
