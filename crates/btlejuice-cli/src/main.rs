//! BtleJuice CLI
//!
//! Interception side: talks to a running `btlejuice-proxy`, clones the target onto a local
//! adapter and relays the intercepted central's operations through the edit pipeline.

mod client;
mod operator;

use anyhow::{Context, Result};
use btlejuice_core::intercept::{EditOrder, InterceptionPipeline, Mode};
use btlejuice_core::{
    AppSettings, BluerPeripheral, FakeDevice, InterceptOptions, InterceptSession, ProxyClient,
    TransactionLog,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "btlejuice", version, about = "BLE GATT interception tool")]
struct Cli {
    /// Proxy URL (default from settings: ws://127.0.0.1:8000)
    #[arg(short, long, global = true)]
    proxy: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List devices seen by the proxy
    Scan {
        /// Scan duration (seconds)
        #[arg(short, long, default_value = "10")]
        timeout: u64,
    },
    /// Clone a device and intercept its traffic
    Intercept {
        /// Target device address
        address: String,
        /// Bluetooth adapter hosting the clone (e.g. hci1)
        #[arg(short = 'i', long)]
        adapter: Option<String>,
        /// Serve attributes with fresh handles instead of the original ones
        #[arg(long)]
        no_keep_handles: bool,
        /// Do not target the device again after it disconnects
        #[arg(long)]
        no_reconnect: bool,
        /// Start in interactive mode
        #[arg(long)]
        interactive: bool,
        /// Show the newest suspended operation first
        #[arg(long)]
        lifo: bool,
        /// Record every relayed operation to this file
        #[arg(short, long)]
        log_file: Option<PathBuf>,
    },
    /// Show the proxy state
    Status,
    /// Stop the proxy's current session
    Stop,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_log::LogTracer::init();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,btlejuice_core=info")),
        )
        .try_init();

    let cli = Cli::parse();
    let mut settings = AppSettings::load().intercept;
    if let Some(proxy) = cli.proxy {
        settings.proxy_url = proxy;
    }

    match cli.command {
        Commands::Scan { timeout } => {
            println!("🔍 Scanning ({}s)...", timeout);
            let devices = client::scan(&settings.proxy_url, Duration::from_secs(timeout)).await?;
            if devices.is_empty() {
                println!("   No devices found");
            }
            for (address, hit) in &devices {
                let rssi = hit.rssi.map(|r| format!("{r} dBm")).unwrap_or_default();
                println!(
                    "   {} {} {}",
                    address,
                    hit.name.as_deref().unwrap_or("(unnamed)"),
                    rssi
                );
            }
        }
        Commands::Intercept {
            address,
            adapter,
            no_keep_handles,
            no_reconnect,
            interactive,
            lifo,
            log_file,
        } => {
            if adapter.is_some() {
                settings.adapter = adapter;
            }
            if no_keep_handles {
                settings.keep_handles = false;
            }
            if no_reconnect {
                settings.reconnect = false;
            }
            if lifo {
                settings.edit_order = EditOrder::Lifo;
            }
            if log_file.is_some() {
                settings.log_file = log_file;
            }

            let mut pipeline = InterceptionPipeline::new(settings.edit_order);
            if interactive {
                pipeline.set_mode(Mode::Interactive);
            }
            for hook in &settings.hooks {
                pipeline.set_hook(&hook.service, &hook.characteristic, hook.to_hook()?);
            }

            let log = match &settings.log_file {
                Some(path) => TransactionLog::open(path)
                    .with_context(|| format!("cannot open log file {}", path.display()))?,
                None => TransactionLog::disabled(),
            };

            let proxy = ProxyClient::connect(&settings.proxy_url)
                .await
                .with_context(|| format!("cannot connect to proxy {}", settings.proxy_url))?;
            let (peripheral, requests) = BluerPeripheral::new(settings.adapter.as_deref()).await?;
            let fake = FakeDevice::new(Box::new(peripheral), requests, settings.keep_handles);

            let (events_tx, events_rx) = mpsc::channel(64);
            let (commands_tx, commands_rx) = mpsc::channel(16);
            let session = InterceptSession::new(
                proxy,
                fake,
                pipeline,
                log,
                InterceptOptions {
                    address,
                    keep_handles: settings.keep_handles,
                    reconnect: settings.reconnect,
                },
                events_tx,
            );

            println!("🎯 Intercepting (:i interactive, :f forward, :s status, :q quit)");
            tokio::spawn(operator::run(events_rx, commands_tx));
            session.run(commands_rx).await?;
        }
        Commands::Status => {
            let state = client::status(&settings.proxy_url).await?;
            println!("Status: {}", state);
        }
        Commands::Stop => {
            client::stop(&settings.proxy_url).await?;
            println!("⏹️  Stopped");
        }
    }

    Ok(())
}
