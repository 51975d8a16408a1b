//! tunnelgate forward proxy.
//!
//! ```text
//!     Client ──▶ net::Listener ──▶ http::ProxyServer
//!                                    │
//!                                    ▼
//!                     RequestIdFilter → ConnectInterceptor
//!                        │                      │
//!                 plain request            CONNECT 200
//!                        ▼                      ▼
//!                  http::Forwarder        connect::Relay ◀──▶ Origin
//! ```

use std::path::PathBuf;

use clap::Parser;

use tunnelgate::config::{load_config, ProxyConfig};
use tunnelgate::lifecycle::{signal_on_terminate, Shutdown};
use tunnelgate::net::Listener;
use tunnelgate::observability::{logging, metrics};
use tunnelgate::ProxyServer;

#[derive(Parser)]
#[command(name = "tunnelgate")]
#[command(about = "Filtering HTTP forward proxy with CONNECT tunnelling", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };
    if cli.check {
        println!("configuration ok");
        return Ok(());
    }

    logging::init(&config.observability.log_level);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "tunnelgate starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        ok_waits_for_upstream = config.connect.ok_waits_for_upstream,
        idle_secs = config.timeouts.idle_secs,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        // Validation has already checked the address.
        let addr = config.observability.metrics_address.parse()?;
        metrics::init_metrics(addr);
    }

    let listener = Listener::bind(&config.listener).await?;

    let shutdown = Shutdown::new();
    tokio::spawn(signal_on_terminate(shutdown.clone()));

    ProxyServer::new(&config, shutdown).run(listener).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
