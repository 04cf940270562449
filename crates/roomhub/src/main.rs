//! # roomhub
//!
//! roomhub server binary — parses flags, initializes logging, and runs the
//! HTTP/`WebSocket` hub until ctrl-c.

#![deny(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use roomhub_server::config::HubConfig;
use roomhub_server::server::HubServer;
use tracing_subscriber::EnvFilter;

/// Single-room WebSocket messaging hub.
#[derive(Parser, Debug)]
#[command(name = "roomhub", about = "Single-room WebSocket messaging hub")]
struct Cli {
    /// Host to bind.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind (0 for auto-assign).
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Static secret for the member-listing endpoint.
    #[arg(long)]
    secret: Option<String>,

    /// Keepalive ping interval in milliseconds.
    #[arg(long)]
    ping_interval_ms: Option<u64>,

    /// Idle timeout in milliseconds before a silent member is evicted.
    #[arg(long)]
    idle_timeout_ms: Option<u64>,
}

impl Cli {
    fn into_config(self) -> HubConfig {
        let defaults = HubConfig::default();
        HubConfig {
            host: self.host,
            port: self.port,
            secret: self.secret.unwrap_or(defaults.secret),
            ping_interval_ms: self.ping_interval_ms.unwrap_or(defaults.ping_interval_ms),
            idle_timeout_ms: self.idle_timeout_ms.unwrap_or(defaults.idle_timeout_ms),
            outbound_capacity: defaults.outbound_capacity,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Cli::parse();
    let mut server = HubServer::new(args.into_config());

    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!("roomhub listening on http://{addr} (WebSocket endpoint at /ws)");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server.shutdown().trigger();
    let _ = handle.await;
    server.join_group().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
