use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Parser;
use signal_relay::{serve, RelayState, DEFAULT_PATH};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

#[derive(Parser, Debug)]
#[command(name = "signal-relay")]
#[command(about = "Broadcast WebSocket relay for rtc-probe signaling")]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "SIGNAL_RELAY_BIND", default_value = "0.0.0.0:8000")]
    bind: SocketAddr,

    /// WebSocket route
    #[arg(long, env = "SIGNAL_RELAY_PATH", default_value = DEFAULT_PATH)]
    path: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info,signal_relay=debug".into());
    let env_filter = EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new("info"));
    Registry::default()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    if !cli.path.starts_with('/') {
        anyhow::bail!("--path must start with '/', got {:?}", cli.path);
    }

    let listener = tokio::net::TcpListener::bind(cli.bind)
        .await
        .with_context(|| format!("failed to bind {}", cli.bind))?;
    info!(addr = %cli.bind, path = %cli.path, "signal relay listening");

    tokio::select! {
        result = serve(listener, RelayState::new(), &cli.path) => result.context("relay server failed")?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}
