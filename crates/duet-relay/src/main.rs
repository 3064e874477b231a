#![forbid(unsafe_code)]

//! Duet relay - assigns session ids and forwards call signaling.

use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use duet_common::helpers::env_parse;
use duet_relay::{AppState, RelayConfig, DEFAULT_MAX_CONNECTIONS, DEFAULT_OUTBOX_CAPACITY};
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "duet-relay")]
#[command(about = "Duet relay - assigns session ids and forwards call signaling")]
struct Args {
    /// WebSocket listen address
    #[arg(long, default_value = "0.0.0.0:5000")]
    listen: SocketAddr,

    /// Maximum concurrent WebSocket connections
    #[arg(long, env = "DUET_RELAY_MAX_CONNECTIONS", default_value_t = DEFAULT_MAX_CONNECTIONS)]
    max_connections: usize,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = format!("{},hyper=warn,tower_http=info", args.log_level);
    duet_common::init_tracing_with_default(&filter);

    info!("Starting duet-relay v{}", env!("CARGO_PKG_VERSION"));

    if args.max_connections == 0 {
        return Err(duet_common::Error::config("--max-connections must be at least 1").into());
    }

    let config = RelayConfig {
        max_connections: args.max_connections,
        outbox_capacity: env_parse("DUET_RELAY_OUTBOX_CAPACITY", DEFAULT_OUTBOX_CAPACITY).max(1),
    };
    let listener = TcpListener::bind(args.listen).await?;

    tokio::select! {
        result = duet_relay::serve(listener, AppState::new(config)) => result?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}
