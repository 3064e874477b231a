//! Reference session registry for Duet.
//!
//! Every WebSocket connection that sends `register` is given a fresh session
//! id. `callUser` and `answerCall` messages are forwarded to the connection
//! holding the target id, stamped with the sender's own id. Nothing is
//! persisted; a session id lives exactly as long as its connection.

#![forbid(unsafe_code)]

pub mod signal;

use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use signal::ConnectionMap;

pub const DEFAULT_MAX_CONNECTIONS: usize = 4096;
pub const DEFAULT_OUTBOX_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy)]
pub struct RelayConfig {
    /// Concurrent WebSocket connections accepted before answering 503.
    pub max_connections: usize,
    /// Messages queued per connection before forwarding to it fails.
    pub outbox_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub connections: ConnectionMap,
    pub active: Arc<AtomicUsize>,
    pub config: RelayConfig,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            connections: ConnectionMap::default(),
            active: Arc::new(AtomicUsize::new(0)),
            config,
        }
    }

    /// Number of sessions currently holding an id.
    pub async fn session_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "Duet Relay Online" }))
        .route("/health", get(|| async { "ok" }))
        .route("/ws", get(signal::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the relay on `listener` until the task is dropped or the listener
/// fails.
pub async fn serve(listener: TcpListener, state: AppState) -> duet_common::Result<()> {
    info!("relay listening on {}", listener.local_addr()?);
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
