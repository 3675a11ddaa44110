//! WebSocket server
//!
//! Accepts TCP connections, upgrades them to WebSocket and hands each to
//! its own task. All connections share one [`Dispatcher`].
//!
//! ```text
//!                    GatewayServer
//!                         │
//!         ┌───────────────┼───────────────┐
//!         │               │               │
//!      client A        client B        client C
//!      (conn-1)        (conn-2)        (conn-3)
//!         │               │               │
//!         └───────────────┴───────────────┘
//!                         │
//!                     Dispatcher
//!        (sessions, admission, in-flight, results)
//! ```

pub mod admission;
pub mod cache;
mod connection;
pub mod dispatcher;
pub mod inflight;
pub mod protocol;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::TcpListener;
use tracing::{error, info, warn, Instrument};

use crate::config::ServerConfig;

pub use admission::{AdmissionController, AdmissionError, AdmissionTicket, Capacity, Permit, PermitPool, PoolStats};
pub use cache::ResultCache;
pub use dispatcher::Dispatcher;
pub use inflight::{Claim, InFlightGuard, InFlightTable};
pub use protocol::{close_code, CallToolRequest, ClientMessage, ProtocolError, ServerMessage};

const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Process-unique connection identifier, shown as `conn-N`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Next identifier
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// Raw counter value
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

struct ConnectionState {
    peer: SocketAddr,
    connected_at: std::time::Instant,
    abort_handle: tokio::task::AbortHandle,
}

/// Snapshot of one open connection
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    /// Remote address
    pub peer: SocketAddr,
    /// Seconds since accept
    pub uptime_secs: u64,
}

/// Accept loop and connection bookkeeping
pub struct GatewayServer {
    dispatcher: Arc<Dispatcher>,
    config: ServerConfig,
    connections: Arc<DashMap<ConnectionId, ConnectionState>>,
}

impl GatewayServer {
    /// Serve `dispatcher` with the listener settings in `config`
    pub fn new(dispatcher: Arc<Dispatcher>, config: ServerConfig) -> Self {
        Self {
            dispatcher,
            config,
            connections: Arc::new(DashMap::new()),
        }
    }

    /// Bind the configured host and port
    ///
    /// # Errors
    ///
    /// Propagates the bind failure (address in use, permission denied).
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        info!(addr = %listener.local_addr()?, "Listening");
        Ok(listener)
    }

    /// Shared dispatcher
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Accept until `shutdown` is set, then close every connection
    pub async fn run(&self, listener: TcpListener, shutdown: Arc<AtomicBool>) {
        info!(max_connections = self.config.max_connections, "Accepting connections");

        loop {
            if shutdown.load(Ordering::SeqCst) {
                info!("Shutdown requested, stopping accept loop");
                break;
            }

            // Accept with timeout to allow checking the shutdown flag
            let (stream, peer) = match tokio::time::timeout(ACCEPT_POLL, listener.accept()).await {
                Ok(Ok(accepted)) => accepted,
                Ok(Err(e)) => {
                    error!(error = %e, "Accept failed");
                    continue;
                }
                Err(_) => continue,
            };

            if self.connections.len() >= self.config.max_connections {
                warn!(peer = %peer, "Connection limit reached, rejecting new connection");
                drop(stream);
                continue;
            }
            let _ = stream.set_nodelay(true);

            let conn_id = ConnectionId::new();
            info!(
                conn_id = %conn_id,
                peer = %peer,
                active_connections = self.connections.len() + 1,
                "New connection accepted"
            );

            let connections = Arc::clone(&self.connections);
            let dispatcher = Arc::clone(&self.dispatcher);
            let config = self.config.clone();
            let (registered_tx, registered_rx) = tokio::sync::oneshot::channel::<()>();
            let task = tokio::spawn(
                async move {
                    // Removal below must not race the insert
                    let _ = registered_rx.await;
                    connection::handle_connection(stream, peer, dispatcher, config).await;
                    connections.remove(&conn_id);
                }
                .instrument(tracing::info_span!("connection", %conn_id)),
            );

            self.connections.insert(
                conn_id,
                ConnectionState {
                    peer,
                    connected_at: std::time::Instant::now(),
                    abort_handle: task.abort_handle(),
                },
            );
            let _ = registered_tx.send(());
        }

        self.shutdown().await;
    }

    async fn shutdown(&self) {
        info!("Initiating graceful shutdown");

        let conn_ids: Vec<ConnectionId> = self.connections.iter().map(|r| *r.key()).collect();
        for conn_id in conn_ids {
            if let Some((_, state)) = self.connections.remove(&conn_id) {
                info!(conn_id = %conn_id, "Aborting connection");
                state.abort_handle.abort();
            }
        }

        // Wait a bit for handlers to finish
        tokio::time::sleep(ACCEPT_POLL).await;
        info!("Shutdown complete");
    }

    /// Open connections
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Per-connection statistics
    pub fn connection_stats(&self) -> Vec<(ConnectionId, ConnectionStats)> {
        let mut stats: Vec<_> = self
            .connections
            .iter()
            .map(|r| {
                (
                    *r.key(),
                    ConnectionStats {
                        peer: r.value().peer,
                        uptime_secs: r.value().connected_at.elapsed().as_secs(),
                    },
                )
            })
            .collect();
        stats.sort_by_key(|(id, _)| *id);
        stats
    }
}
