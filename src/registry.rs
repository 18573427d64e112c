//! Registry of live subscriber connections.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::models::{ConnectionId, ConnectionStats, Event, RelayStats};
use crate::transport::{Transport, TransportError};

/// Upper bound on how long closing an evicted transport may take.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Handle to one subscriber link. Cloning shares the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: ConnectionId,
    transport: Arc<dyn Transport>,
    remote_addr: Option<SocketAddr>,
    connected_at: DateTime<Utc>,
    last_activity_ms: AtomicI64,
    closed: AtomicBool,
}

impl Connection {
    pub fn new(transport: Arc<dyn Transport>, remote_addr: Option<SocketAddr>) -> Self {
        let now = Utc::now();
        Self {
            inner: Arc::new(ConnectionInner {
                id: ConnectionId::new(),
                transport,
                remote_addr,
                connected_at: now,
                last_activity_ms: AtomicI64::new(now.timestamp_millis()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }

    /// Whether the link is known to be dead, without attempting a send.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire) || self.inner.transport.is_closed()
    }

    pub fn mark_closed(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    /// Record activity on the link.
    pub fn touch(&self) {
        self.inner
            .last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        let millis = self.inner.last_activity_ms.load(Ordering::Relaxed);
        DateTime::from_timestamp_millis(millis).unwrap_or(self.inner.connected_at)
    }

    /// Send a pre-encoded payload. A failed send marks the connection closed.
    pub async fn send(&self, payload: &str) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        match self.inner.transport.send_text(payload).await {
            Ok(()) => {
                self.touch();
                Ok(())
            }
            Err(e) => {
                self.mark_closed();
                Err(e)
            }
        }
    }

    /// Send a single event to this connection only.
    pub async fn send_event(&self, event: &Event) -> Result<(), TransportError> {
        self.send(&event.encode()).await
    }

    pub async fn pong(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        self.inner.transport.send_pong(payload).await
    }

    /// Close the underlying transport, waiting at most [`CLOSE_TIMEOUT`].
    pub async fn close(&self, code: u16, reason: &str) {
        self.mark_closed();
        if tokio::time::timeout(CLOSE_TIMEOUT, self.inner.transport.close(code, reason))
            .await
            .is_err()
        {
            debug!(connection_id = %self.id(), "transport close timed out");
        }
    }

    /// Close the transport in the background.
    pub fn close_detached(&self, code: u16, reason: &'static str) {
        let connection = self.clone();
        tokio::spawn(async move { connection.close(code, reason).await });
    }

    fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            id: self.id(),
            closed: self.is_closed(),
            remote_addr: self.remote_addr().map(|addr| addr.to_string()),
            connected_at: self.inner.connected_at,
            last_activity_at: self.last_activity(),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("remote_addr", &self.inner.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Authoritative set of registered connections.
///
/// Only membership changes take the write lock; sends happen on snapshots
/// and never hold it.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<ConnectionId, Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Returns `false` if it is already present.
    pub async fn add(&self, connection: Connection) -> bool {
        let id = connection.id();
        let remote = connection.remote_addr();
        let connected = {
            let mut connections = self.connections.write().await;
            if connections.contains_key(&id) {
                drop(connections);
                warn!(connection_id = %id, "duplicate registration ignored");
                return false;
            }
            connections.insert(id, connection);
            connections.len()
        };
        info!(
            connection_id = %id,
            remote = ?remote,
            delta = 1,
            connected,
            "client connected"
        );
        true
    }

    /// Deregister a connection. Removing an absent connection returns `false`.
    pub async fn remove(&self, id: ConnectionId) -> bool {
        let removed = {
            let mut connections = self.connections.write().await;
            connections
                .remove(&id)
                .map(|connection| (connection, connections.len()))
        };
        match removed {
            Some((connection, connected)) => {
                connection.mark_closed();
                info!(
                    connection_id = %id,
                    delta = -1,
                    connected,
                    "client disconnected"
                );
                true
            }
            None => {
                debug!(connection_id = %id, "connection already unregistered");
                false
            }
        }
    }

    /// Point-in-time copy of all registered connections.
    pub async fn snapshot(&self) -> Vec<Connection> {
        self.connections.read().await.values().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }

    #[cfg(test)]
    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.connections.read().await.contains_key(&id)
    }

    pub async fn get_stats(&self) -> RelayStats {
        let mut per_connection: Vec<ConnectionStats> =
            self.snapshot().await.iter().map(Connection::stats).collect();
        per_connection.sort_by_key(|stats| stats.connected_at);
        RelayStats {
            connected_clients: per_connection.len(),
            per_connection,
        }
    }
}
