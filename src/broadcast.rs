//! Concurrent fan-out of events to every registered subscriber.

use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};

use crate::models::{ConnectionId, DeliveryReport, Event};
use crate::registry::{Connection, ConnectionRegistry};
use crate::transport::{TransportError, CLOSE_INTERNAL_ERROR};

/// Delivers events to all registered connections and evicts the dead ones.
#[derive(Clone)]
pub struct BroadcastEngine {
    registry: ConnectionRegistry,
    deadline: Duration,
}

impl BroadcastEngine {
    /// Create an engine whose publish calls wait at most `deadline` for sends.
    pub fn new(registry: ConnectionRegistry, deadline: Duration) -> Self {
        Self { registry, deadline }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Deliver `event` to every registered connection.
    ///
    /// Never fails: per-connection errors are folded into the report and the
    /// affected connections are evicted before returning.
    pub async fn publish(&self, event: &Event) -> DeliveryReport {
        self.deliver(event, None).await
    }

    /// Deliver `event` to every registered connection except `origin`.
    pub async fn publish_except(&self, event: &Event, origin: ConnectionId) -> DeliveryReport {
        self.deliver(event, Some(origin)).await
    }

    async fn deliver(&self, event: &Event, skip: Option<ConnectionId>) -> DeliveryReport {
        let payload: Arc<str> = Arc::from(event.encode());
        let targets: Vec<Connection> = self
            .registry
            .snapshot()
            .await
            .into_iter()
            .filter(|conn| Some(conn.id()) != skip)
            .collect();

        if targets.is_empty() {
            debug!(kind = %event.kind(), "no subscribers connected, nothing delivered");
            return DeliveryReport::default();
        }

        let deadline = Instant::now() + self.deadline;
        let attempts = targets.iter().map(|conn| {
            let payload = Arc::clone(&payload);
            async move {
                if conn.is_closed() {
                    return (conn, Err(TransportError::Closed));
                }
                let outcome = match timeout_at(deadline, conn.send(&payload)).await {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::TimedOut),
                };
                (conn, outcome)
            }
        });
        let outcomes = join_all(attempts).await;

        let mut report = DeliveryReport {
            attempted: outcomes.len(),
            ..DeliveryReport::default()
        };
        let mut failed = Vec::new();
        for (conn, outcome) in outcomes {
            match outcome {
                Ok(()) => report.succeeded += 1,
                Err(error) => {
                    debug!(connection_id = %conn.id(), %error, "delivery failed");
                    report.failed += 1;
                    failed.push(conn);
                }
            }
        }

        for conn in failed {
            if self.registry.remove(conn.id()).await {
                report.evicted.push(conn.id());
            }
            conn.close_detached(CLOSE_INTERNAL_ERROR, "delivery failed");
        }

        info!(
            kind = %event.kind(),
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            evicted = report.evicted.len(),
            "broadcast completed"
        );
        report
    }
}
