//! Per-subscriber session: registration, inbound relay and teardown.

use axum::extract::ws::{Message, WebSocket};
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::broadcast::BroadcastEngine;
use crate::config::{InboundPolicy, IntakeLimits};
use crate::intake;
use crate::models::Event;
use crate::monitor::wait_for_shutdown;
use crate::registry::Connection;
use crate::transport::{
    Transport, TransportError, WsTransport, CLOSE_GOING_AWAY, CLOSE_INTERNAL_ERROR, CLOSE_NORMAL,
    CLOSE_PROTOCOL_ERROR,
};

/// Longest prefix of an inbound message written to the log.
const LOG_PREVIEW_CHARS: usize = 100;

/// A frame received from a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong,
    Close,
}

impl From<Message> for Inbound {
    fn from(message: Message) -> Self {
        match message {
            Message::Text(text) => Inbound::Text(text),
            Message::Binary(data) => Inbound::Binary(data),
            Message::Ping(data) => Inbound::Ping(data),
            Message::Pong(_) => Inbound::Pong,
            Message::Close(_) => Inbound::Close,
        }
    }
}

/// Accepts subscriber connections and runs their sessions.
#[derive(Clone)]
pub struct InboundConnectionHandler {
    engine: BroadcastEngine,
    policy: InboundPolicy,
    limits: IntakeLimits,
    welcome: Option<String>,
    shutdown: watch::Receiver<bool>,
    sessions: Arc<watch::Sender<usize>>,
}

/// Counts a running session until dropped.
struct SessionGuard(Arc<watch::Sender<usize>>);

impl SessionGuard {
    fn enter(sessions: &Arc<watch::Sender<usize>>) -> Self {
        sessions.send_modify(|active| *active += 1);
        Self(Arc::clone(sessions))
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.send_modify(|active| *active = active.saturating_sub(1));
    }
}

impl InboundConnectionHandler {
    pub fn new(
        engine: BroadcastEngine,
        policy: InboundPolicy,
        limits: IntakeLimits,
        welcome: Option<String>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (sessions, _) = watch::channel(0);
        Self {
            engine,
            policy,
            limits,
            welcome,
            shutdown,
            sessions: Arc::new(sessions),
        }
    }

    /// Number of sessions that have not finished their teardown.
    pub fn active_sessions(&self) -> usize {
        *self.sessions.borrow()
    }

    /// Wait until every session has closed its transport.
    pub async fn drain(&self) {
        let mut active = self.sessions.subscribe();
        while *active.borrow_and_update() > 0 {
            if active.changed().await.is_err() {
                return;
            }
        }
    }

    /// Run a session over an upgraded WebSocket.
    pub async fn serve_socket(&self, socket: WebSocket, remote: Option<SocketAddr>) {
        let (sink, stream) = socket.split();
        let transport = Arc::new(WsTransport::new(sink));
        let inbound = stream.map(|frame| frame.map(Inbound::from));
        self.run(transport, inbound, remote).await;
    }

    /// Run a session until the peer leaves, the stream fails or the relay shuts down.
    ///
    /// The connection is unregistered and its transport closed on every exit path.
    pub async fn run<S, E>(&self, transport: Arc<dyn Transport>, inbound: S, remote: Option<SocketAddr>)
    where
        S: Stream<Item = Result<Inbound, E>>,
        E: std::fmt::Display,
    {
        let _session = SessionGuard::enter(&self.sessions);
        let connection = Connection::new(transport, remote);
        let registry = self.engine.registry();
        if !registry.add(connection.clone()).await {
            connection.close(CLOSE_INTERNAL_ERROR, "registration failed").await;
            return;
        }

        let (code, reason) = self.relay(&connection, inbound).await;

        registry.remove(connection.id()).await;
        connection.close(code, reason).await;
        info!(connection_id = %connection.id(), remote = ?remote, code, reason, "session ended");
    }

    async fn relay<S, E>(&self, connection: &Connection, inbound: S) -> (u16, &'static str)
    where
        S: Stream<Item = Result<Inbound, E>>,
        E: std::fmt::Display,
    {
        if let Some(message) = &self.welcome {
            if let Err(e) = connection.send_event(&Event::connected(message)).await {
                warn!(connection_id = %connection.id(), error = %e, "welcome not delivered");
                return (CLOSE_INTERNAL_ERROR, "welcome failed");
            }
        }

        let mut inbound = std::pin::pin!(inbound);
        let mut shutdown = self.shutdown.clone();
        loop {
            let frame = tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => return (CLOSE_GOING_AWAY, "server shutting down"),
                frame = inbound.next() => frame,
            };

            match frame {
                Some(Ok(Inbound::Text(text))) => {
                    connection.touch();
                    if let Err(e) = self.on_text(connection, &text).await {
                        debug!(connection_id = %connection.id(), error = %e, "reply not delivered");
                        return (CLOSE_INTERNAL_ERROR, "reply failed");
                    }
                }
                Some(Ok(Inbound::Ping(payload))) => {
                    connection.touch();
                    let _ = connection.pong(payload).await;
                }
                Some(Ok(Inbound::Pong)) => connection.touch(),
                Some(Ok(Inbound::Binary(data))) => {
                    connection.touch();
                    debug!(connection_id = %connection.id(), bytes = data.len(), "ignoring binary frame");
                }
                Some(Ok(Inbound::Close)) => {
                    debug!(connection_id = %connection.id(), "client closed the connection");
                    return (CLOSE_NORMAL, "bye");
                }
                Some(Err(e)) => {
                    warn!(connection_id = %connection.id(), error = %e, "websocket receive error");
                    return (CLOSE_PROTOCOL_ERROR, "receive error");
                }
                None => return (CLOSE_NORMAL, "stream ended"),
            }
        }
    }

    async fn on_text(&self, connection: &Connection, text: &str) -> Result<(), TransportError> {
        debug!(
            connection_id = %connection.id(),
            preview = %text.chars().take(LOG_PREVIEW_CHARS).collect::<String>(),
            "message received"
        );

        let data: Value = match serde_json::from_str(text) {
            Ok(data) => data,
            Err(e) => {
                debug!(connection_id = %connection.id(), error = %e, "malformed inbound payload");
                return connection.send_event(&Event::error("Invalid JSON")).await;
            }
        };

        match self.policy {
            InboundPolicy::Echo => connection.send_event(&Event::echo(data)).await,
            InboundPolicy::Rebroadcast => match intake::relayed(data, &self.limits) {
                Ok(event) => {
                    let report = self.engine.publish_except(&event, connection.id()).await;
                    debug!(
                        connection_id = %connection.id(),
                        succeeded = report.succeeded,
                        failed = report.failed,
                        "subscriber message rebroadcast"
                    );
                    Ok(())
                }
                Err(e) => {
                    info!(connection_id = %connection.id(), error = %e, "inbound event rejected");
                    connection.send_event(&Event::error(&e.to_string())).await
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionRegistry;
    use crate::transport::mock::MockTransport;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    type Frames = mpsc::UnboundedSender<Result<Inbound, String>>;

    struct Session {
        engine: BroadcastEngine,
        handler: InboundConnectionHandler,
        transport: Arc<MockTransport>,
        frames: Frames,
        task: JoinHandle<()>,
        shutdown: watch::Sender<bool>,
    }

    fn start(policy: InboundPolicy, welcome: Option<&str>) -> Session {
        let engine = BroadcastEngine::new(ConnectionRegistry::new(), Duration::from_millis(200));
        start_with(engine, policy, welcome)
    }

    fn start_with(engine: BroadcastEngine, policy: InboundPolicy, welcome: Option<&str>) -> Session {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handler = InboundConnectionHandler::new(
            engine.clone(),
            policy,
            IntakeLimits::default(),
            welcome.map(str::to_string),
            shutdown_rx,
        );
        let transport = MockTransport::delivering();
        let (frames, rx) = mpsc::unbounded_channel();
        let session_transport = transport.clone();
        let session_handler = handler.clone();
        let task = tokio::spawn(async move {
            session_handler
                .run(session_transport, UnboundedReceiverStream::new(rx), None)
                .await
        });
        Session {
            engine,
            handler,
            transport,
            frames,
            task,
            shutdown,
        }
    }

    async fn replies(transport: &MockTransport, count: usize) -> Vec<Value> {
        tokio::time::timeout(Duration::from_secs(2), transport.wait_for(count))
            .await
            .unwrap()
            .iter()
            .map(|raw| serde_json::from_str(raw).unwrap())
            .collect()
    }

    async fn wait_registered(engine: &BroadcastEngine, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while engine.registry().count().await != count {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_malformed_payload_gets_error_reply() {
        let session = start(InboundPolicy::Echo, None);
        wait_registered(&session.engine, 1).await;

        session.frames.send(Ok(Inbound::Text("{not json".into()))).unwrap();
        let replies = replies(&session.transport, 1).await;

        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["type"], "error");
        assert_eq!(replies[0]["message"], "Invalid JSON");
        assert_eq!(session.engine.registry().count().await, 1);

        drop(session.frames);
        session.task.await.unwrap();
        assert_eq!(session.engine.registry().count().await, 0);
        assert_eq!(session.transport.close_code(), Some(CLOSE_NORMAL));
    }

    #[tokio::test]
    async fn test_valid_payload_is_echoed_to_sender() {
        let session = start(InboundPolicy::Echo, None);
        session
            .frames
            .send(Ok(Inbound::Text(r#"{"hello":"world"}"#.into())))
            .unwrap();

        let replies = replies(&session.transport, 1).await;
        assert_eq!(replies[0]["type"], "echo");
        assert_eq!(replies[0]["original"]["hello"], "world");
        assert!(replies[0]["timestamp"].is_f64());
    }

    #[tokio::test]
    async fn test_welcome_is_sent_first() {
        let session = start(InboundPolicy::Echo, Some("hola"));
        session.frames.send(Ok(Inbound::Text("[]".into()))).unwrap();

        let replies = replies(&session.transport, 2).await;
        assert_eq!(replies[0]["type"], "connection");
        assert_eq!(replies[0]["status"], "connected");
        assert_eq!(replies[0]["message"], "hola");
        assert_eq!(replies[1]["type"], "echo");
    }

    #[tokio::test]
    async fn test_rebroadcast_reaches_other_subscribers_only() {
        let engine = BroadcastEngine::new(ConnectionRegistry::new(), Duration::from_millis(200));
        let listener = MockTransport::delivering();
        engine
            .registry()
            .add(Connection::new(listener.clone(), None))
            .await;

        let session = start_with(engine, InboundPolicy::Rebroadcast, None);
        wait_registered(&session.engine, 2).await;
        session
            .frames
            .send(Ok(Inbound::Text(
                r#"{"type":"chat_message","user":"ana","text":"hola"}"#.into(),
            )))
            .unwrap();

        let received = replies(&listener, 1).await;
        assert_eq!(received[0]["type"], "chat_message");
        assert_eq!(received[0]["text"], "hola");
        assert!(session.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_rebroadcast_rejects_invalid_events() {
        let engine = BroadcastEngine::new(ConnectionRegistry::new(), Duration::from_millis(200));
        let listener = MockTransport::delivering();
        engine
            .registry()
            .add(Connection::new(listener.clone(), None))
            .await;

        let session = start_with(engine, InboundPolicy::Rebroadcast, None);
        wait_registered(&session.engine, 2).await;
        let oversized = json!({
            "type": "donation",
            "user": "x".repeat(5000),
            "amount": -99999999,
            "message": "x".repeat(5000),
        });
        session
            .frames
            .send(Ok(Inbound::Text(oversized.to_string())))
            .unwrap();

        let replies = replies(&session.transport, 1).await;
        assert_eq!(replies[0]["type"], "error");
        assert_eq!(replies[0]["message"], "Amount must be positive");
        assert!(listener.sent().is_empty());
        assert_eq!(session.engine.registry().count().await, 2);
    }

    #[tokio::test]
    async fn test_rebroadcast_truncates_relayed_fields() {
        let engine = BroadcastEngine::new(ConnectionRegistry::new(), Duration::from_millis(200));
        let listener = MockTransport::delivering();
        engine
            .registry()
            .add(Connection::new(listener.clone(), None))
            .await;

        let session = start_with(engine, InboundPolicy::Rebroadcast, None);
        wait_registered(&session.engine, 2).await;
        let body = json!({ "type": "donation", "user": "x".repeat(5000), "amount": 3, "message": "y".repeat(5000) });
        session.frames.send(Ok(Inbound::Text(body.to_string()))).unwrap();

        let received = replies(&listener, 1).await;
        assert_eq!(received[0]["type"], "donation");
        assert_eq!(received[0]["user"].as_str().unwrap().len(), 50);
        assert_eq!(received[0]["message"].as_str().unwrap().len(), 200);
    }

    #[tokio::test]
    async fn test_close_frame_ends_session() {
        let session = start(InboundPolicy::Echo, None);
        session.frames.send(Ok(Inbound::Close)).unwrap();

        tokio::time::timeout(Duration::from_secs(2), session.task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.engine.registry().count().await, 0);
    }

    #[tokio::test]
    async fn test_receive_error_unregisters() {
        let session = start(InboundPolicy::Echo, None);
        session.frames.send(Err("connection reset".into())).unwrap();

        tokio::time::timeout(Duration::from_secs(2), session.task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.engine.registry().count().await, 0);
        assert_eq!(session.transport.close_code(), Some(CLOSE_PROTOCOL_ERROR));
    }

    #[tokio::test]
    async fn test_shutdown_closes_session() {
        let session = start(InboundPolicy::Echo, None);
        wait_registered(&session.engine, 1).await;

        session.shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), session.task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(session.engine.registry().count().await, 0);
        assert_eq!(session.transport.close_code(), Some(CLOSE_GOING_AWAY));
    }

    #[tokio::test]
    async fn test_drain_waits_for_sessions_to_close() {
        let session = start(InboundPolicy::Echo, None);
        wait_registered(&session.engine, 1).await;
        assert_eq!(session.handler.active_sessions(), 1);

        session.shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), session.handler.drain())
            .await
            .unwrap();

        assert_eq!(session.handler.active_sessions(), 0);
        assert_eq!(session.transport.close_code(), Some(CLOSE_GOING_AWAY));
    }

    #[tokio::test]
    async fn test_drain_without_sessions_returns_immediately() {
        let (_shutdown, shutdown_rx) = watch::channel(false);
        let engine = BroadcastEngine::new(ConnectionRegistry::new(), Duration::from_millis(200));
        let handler = InboundConnectionHandler::new(
            engine,
            InboundPolicy::Echo,
            IntakeLimits::default(),
            None,
            shutdown_rx,
        );

        tokio::time::timeout(Duration::from_millis(100), handler.drain())
            .await
            .unwrap();
    }
}
