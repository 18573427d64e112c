//! Outbound transport for subscriber connections.

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::Mutex;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Server is shutting down.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Peer violated the protocol.
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
/// Server-side failure (registration or delivery).
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Why a send to one subscriber did not go through.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection already closed")]
    Closed,
    #[error("transport failure: {0}")]
    Failure(String),
    #[error("send did not finish before the delivery deadline")]
    TimedOut,
}

/// Write half of a subscriber link.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Push one text payload to the peer.
    async fn send_text(&self, text: &str) -> Result<(), TransportError>;

    /// Answer a protocol-level ping.
    async fn send_pong(&self, _payload: Vec<u8>) -> Result<(), TransportError> {
        Ok(())
    }

    fn is_closed(&self) -> bool;

    /// Close the link. Calling it more than once is a no-op.
    async fn close(&self, code: u16, reason: &str);
}

/// Transport over the sink half of an axum WebSocket.
///
/// The sink sits behind a fair mutex, so concurrent sends to the same peer
/// go out in the order they asked for it.
pub struct WsTransport {
    sink: Mutex<SplitSink<WebSocket, Message>>,
    closed: AtomicBool,
}

impl WsTransport {
    pub fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            sink: Mutex::new(sink),
            closed: AtomicBool::new(false),
        }
    }

    async fn send_frame(&self, frame: Message) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(frame).await {
            self.closed.store(true, Ordering::Release);
            return Err(TransportError::Failure(e.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        self.send_frame(Message::Text(text.to_string())).await
    }

    async fn send_pong(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        self.send_frame(Message::Pong(payload)).await
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn close(&self, code: u16, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut sink = self.sink.lock().await;
        let frame = CloseFrame {
            code,
            reason: reason.to_string().into(),
        };
        let _ = sink.send(Message::Close(Some(frame))).await;
        let _ = sink.close().await;
    }
}
