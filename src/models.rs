//! Data models for relayed events, delivery outcomes and connection stats.

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use serde_json::{json, Map, Value};

/// Opaque identity of a subscriber connection, stable for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(uuid::Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Discriminator of a relayed event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    ChatMessage,
    Donation,
    Walker,
    Heartbeat,
    Echo,
    Error,
    /// Welcome acknowledgment sent to a freshly registered subscriber.
    Connection,
    Custom(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::ChatMessage => "chat_message",
            EventKind::Donation => "donation",
            EventKind::Walker => "walker",
            EventKind::Heartbeat => "heartbeat",
            EventKind::Echo => "echo",
            EventKind::Error => "error",
            EventKind::Connection => "connection",
            EventKind::Custom(name) => name,
        }
    }

    /// Kinds that only the relay itself may emit.
    pub fn is_reserved(&self) -> bool {
        matches!(
            self,
            EventKind::Heartbeat | EventKind::Echo | EventKind::Error | EventKind::Connection
        )
    }

    fn has_numeric_timestamp(&self) -> bool {
        matches!(self, EventKind::Heartbeat | EventKind::Echo)
    }
}

impl From<&str> for EventKind {
    fn from(name: &str) -> Self {
        match name {
            "chat_message" => EventKind::ChatMessage,
            "donation" => EventKind::Donation,
            "walker" => EventKind::Walker,
            "heartbeat" => EventKind::Heartbeat,
            "echo" => EventKind::Echo,
            "error" => EventKind::Error,
            "connection" => EventKind::Connection,
            other => EventKind::Custom(other.to_string()),
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// An event to fan out to subscribers.
///
/// Events are immutable once built. The wire form is a single flat JSON
/// object `{type, ...fields, timestamp}`; see [`Event::encode`].
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    kind: EventKind,
    fields: Map<String, Value>,
    timestamp: DateTime<Utc>,
}

impl Event {
    /// Create an event stamped with the current time.
    pub fn new(kind: EventKind, fields: Map<String, Value>) -> Self {
        Self::at(kind, fields, Utc::now())
    }

    /// Create an event with an explicit originating timestamp.
    pub fn at(kind: EventKind, fields: Map<String, Value>, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind,
            fields,
            timestamp,
        }
    }

    pub fn chat_message(user: &str, text: &str) -> Self {
        Self::new(EventKind::ChatMessage, object(json!({ "user": user, "text": text })))
    }

    pub fn donation(user: &str, amount: f64, message: &str) -> Self {
        Self::new(
            EventKind::Donation,
            object(json!({ "user": user, "amount": amount, "message": message })),
        )
    }

    pub fn walker(user: &str) -> Self {
        Self::new(EventKind::Walker, object(json!({ "user": user })))
    }

    pub fn heartbeat() -> Self {
        Self::new(EventKind::Heartbeat, Map::new())
    }

    pub fn echo(original: Value) -> Self {
        Self::new(EventKind::Echo, object(json!({ "original": original })))
    }

    pub fn error(message: &str) -> Self {
        Self::new(EventKind::Error, object(json!({ "message": message })))
    }

    pub fn connected(message: &str) -> Self {
        Self::new(
            EventKind::Connection,
            object(json!({ "status": "connected", "message": message })),
        )
    }

    /// A publisher-defined event carrying an arbitrary payload under `data`.
    pub fn custom(kind: &str, data: Value) -> Self {
        Self::new(EventKind::from(kind), object(json!({ "data": data })))
    }

    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// JSON object form of the event.
    ///
    /// `heartbeat` and `echo` carry fractional Unix seconds, every other kind
    /// an RFC 3339 string.
    pub fn to_value(&self) -> Value {
        let mut out = self.fields.clone();
        out.insert("type".to_string(), Value::String(self.kind.to_string()));
        let timestamp = if self.kind.has_numeric_timestamp() {
            json!(self.timestamp.timestamp_millis() as f64 / 1000.0)
        } else {
            Value::String(self.timestamp.to_rfc3339())
        };
        out.insert("timestamp".to_string(), timestamp);
        Value::Object(out)
    }

    /// Canonical text encoding sent to every recipient.
    pub fn encode(&self) -> String {
        self.to_value().to_string()
    }
}

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Outcome of a single publish call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Connections this call removed from the registry.
    pub evicted: Vec<ConnectionId>,
}

/// Per-connection entry of [`RelayStats`].
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub id: ConnectionId,
    pub closed: bool,
    pub remote_addr: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// Snapshot served by the `/ws/stats` endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RelayStats {
    pub connected_clients: usize,
    pub per_connection: Vec<ConnectionStats>,
}
