//! HTTP endpoints, the subscriber WebSocket route and the local IPC intake.

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    http::{HeaderValue, Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixListener, UnixStream};
use tokio::sync::{watch, Mutex};
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tracing::{debug, error, info, warn};

use crate::broadcast::BroadcastEngine;
use crate::config::{Config, IntakeLimits};
use crate::handler::InboundConnectionHandler;
use crate::intake::{self, RateLimiter, ValidationError};
use crate::models::{DeliveryReport, Event, EventKind};
use crate::monitor::wait_for_shutdown;

/// Validate a publisher payload and fan the resulting event out.
async fn submit(
    engine: &BroadcastEngine,
    limits: &IntakeLimits,
    body: &Value,
    source: &str,
) -> Result<(Event, DeliveryReport), ValidationError> {
    let event = match intake::validate(body, limits) {
        Ok(event) => event,
        Err(e) => {
            info!(source, error = %e, "publish rejected");
            return Err(e);
        }
    };
    let user = event.field("user").and_then(Value::as_str).unwrap_or_default();
    match event.kind() {
        EventKind::Donation => {
            let amount = event.field("amount").and_then(Value::as_f64);
            info!(source, user, amount, "donation received")
        }
        EventKind::Walker => info!(source, user, "walker event received"),
        EventKind::ChatMessage => info!(source, user, "chat message received"),
        kind => info!(source, %kind, "custom event received"),
    }
    let delivery = engine.publish(&event).await;
    Ok((event, delivery))
}

fn accepted(event: &Event, delivery: &DeliveryReport) -> Value {
    json!({ "status": "ok", "event": event, "delivery": delivery })
}

fn rejected(message: impl std::fmt::Display) -> Value {
    json!({ "status": "error", "message": message.to_string() })
}

/// IPC Server using Unix sockets.
///
/// Local event sources (chat bots, the `emit` command) write one JSON object
/// per line and get one JSON line back.
pub struct IpcServer {
    socket_path: PathBuf,
    engine: BroadcastEngine,
    limits: IntakeLimits,
}

impl IpcServer {
    pub fn new(socket_path: PathBuf, engine: BroadcastEngine, limits: IntakeLimits) -> Self {
        Self {
            socket_path,
            engine,
            limits,
        }
    }

    /// Accept clients until `shutdown` is raised, then remove the socket file.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        // Remove stale socket
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        info!(path = ?self.socket_path, "IPC server listening");

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let engine = self.engine.clone();
                        let limits = self.limits.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_client(stream, engine, limits).await {
                                warn!(error = %e, "IPC client error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "IPC accept error"),
                },
            }
        }

        drop(listener);
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            debug!(error = %e, "socket file already gone");
        }
        info!("IPC server stopped");
        Ok(())
    }
}

async fn handle_client(stream: UnixStream, engine: BroadcastEngine, limits: IntakeLimits) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Value>(&line) {
            Err(_) => rejected("Invalid JSON"),
            Ok(request) if request.get("action").and_then(Value::as_str) == Some("stats") => {
                json!({ "status": "ok", "stats": engine.registry().get_stats().await })
            }
            Ok(body) => match submit(&engine, &limits, &body, "ipc").await {
                Ok((event, delivery)) => accepted(&event, &delivery),
                Err(e) => rejected(e),
            },
        };

        let response_str = serde_json::to_string(&response)? + "\n";
        writer.write_all(response_str.as_bytes()).await?;
    }

    Ok(())
}

/// Application state for web server.
#[derive(Clone)]
pub struct AppState {
    pub engine: BroadcastEngine,
    pub handler: InboundConnectionHandler,
    pub config: Arc<Config>,
    pub limiter: Arc<Mutex<RateLimiter>>,
}

impl AppState {
    pub fn new(config: Arc<Config>, engine: BroadcastEngine, handler: InboundConnectionHandler) -> Self {
        let limiter = RateLimiter::new(config.rate_limit.max_requests, config.rate_limit_window());
        Self {
            engine,
            handler,
            config,
            limiter: Arc::new(Mutex::new(limiter)),
        }
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

pub fn create_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors_origins);
    Router::new()
        .route("/simulate_donation", post(simulate_donation_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/ws", get(websocket_handler))
        .route("/ws/stats", get(ws_stats_handler))
        .layer(cors)
        .with_state(state)
}

/// Run the web server until `shutdown` is raised.
pub async fn run_web_server(
    host: &str,
    port: u16,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "relay listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move { wait_for_shutdown(&mut shutdown).await })
        .await?;

    info!("web server stopped");
    Ok(())
}

/// Publish an event submitted over HTTP.
async fn simulate_donation_handler(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    body: Bytes,
) -> impl IntoResponse {
    let client = connect_info
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    if !state.limiter.lock().await.check(&client) {
        warn!(%client, "rate limit exceeded");
        return (StatusCode::TOO_MANY_REQUESTS, Json(rejected("Rate limit exceeded")));
    }

    let body: Value = match serde_json::from_slice(&body) {
        Ok(body) => body,
        Err(_) => return (StatusCode::BAD_REQUEST, Json(rejected("Invalid JSON"))),
    };

    match submit(&state.engine, &state.config.limits, &body, "http").await {
        Ok((event, delivery)) => (StatusCode::OK, Json(accepted(&event, &delivery))),
        Err(e) => (StatusCode::BAD_REQUEST, Json(rejected(e))),
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Rate limiter usage.
async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    let limiter = state.limiter.lock().await.get_state();
    Json(json!({
        "rate_limiter": limiter,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// WebSocket upgrade handler.
async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> impl IntoResponse {
    let remote = connect_info.map(|ConnectInfo(addr)| addr);
    ws.on_upgrade(move |socket| async move { state.handler.serve_socket(socket, remote).await })
}

async fn ws_stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.registry().get_stats().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InboundPolicy;
    use crate::registry::{Connection, ConnectionRegistry};
    use crate::transport::mock::MockTransport;
    use axum::body::Body;
    use axum::http::{header, Request};
    use std::time::Duration;
    use tower::ServiceExt;

    struct Harness {
        router: Router,
        engine: BroadcastEngine,
        _shutdown: watch::Sender<bool>,
    }

    fn harness(config: Config) -> Harness {
        let engine = BroadcastEngine::new(ConnectionRegistry::new(), Duration::from_millis(200));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handler = InboundConnectionHandler::new(
            engine.clone(),
            InboundPolicy::Echo,
            config.limits.clone(),
            None,
            shutdown_rx,
        );
        let state = AppState::new(Arc::new(config), engine.clone(), handler);
        Harness {
            router: create_router(state),
            engine,
            _shutdown: shutdown,
        }
    }

    fn publish_request(body: &str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri("/simulate_donation")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn test_donation_is_published_to_subscribers() {
        let harness = harness(Config::default());
        let subscriber = MockTransport::delivering();
        harness
            .engine
            .registry()
            .add(Connection::new(subscriber.clone(), None))
            .await;

        let (status, body) = send(
            &harness.router,
            publish_request(r#"{"type":"donation","user":"Ana","amount":5,"message":"gracias"}"#),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["event"]["type"], "donation");
        assert_eq!(body["delivery"]["succeeded"], 1);

        let received: Value = serde_json::from_str(&subscriber.sent()[0]).unwrap();
        assert_eq!(received["user"], "Ana");
        assert_eq!(received["amount"], 5.0);
    }

    #[tokio::test]
    async fn test_invalid_json_is_rejected() {
        let harness = harness(Config::default());
        let (status, body) = send(&harness.router, publish_request("{oops")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "Invalid JSON");
    }

    #[tokio::test]
    async fn test_validation_error_is_reported() {
        let harness = harness(Config::default());
        let (status, body) = send(&harness.router, publish_request(r#"{"amount":-3}"#)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");
        assert_eq!(body["message"], "Amount must be positive");
    }

    #[tokio::test]
    async fn test_rate_limit_applies_per_client() {
        let mut config = Config::default();
        config.rate_limit.max_requests = 2;
        let harness = harness(config);

        for _ in 0..2 {
            let (status, _) = send(&harness.router, publish_request(r#"{"type":"walker"}"#)).await;
            assert_eq!(status, StatusCode::OK);
        }
        let (status, body) = send(&harness.router, publish_request(r#"{"type":"walker"}"#)).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["message"], "Rate limit exceeded");

        let stats = Request::builder().uri("/stats").body(Body::empty()).unwrap();
        let (_, body) = send(&harness.router, stats).await;
        assert_eq!(body["rate_limiter"]["total_requests_last_window"], 2);
        assert_eq!(body["rate_limiter"]["active_clients"], 1);
    }

    #[tokio::test]
    async fn test_health() {
        let harness = harness(Config::default());
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body) = send(&harness.router, request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_ws_stats_lists_connections() {
        let harness = harness(Config::default());
        harness
            .engine
            .registry()
            .add(Connection::new(MockTransport::delivering(), None))
            .await;

        let request = Request::builder().uri("/ws/stats").body(Body::empty()).unwrap();
        let (status, body) = send(&harness.router, request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["connected_clients"], 1);
        assert_eq!(body["per_connection"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cors_allows_configured_origin_only() {
        let harness = harness(Config::default());
        let preflight = |origin: &str| {
            Request::builder()
                .method(Method::OPTIONS)
                .uri("/simulate_donation")
                .header(header::ORIGIN, origin)
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                .body(Body::empty())
                .unwrap()
        };

        let response = harness
            .router
            .clone()
            .oneshot(preflight("http://localhost:5500"))
            .await
            .unwrap();
        assert_eq!(
            response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "http://localhost:5500"
        );

        let response = harness
            .router
            .clone()
            .oneshot(preflight("http://evil.example"))
            .await
            .unwrap();
        assert!(response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
    }

    #[tokio::test]
    async fn test_ipc_server_publishes_and_reports_stats() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("relay.sock");
        let engine = BroadcastEngine::new(ConnectionRegistry::new(), Duration::from_millis(200));
        let subscriber = MockTransport::delivering();
        engine
            .registry()
            .add(Connection::new(subscriber.clone(), None))
            .await;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let server = IpcServer::new(socket_path.clone(), engine, IntakeLimits::default());
        let task = tokio::spawn(async move { server.run(shutdown_rx).await });

        let stream = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(stream) = UnixStream::connect(&socket_path).await {
                    break stream;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let (reader, mut writer) = stream.into_split();
        let mut replies = BufReader::new(reader).lines();
        writer
            .write_all(b"{\"type\":\"chat_message\",\"user\":\"bot\",\"text\":\"hola\"}\nnot json\n{\"action\":\"stats\"}\n")
            .await
            .unwrap();

        let published: Value = serde_json::from_str(&replies.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(published["status"], "ok");
        assert_eq!(published["event"]["type"], "chat_message");
        assert_eq!(published["delivery"]["succeeded"], 1);

        let malformed: Value = serde_json::from_str(&replies.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(malformed["message"], "Invalid JSON");

        let stats: Value = serde_json::from_str(&replies.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(stats["stats"]["connected_clients"], 1);

        let received: Value = serde_json::from_str(&subscriber.sent()[0]).unwrap();
        assert_eq!(received["text"], "hola");

        shutdown.send(true).unwrap();
        task.await.unwrap().unwrap();
        assert!(!socket_path.exists());
    }
}
