//! HTTP and WebSocket handlers for the roomcast server.
//!
//! The WebSocket endpoint hands each upgraded socket to the session manager.
//! The HTTP endpoints let in-process collaborators publish to rooms and
//! query presence.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{ws::WebSocket, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use roomcast_core::room::validate_room_name;
use roomcast_core::{
    ConnectParams, Connection, Handshake, Hub, Message, MessageError, OnlineUser,
    PresenceTracker, PublishReport, SessionManager,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The room registry.
    pub hub: Arc<Hub>,
    /// The presence tracker.
    pub presence: Arc<PresenceTracker>,
    /// Session lifecycle manager.
    pub sessions: SessionManager,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let hub = Arc::new(Hub::new());
        let presence = Arc::new(PresenceTracker::with_config(config.presence_config()));
        let sessions = SessionManager::new(
            Arc::clone(&hub),
            Arc::clone(&presence),
            config.session_config(),
        );

        Self {
            hub,
            presence,
            sessions,
            config,
        }
    }
}

/// Errors returned by the HTTP API.
#[derive(Debug, Error)]
pub enum ApiError {
    /// A required field was empty or missing.
    #[error("{0} required")]
    Missing(&'static str),

    /// The room is not a valid room name.
    #[error("invalid room: {0}")]
    InvalidRoom(&'static str),

    /// The payload could not be encoded.
    #[error(transparent)]
    Message(#[from] MessageError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::Missing(_) | Self::InvalidRoom(_) => StatusCode::BAD_REQUEST,
            Self::Message(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// Body of a publish request.
#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    /// Target room.
    pub room: String,
    /// Event type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Originating user.
    #[serde(default)]
    pub from: Option<String>,
    /// Event payload.
    #[serde(default)]
    pub payload: Option<Value>,
}

/// Build the HTTP router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();

    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/api/presence/online", get(online_handler))
        .route("/api/publish", post(publish_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server fails to bind or serve.
pub async fn run_server(config: Config) -> Result<()> {
    let addr = config.bind_addr()?;
    let state = Arc::new(AppState::new(config.clone()));

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let sweeper = state.presence.spawn_sweeper(Arc::clone(&state.hub));
    let app = build_router(Arc::clone(&state));

    let listener = TcpListener::bind(addr).await?;

    info!("roomcast server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.shutdown().await;
    info!("roomcast server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Currently online users.
async fn online_handler(State(state): State<Arc<AppState>>) -> Json<Vec<OnlineUser>> {
    Json(state.presence.list_online())
}

/// Publish an event to a room.
async fn publish_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PublishRequest>,
) -> Result<Json<PublishReport>, ApiError> {
    if request.room.is_empty() {
        return Err(ApiError::Missing("room"));
    }
    if request.kind.is_empty() {
        return Err(ApiError::Missing("type"));
    }
    validate_room_name(&request.room).map_err(ApiError::InvalidRoom)?;

    let mut message = Message::new(request.kind, request.room);
    if let Some(from) = request.from {
        message = message.with_from(from);
    }
    if let Some(payload) = request.payload {
        message = message.with_payload(payload);
    }

    let report = state.hub.publish_message(&message)?;
    debug!(room = %message.room, kind = %message.kind, delivered = report.delivered, "Published");

    Ok(Json(report))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let handshake = match state.sessions.handshake(params) {
        Ok(handshake) => handshake,
        Err(e) => {
            warn!(error = %e, "Rejected upgrade");
            metrics::record_error("handshake");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, handshake, state))
}

/// Drive one upgraded socket through its session.
async fn handle_websocket(socket: WebSocket, handshake: Handshake, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let started = Instant::now();

    let limits = &state.config.limits;
    let attached =
        roomcast_transport::attach(socket, limits.outbound_buffer, limits.overflow_policy);
    let id = attached.connection.id().clone();

    debug!(connection = %id, room = %handshake.room(), user = ?handshake.user_id(), "WebSocket connected");

    let reason = state
        .sessions
        .run(handshake, attached.connection, attached.reader)
        .await;

    if !finish_writer(attached.writer, state.config.writer_drain_timeout()).await {
        warn!(connection = %id, "Writer did not finish in time, aborted");
    }

    metrics::record_session_closed(&reason, started.elapsed().as_secs_f64());
    metrics::set_active_rooms(state.hub.stats().room_count);

    debug!(connection = %id, reason = %reason, "WebSocket disconnected");
}

/// Give a closed connection's writer time to flush, then stop it.
///
/// Returns `false` if the writer had to be aborted.
async fn finish_writer(mut writer: JoinHandle<()>, drain: Duration) -> bool {
    match tokio::time::timeout(drain, &mut writer).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(error = %e, "Writer task failed");
            true
        }
        Err(_) => {
            writer.abort();
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use std::net::SocketAddr;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.metrics.enabled = false;
        config
    }

    async fn spawn_server() -> (SocketAddr, Arc<AppState>) {
        spawn_server_with(test_config()).await
    }

    async fn spawn_server_with(config: Config) -> (SocketAddr, Arc<AppState>) {
        let state = Arc::new(AppState::new(config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(Arc::clone(&state));
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        (addr, state)
    }

    async fn connect(addr: SocketAddr, query: &str) -> Client {
        let (client, _) = connect_async(format!("ws://{addr}/ws?{query}"))
            .await
            .unwrap();
        client
    }

    async fn next_event(client: &mut Client) -> Value {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), client.next())
                .await
                .expect("timed out waiting for event")
                .expect("stream ended")
                .unwrap();
            if let WsMessage::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_finish_writer_aborts_stuck_writer() {
        let (alive, released) = tokio::sync::oneshot::channel::<()>();
        let writer = tokio::spawn(async move {
            let _alive = alive;
            std::future::pending::<()>().await;
        });

        assert!(!finish_writer(writer, Duration::from_millis(20)).await);
        // The task was cancelled, so its sender is gone.
        assert!(released.await.is_err());
    }

    #[tokio::test]
    async fn test_finish_writer_waits_for_clean_exit() {
        let writer = tokio::spawn(async {
            tokio::time::sleep(Duration::from_millis(10)).await;
        });
        assert!(finish_writer(writer, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_stalled_reader_socket_is_torn_down() {
        let mut config = test_config();
        config.heartbeat.read_timeout_ms = 300;
        config.transport.writer_drain_timeout_ms = 200;
        let (addr, state) = spawn_server_with(config).await;

        // A tiny receive window and a client that never polls its stream.
        let socket = tokio::net::TcpSocket::new_v4().unwrap();
        socket.set_recv_buffer_size(4096).unwrap();
        let stream = socket.connect(addr).await.unwrap();
        let (mut client, _) =
            tokio_tungstenite::client_async(format!("ws://{addr}/ws?room=feed"), stream)
                .await
                .unwrap();
        eventually(|| state.hub.member_count("feed") == 1).await;

        let blob = "x".repeat(256 * 1024);
        let mut published = 0;
        for _ in 0..64 {
            published += state.hub.publish("feed", "blob", None, &blob).unwrap().delivered;
        }

        // The read deadline closes the session, then the stuck writer is aborted.
        eventually(|| !state.hub.room_exists("feed")).await;
        tokio::time::sleep(Duration::from_millis(700)).await;

        let mut drained = 0usize;
        let mut saw_close = false;
        let _ = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(Ok(frame)) = client.next().await {
                match frame {
                    WsMessage::Text(_) => drained += 1,
                    WsMessage::Close(_) => saw_close = true,
                    _ => {}
                }
            }
        })
        .await;

        assert!(!saw_close, "writer kept running and closed the socket itself");
        assert!(drained < published, "drained {drained} of {published}");
    }

    #[tokio::test]
    async fn test_missing_room_is_rejected() {
        let (addr, state) = spawn_server().await;

        let err = connect_async(format!("ws://{addr}/ws?user=u1"))
            .await
            .unwrap_err();
        assert!(matches!(err, tungstenite::Error::Http(resp) if resp.status() == 400));
        assert_eq!(state.hub.stats().room_count, 0);
    }

    #[tokio::test]
    async fn test_publish_reaches_room_members() {
        let (addr, state) = spawn_server().await;

        let mut a = connect(addr, "room=post:42").await;
        let mut b = connect(addr, "room=post:42").await;
        eventually(|| state.hub.member_count("post:42") == 2).await;

        let Json(report) = publish_handler(
            State(Arc::clone(&state)),
            Json(PublishRequest {
                room: "post:42".into(),
                kind: "comment_created".into(),
                from: Some("u1".into()),
                payload: Some(serde_json::json!({"id": 7})),
            }),
        )
        .await
        .unwrap();
        assert_eq!(report.delivered, 2);

        for client in [&mut a, &mut b] {
            let event = next_event(client).await;
            assert_eq!(event["type"], "comment_created");
            assert_eq!(event["room"], "post:42");
            assert_eq!(event["from"], "u1");
            assert_eq!(event["payload"]["id"], 7);
            assert!(event["at"].is_i64());
        }

        a.close(None).await.unwrap();
        eventually(|| state.hub.member_count("post:42") == 1).await;

        state
            .hub
            .publish("post:42", "like_updated", Some("u2"), &serde_json::json!({"count": 3}))
            .unwrap();
        assert_eq!(next_event(&mut b).await["type"], "like_updated");
    }

    #[tokio::test]
    async fn test_publish_rejects_empty_fields() {
        let (_, state) = spawn_server().await;

        let result = publish_handler(
            State(state),
            Json(PublishRequest {
                room: String::new(),
                kind: "x".into(),
                from: None,
                payload: None,
            }),
        )
        .await;

        let response = result.unwrap_err().into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_text_frames_are_echoed_to_the_room() {
        let (addr, state) = spawn_server().await;

        let mut a = connect(addr, "room=feed&user=u1").await;
        let mut b = connect(addr, "room=feed").await;
        eventually(|| state.hub.member_count("feed") == 2).await;

        a.send(WsMessage::Text("hello".into())).await.unwrap();

        for client in [&mut a, &mut b] {
            let event = next_event(client).await;
            assert_eq!(event["type"], "echo");
            assert_eq!(event["from"], "u1");
            assert_eq!(event["payload"], "hello");
        }
    }

    #[tokio::test]
    async fn test_presence_online_and_offline_over_sockets() {
        let (addr, state) = spawn_server().await;

        let mut watcher = connect(addr, "room=presence").await;
        eventually(|| state.hub.member_count("presence") == 1).await;

        let mut first = connect(addr, "room=presence&user=u1").await;
        let mut second = connect(addr, "room=presence&user=u1").await;
        eventually(|| state.presence.connection_count("u1") == 2).await;

        let Json(online) = online_handler(State(Arc::clone(&state))).await;
        assert_eq!(
            online,
            vec![OnlineUser {
                user_id: "u1".into()
            }]
        );

        first.close(None).await.unwrap();
        eventually(|| state.presence.connection_count("u1") == 1).await;
        second.close(None).await.unwrap();
        eventually(|| !state.presence.is_online("u1")).await;

        let event = next_event(&mut watcher).await;
        assert_eq!(event["type"], "online");
        assert_eq!(event["payload"]["userId"], "u1");

        let event = next_event(&mut watcher).await;
        assert_eq!(event["type"], "offline");
        assert_eq!(event["payload"]["userId"], "u1");

        let Json(online) = online_handler(State(state)).await;
        assert!(online.is_empty());
    }
}
