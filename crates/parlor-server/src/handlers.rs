//! Connection handlers for Parlor server.
//!
//! This module terminates WebSocket connections, feeds decoded events into
//! the engine one at a time, and drains each connection's outbound queue
//! back onto its socket.

use crate::auth::JwtIssuer;
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::BytesMut;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use parlor_core::message::generate_id;
use parlor_core::{Engine, Flow, FsMediaStore, PeerInfo, Storage};
use parlor_protocol::{codec, ClientEvent, ServerEvent};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The presence and routing engine.
    pub engine: Engine,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Build the engine and restore rooms from storage.
    ///
    /// # Errors
    ///
    /// Returns an error if rooms cannot be restored.
    pub async fn new(config: Config, storage: Arc<dyn Storage>) -> Result<Self> {
        let tokens = Arc::new(JwtIssuer::new(&config.auth));
        let media = Arc::new(FsMediaStore::new(
            &config.media.upload_dir,
            &config.media.public_prefix,
        ));
        let engine = Engine::new(storage, tokens, media, config.chat.engine_config());

        let restored = engine
            .restore_rooms()
            .await
            .context("Failed to restore rooms")?;
        info!(rooms = restored, "Room directory restored");

        Ok(Self { engine, config })
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    let assets = format!(
        "{}/:file",
        state.config.media.public_prefix.trim_end_matches('/')
    );

    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route(&assets, get(asset_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config, storage: Arc<dyn Storage>) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        match config.metrics_addr() {
            Ok(addr) => {
                if let Err(e) = metrics::start_metrics_server(addr) {
                    error!("Failed to start metrics server: {}", e);
                }
            }
            Err(e) => error!("Failed to start metrics server: {}", e),
        }
    }

    let state = Arc::new(AppState::new(config.clone(), storage).await?);
    let app = app(state);

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Parlor server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.engine.stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": stats.connections,
        "sessions": stats.sessions,
        "open_rooms": stats.open_rooms,
    }))
}

/// Only plain content-addressed names are served.
fn is_safe_file_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
}

fn content_type_for(name: &str) -> &'static str {
    match name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()) {
        Some(ext) if ext == "png" => "image/png",
        Some(ext) if ext == "jpg" || ext == "jpeg" => "image/jpeg",
        Some(ext) if ext == "gif" => "image/gif",
        Some(ext) if ext == "webp" => "image/webp",
        Some(ext) if ext == "svg" => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

/// Serve a stored image.
async fn asset_handler(State(state): State<Arc<AppState>>, Path(file): Path<String>) -> Response {
    if !is_safe_file_name(&file) {
        return StatusCode::NOT_FOUND.into_response();
    }

    let path = state.config.media.upload_dir.join(&file);
    match tokio::fs::read(&path).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, content_type_for(&file))], bytes).into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Query parameters of the WebSocket endpoint.
#[derive(Debug, Default, Deserialize)]
struct WsParams {
    token: Option<String>,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<WsParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    if state.engine.stats().connections >= state.config.limits.max_connections {
        warn!(peer = %addr, "Connection limit reached");
        metrics::record_error("connection_limit");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let header_value = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let peer = PeerInfo::from_handshake(
        &addr.ip().to_string(),
        header_value("x-forwarded-for"),
        header_value(header::USER_AGENT.as_str()),
    );
    let token = header_value("token")
        .map(str::to_string)
        .or(params.token)
        .filter(|t| !t.is_empty());

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, peer, token))
}

/// Frame format a client speaks. Replies mirror the last inbound format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wire {
    Text,
    Binary,
}

/// Handle a WebSocket connection.
async fn handle_websocket(
    socket: WebSocket,
    state: Arc<AppState>,
    peer: PeerInfo,
    token: Option<String>,
) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = generate_id("conn");
    debug!(connection = %connection_id, ip = %peer.ip, device = peer.device.as_str(), "WebSocket connected");

    let mut outbound = state.engine.connect(&connection_id, peer);
    let (mut sender, mut receiver) = socket.split();

    if let Some(token) = token {
        match state.engine.reconnect(&connection_id, &token).await {
            Ok(session) => debug!(connection = %connection_id, user = %session.user_id, "Reconnected"),
            Err(e) => debug!(connection = %connection_id, error = %e, "Reconnect rejected"),
        }
    }

    let heartbeat_period = Duration::from_millis(state.config.heartbeat.interval_ms.max(1));
    let heartbeat_timeout = Duration::from_millis(state.config.heartbeat.timeout_ms);
    let mut heartbeat =
        tokio::time::interval_at(tokio::time::Instant::now() + heartbeat_period, heartbeat_period);
    let mut last_seen = Instant::now();

    // Read buffer for partial binary frames
    let mut read_buffer = BytesMut::with_capacity(4096);
    let mut wire = Wire::Text;
    let mut reason = "transport close";

    loop {
        tokio::select! {
            biased;

            // Events queued for this connection by the engine
            Some(event) = outbound.recv() => {
                if send_event(&mut sender, &event, wire).await.is_err() {
                    break;
                }
            }

            _ = heartbeat.tick() => {
                if last_seen.elapsed() > heartbeat_timeout {
                    debug!(connection = %connection_id, "Heartbeat timeout");
                    reason = "ping timeout";
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_seen = Instant::now();
                        wire = Wire::Text;
                        metrics::record_frame(text.len(), "inbound");

                        match codec::decode_text::<ClientEvent>(&text) {
                            Ok(event) => {
                                if dispatch(&state, &connection_id, event).await == Flow::Disconnect {
                                    reason = "client disconnect";
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!(connection = %connection_id, error = %e, "Malformed text frame");
                                metrics::record_error("malformed_frame");
                                let reply = ServerEvent::error(format!("Malformed event: {e}"));
                                if send_event(&mut sender, &reply, wire).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        last_seen = Instant::now();
                        wire = Wire::Binary;
                        metrics::record_frame(data.len(), "inbound");
                        read_buffer.extend_from_slice(&data);

                        let mut close = false;
                        loop {
                            match codec::decode_from::<ClientEvent>(&mut read_buffer) {
                                Ok(Some(event)) => {
                                    if dispatch(&state, &connection_id, event).await == Flow::Disconnect {
                                        close = true;
                                        break;
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    debug!(connection = %connection_id, error = %e, "Malformed binary frame");
                                    metrics::record_error("malformed_frame");
                                    read_buffer.clear();
                                    let reply = ServerEvent::error(format!("Malformed event: {e}"));
                                    close = send_event(&mut sender, &reply, wire).await.is_err();
                                    break;
                                }
                            }
                        }
                        if close {
                            reason = "client disconnect";
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_seen = Instant::now();
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_seen = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    state.engine.disconnect(&connection_id, Some(reason)).await;
    let stats = state.engine.stats();
    metrics::set_presence(stats.sessions, stats.open_rooms);

    debug!(connection = %connection_id, reason, "WebSocket disconnected");
}

/// Hand one event to the engine and record its outcome.
async fn dispatch(state: &AppState, connection_id: &str, event: ClientEvent) -> Flow {
    let start = Instant::now();
    metrics::record_event(event.name());

    let flow = match state.engine.handle(connection_id, event).await {
        Ok(flow) => flow,
        Err(e) => {
            metrics::record_error(e.kind());
            Flow::Continue
        }
    };

    metrics::record_latency(start.elapsed().as_secs_f64());
    let stats = state.engine.stats();
    metrics::set_presence(stats.sessions, stats.open_rooms);
    flow
}

/// Encode and send one event in the connection's wire format.
async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &ServerEvent,
    wire: Wire,
) -> Result<()> {
    let message = match wire {
        Wire::Text => Message::Text(codec::encode_text(event)?),
        Wire::Binary => Message::Binary(codec::encode(event)?.to_vec()),
    };
    let len = match &message {
        Message::Text(text) => text.len(),
        Message::Binary(data) => data.len(),
        _ => 0,
    };
    metrics::record_frame(len, "outbound");
    sender.send(message).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use argon2::Params;
    use parlor_core::{MemoryStorage, PasswordHasher};
    use parlor_protocol::{SystemAction, Target};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_tungstenite::{connect_async, tungstenite, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    const PIXEL: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAQAAAC1HAwCAAAAC0lEQVR42mNkYAAAAAYAAjCB0C8AAAAASUVORK5CYII=";

    async fn spawn_server() -> (SocketAddr, std::path::PathBuf) {
        let upload_dir = std::env::temp_dir().join(generate_id("parlor-gateway"));
        let mut config = Config::default();
        config.media.upload_dir = upload_dir.clone();
        config.metrics.enabled = false;

        let params = Params::new(1024, 1, 1, None).unwrap();
        let storage = Arc::new(MemoryStorage::with_hasher(PasswordHasher::with_params(params)));
        let state = Arc::new(AppState::new(config, storage).await.unwrap());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(
                listener,
                app(state).into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        (addr, upload_dir)
    }

    async fn client(addr: SocketAddr) -> Client {
        let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
        ws
    }

    async fn send(ws: &mut Client, event: &ClientEvent) {
        let text = codec::encode_text(event).unwrap();
        ws.send(tungstenite::Message::Text(text)).await.unwrap();
    }

    /// Read events until one named `name` arrives.
    async fn expect(ws: &mut Client, name: &str) -> ServerEvent {
        let wait = async {
            loop {
                match ws.next().await {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        let event: ServerEvent = codec::decode_text(&text).unwrap();
                        if event.name() == name {
                            return event;
                        }
                    }
                    Some(Ok(tungstenite::Message::Binary(data))) => {
                        let event: ServerEvent = codec::decode(&data).unwrap();
                        if event.name() == name {
                            return event;
                        }
                    }
                    Some(Ok(_)) => {}
                    other => panic!("connection ended while waiting for {name}: {other:?}"),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {name}"))
    }

    async fn register(ws: &mut Client, name: &str) -> String {
        send(
            ws,
            &ClientEvent::Register {
                name: name.to_string(),
                email: format!("{name}@example.com"),
                password: "hunter22".to_string(),
                avatar_url: None,
            },
        )
        .await;
        match expect(ws, "loginSuccess").await {
            ServerEvent::LoginSuccess { token, .. } => token,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_safe_file_names() {
        assert!(is_safe_file_name("3f2a.png"));
        assert!(!is_safe_file_name("../secret"));
        assert!(!is_safe_file_name(".hidden.tmp"));
        assert!(!is_safe_file_name(""));
        assert_eq!(content_type_for("a.JPG"), "image/jpeg");
        assert_eq!(content_type_for("a.bin"), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_group_chat_over_websocket() {
        let (addr, upload_dir) = spawn_server().await;

        let mut alice = client(addr).await;
        register(&mut alice, "alice").await;
        let mut bob = client(addr).await;
        register(&mut bob, "bob").await;

        match expect(&mut alice, "system").await {
            ServerEvent::System { user, action } => {
                assert_eq!(user.name, "bob");
                assert_eq!(action, SystemAction::Join);
            }
            _ => unreachable!(),
        }

        send(&mut alice, &ClientEvent::text(Target::group(), "hi bob")).await;
        match expect(&mut bob, "message").await {
            ServerEvent::Message { from, content, .. } => {
                assert_eq!(from.name, "alice");
                assert_eq!(content, "hi bob");
            }
            _ => unreachable!(),
        }

        bob.close(None).await.unwrap();
        match expect(&mut alice, "system").await {
            ServerEvent::System { user, action } => {
                assert_eq!(user.name, "bob");
                assert_eq!(action, SystemAction::Logout);
            }
            _ => unreachable!(),
        }

        let _ = std::fs::remove_dir_all(upload_dir);
    }

    #[tokio::test]
    async fn test_reconnect_with_query_token() {
        let (addr, upload_dir) = spawn_server().await;

        let mut alice = client(addr).await;
        let token = register(&mut alice, "alice").await;
        drop(alice);

        let (mut again, _) = connect_async(format!("ws://{addr}/ws?token={token}"))
            .await
            .unwrap();
        match expect(&mut again, "loginSuccess").await {
            ServerEvent::LoginSuccess { user, .. } => assert_eq!(user.name, "alice"),
            _ => unreachable!(),
        }

        let _ = std::fs::remove_dir_all(upload_dir);
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_error() {
        let (addr, upload_dir) = spawn_server().await;

        let mut ws = client(addr).await;
        ws.send(tungstenite::Message::Text(r#"{"event":"teleport"}"#.to_string()))
            .await
            .unwrap();
        assert_eq!(expect(&mut ws, "error").await.name(), "error");

        // The connection survives
        send(&mut ws, &ClientEvent::GetRooms {}).await;
        expect(&mut ws, "error").await;

        let _ = std::fs::remove_dir_all(upload_dir);
    }

    #[tokio::test]
    async fn test_binary_clients_get_binary_replies() {
        let (addr, upload_dir) = spawn_server().await;

        let mut ws = client(addr).await;
        let frame = codec::encode(&ClientEvent::Register {
            name: "carol".to_string(),
            email: "carol@example.com".to_string(),
            password: "hunter22".to_string(),
            avatar_url: None,
        })
        .unwrap();
        ws.send(tungstenite::Message::Binary(frame.to_vec()))
            .await
            .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match reply {
            tungstenite::Message::Binary(data) => {
                let event: ServerEvent = codec::decode(&data).unwrap();
                assert_eq!(event.name(), "loginSuccess");
            }
            other => panic!("expected binary reply, got {other:?}"),
        }

        let _ = std::fs::remove_dir_all(upload_dir);
    }

    #[tokio::test]
    async fn test_image_is_served_from_assets() {
        let (addr, upload_dir) = spawn_server().await;

        let mut alice = client(addr).await;
        register(&mut alice, "alice").await;
        let mut bob = client(addr).await;
        register(&mut bob, "bob").await;

        send(
            &mut alice,
            &ClientEvent::Message {
                from: None,
                to: Target::group(),
                content: format!("data:image/png;base64,{PIXEL}"),
                content_type: parlor_protocol::ContentType::Image,
            },
        )
        .await;
        let reference = match expect(&mut bob, "message").await {
            ServerEvent::Message { content, .. } => content,
            _ => unreachable!(),
        };
        assert!(reference.starts_with("/assets/images/"));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {reference} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        let head = String::from_utf8_lossy(&response[..response.len().min(256)]).to_string();
        assert!(head.starts_with("HTTP/1.1 200"));
        assert!(head.to_ascii_lowercase().contains("content-type: image/png"));

        let _ = std::fs::remove_dir_all(upload_dir);
    }

    #[tokio::test]
    async fn test_health_reports_presence() {
        let (addr, upload_dir) = spawn_server().await;

        let mut alice = client(addr).await;
        register(&mut alice, "alice").await;

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains(r#""status":"ok""#));
        assert!(response.contains(r#""sessions":1"#));

        let _ = std::fs::remove_dir_all(upload_dir);
    }
}
