//! Backend transport: the host channel endpoint plus HTTP diagnostics and
//! the public tool-invocation endpoint, served by Axum.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
};
use futures_util::{SinkExt, StreamExt};
use navrelay_protocol::{
    CLIENTS_PATH, ChannelMessage, ClientList, HEALTH_PATH, HealthStatus, IPC_PATH, MessageKinds,
    RelayError, RelayErrorCode, TOOL_CALL_PATH, ToolCallReply, ToolInvocation,
};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::error::TransportError;

/// Implemented by the shared service. The transport calls it for every
/// channel frame, channel close, and public HTTP request.
pub trait RelayHandler: Send + Sync + 'static {
    /// Handle one decoded frame. Frames from a single channel are delivered
    /// in arrival order.
    fn on_message(
        &self,
        channel: &ChannelHandle,
        message: ChannelMessage,
    ) -> impl std::future::Future<Output = ()> + Send;

    /// The channel is gone; no more frames will arrive on it.
    fn on_disconnect(&self, channel_id: &str) -> impl std::future::Future<Output = ()> + Send;

    /// Route and execute a public tool invocation.
    fn call_tool(
        &self,
        invocation: ToolInvocation,
    ) -> impl std::future::Future<Output = Result<Value, RelayError>> + Send;

    fn health(&self) -> HealthStatus;

    fn clients(&self) -> ClientList;
}

/// Server-side handle for one host channel. Cheap to clone; sending never
/// blocks.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    id: String,
    tx: mpsc::UnboundedSender<ChannelMessage>,
}

impl ChannelHandle {
    pub fn new(id: impl Into<String>, tx: mpsc::UnboundedSender<ChannelMessage>) -> Self {
        Self { id: id.into(), tx }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn send(&self, message: ChannelMessage) -> Result<(), TransportError> {
        self.tx
            .send(message)
            .map_err(|_| TransportError::NotConnected)
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Port to listen on (0 for OS-assigned)
    pub port: u16,
    pub hostname: String,
    pub enable_cors: bool,
    /// Maximum concurrent host channels
    pub max_connections: Option<usize>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: navrelay_protocol::DEFAULT_PORT,
            hostname: navrelay_protocol::DEFAULT_HOSTNAME.into(),
            enable_cors: false,
            max_connections: Some(256),
        }
    }
}

struct AppState<H: RelayHandler> {
    handler: Arc<H>,
    config: TransportConfig,
    channel_count: AtomicUsize,
    closing: watch::Receiver<bool>,
}

pub struct TransportServer {
    shutdown_tx: Option<mpsc::Sender<()>>,
    closing_tx: watch::Sender<bool>,
    handle: Option<tokio::task::JoinHandle<()>>,
    port: u16,
}

impl TransportServer {
    /// Bind and start serving. An occupied port is reported as
    /// [`TransportError::AddrInUse`] before anything else happens.
    pub async fn start<H: RelayHandler>(
        config: TransportConfig,
        handler: Arc<H>,
    ) -> Result<Self, TransportError> {
        let addr_text = format!("{}:{}", config.hostname, config.port);
        let addr: SocketAddr = addr_text
            .parse()
            .map_err(|e: std::net::AddrParseError| TransportError::InvalidAddress {
                addr: addr_text.clone(),
                reason: e.to_string(),
            })?;

        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                return Err(TransportError::AddrInUse { addr: addr_text });
            }
            Err(source) => {
                return Err(TransportError::Bind {
                    addr: addr_text,
                    source,
                });
            }
        };
        let actual_port = listener
            .local_addr()
            .map_err(|source| TransportError::Bind {
                addr: addr_text.clone(),
                source,
            })?
            .port();

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let (closing_tx, closing) = watch::channel(false);

        let state = Arc::new(AppState {
            handler,
            config: config.clone(),
            channel_count: AtomicUsize::new(0),
            closing,
        });

        let mut app = Router::new()
            .route(IPC_PATH, get(ws_upgrade_handler::<H>))
            .route(HEALTH_PATH, get(health_handler::<H>))
            .route(CLIENTS_PATH, get(clients_handler::<H>))
            .route(TOOL_CALL_PATH, post(tool_call_handler::<H>))
            .with_state(state);
        if config.enable_cors {
            app = app.layer(CorsLayer::permissive());
        }

        info!(
            "Navrelay transport listening on ws://{}:{}{}",
            config.hostname, actual_port, IPC_PATH
        );

        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
                .ok();
        });

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            closing_tx,
            handle: Some(handle),
            port: actual_port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting connections and wait for the serve task to finish.
    /// Open host channels are closed.
    pub async fn stop(&mut self) {
        // Upgraded sockets are not tracked by graceful shutdown.
        let _ = self.closing_tx.send(true);
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(mut handle) = self.handle.take() {
            if tokio::time::timeout(Duration::from_secs(2), &mut handle)
                .await
                .is_err()
            {
                warn!("Transport did not drain in time; aborting");
                handle.abort();
            }
        }
        info!("Navrelay transport stopped");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn ws_upgrade_handler<H: RelayHandler>(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState<H>>>,
) -> impl IntoResponse {
    if let Some(max) = state.config.max_connections {
        let current = state.channel_count.load(Ordering::Relaxed);
        if current >= max {
            warn!("Channel rejected: max connections reached ({max})");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    }

    ws.on_upgrade(move |socket| handle_channel(socket, state))
        .into_response()
}

async fn health_handler<H: RelayHandler>(
    State(state): State<Arc<AppState<H>>>,
) -> impl IntoResponse {
    Json(state.handler.health())
}

async fn clients_handler<H: RelayHandler>(
    State(state): State<Arc<AppState<H>>>,
) -> impl IntoResponse {
    Json(state.handler.clients())
}

async fn tool_call_handler<H: RelayHandler>(
    State(state): State<Arc<AppState<H>>>,
    Json(invocation): Json<ToolInvocation>,
) -> impl IntoResponse {
    if invocation.tool_name.trim().is_empty() {
        let err = RelayError::invalid_params("toolName is required");
        return (StatusCode::BAD_REQUEST, Json(ToolCallReply::err(err)));
    }

    match state.handler.call_tool(invocation).await {
        Ok(result) => (StatusCode::OK, Json(ToolCallReply::ok(result))),
        Err(err) => (status_for(&err), Json(ToolCallReply::err(err))),
    }
}

/// HTTP status for a failed public tool call.
pub fn status_for(err: &RelayError) -> StatusCode {
    match err.error_code() {
        RelayErrorCode::NoClientAvailable
        | RelayErrorCode::ServerShuttingDown
        | RelayErrorCode::ServerNotReady => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        RelayErrorCode::AmbiguousWorkspace => StatusCode::CONFLICT,
        RelayErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
        RelayErrorCode::ClientGone | RelayErrorCode::ToolExecution => StatusCode::BAD_GATEWAY,
        RelayErrorCode::InvalidParams | RelayErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Channel Connection Handler
// ─────────────────────────────────────────────────────────────────────────────

async fn handle_channel<H: RelayHandler>(socket: WebSocket, state: Arc<AppState<H>>) {
    state.channel_count.fetch_add(1, Ordering::Relaxed);

    let channel_id = uuid::Uuid::new_v4().to_string();
    debug!("Channel opened: {channel_id}");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ChannelMessage>();
    let channel = ChannelHandle::new(channel_id.clone(), out_tx);
    let mut closing = state.closing.clone();

    loop {
        if *closing.borrow() {
            let _ = ws_tx.send(Message::Close(None)).await;
            break;
        }

        tokio::select! {
            changed = closing.changed() => {
                if changed.is_err() {
                    break;
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match ChannelMessage::decode(text.as_str()) {
                            Ok(message) => state.handler.on_message(&channel, message).await,
                            Err(err) => reject_frame(&channel, text.as_str(), err),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!("Channel error on {channel_id}: {e}");
                        break;
                    }
                    _ => {}
                }
            }

            outgoing = out_rx.recv() => {
                let Some(message) = outgoing else { break };
                match message.encode() {
                    Ok(text) => {
                        if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                            warn!("Failed to send {} to {channel_id}: {e}", message.kind());
                            break;
                        }
                    }
                    Err(e) => warn!("Failed to encode {} for {channel_id}: {e}", message.kind()),
                }
            }
        }
    }

    state.handler.on_disconnect(&channel_id).await;
    state.channel_count.fetch_sub(1, Ordering::Relaxed);
    debug!(
        "Channel closed: {channel_id} (open: {})",
        state.channel_count.load(Ordering::Relaxed)
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Answer a malformed register/unregister frame with a failed response so
/// the sender does not wait out its timeout. Anything else is dropped.
fn reject_frame(channel: &ChannelHandle, text: &str, err: RelayError) {
    let raw: Value = serde_json::from_str(text).unwrap_or(Value::Null);
    let kind = raw.get("type").and_then(Value::as_str);
    let request_id = raw
        .get("requestId")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty());

    warn!(
        "Rejected {} frame on {}: {}",
        kind.unwrap_or("unknown"),
        channel.id(),
        err.message
    );

    let reply = match (kind, request_id) {
        (Some(MessageKinds::REGISTER_CLIENT), Some(id)) => {
            ChannelMessage::register_failed(id, err.message)
        }
        (Some(MessageKinds::UNREGISTER_CLIENT), Some(id)) => ChannelMessage::UnregisterResponse {
            request_id: id.to_string(),
            success: false,
            error: Some(err.message),
        },
        _ => return,
    };
    let _ = channel.send(reply);
}
