//! Host end of the channel.
//!
//! `connect()` is memoized: concurrent callers share one in-flight attempt,
//! and a connected client returns immediately. Correlated requests are not
//! resumed across a reconnect; whatever is outstanding when the socket drops
//! fails with [`TransportError::ConnectionLost`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::future::{BoxFuture, Shared};
use futures_util::{FutureExt, SinkExt, StreamExt};
use navrelay_protocol::{ChannelMessage, ToolCallRequest};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::pending::{PendingError, PendingRequests};

#[derive(Debug, Clone)]
pub struct ChannelClientConfig {
    /// Full channel URL, e.g. `ws://127.0.0.1:8010/ipc`
    pub url: String,
    pub connect_attempts: u32,
    pub retry_delay: Duration,
    /// Bound on a single connect attempt
    pub attempt_timeout: Duration,
}

impl ChannelClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_attempts: 3,
            retry_delay: Duration::from_secs(2),
            attempt_timeout: Duration::from_secs(8),
        }
    }

    pub fn for_port(hostname: &str, port: u16) -> Self {
        Self::new(format!("ws://{hostname}:{port}{}", navrelay_protocol::IPC_PATH))
    }
}

/// Things the backend initiates, delivered to the host in arrival order.
#[derive(Debug)]
pub enum ChannelEvent {
    ToolCall(ToolCallRequest),
    Disconnected,
}

type ConnectFuture = Shared<BoxFuture<'static, Result<(), String>>>;

enum LinkState {
    Idle,
    Connecting(ConnectFuture),
    Connected {
        generation: u64,
        outgoing: mpsc::UnboundedSender<Message>,
    },
}

struct Inner {
    config: ChannelClientConfig,
    link: Mutex<LinkState>,
    generation: AtomicU64,
    /// Set when an established link drops; cleared by the next connect.
    lost: AtomicBool,
    pending: PendingRequests<ChannelMessage>,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
}

#[derive(Clone)]
pub struct ChannelClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ChannelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelClient")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl ChannelClient {
    pub fn new(config: ChannelClientConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                config,
                link: Mutex::new(LinkState::Idle),
                generation: AtomicU64::new(0),
                lost: AtomicBool::new(false),
                pending: PendingRequests::new(),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.config.url
    }

    /// Take the event stream. Only the first caller gets it.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.inner.events_rx.lock().take()
    }

    pub fn is_connected(&self) -> bool {
        matches!(*self.inner.link.lock(), LinkState::Connected { .. })
    }

    /// Whether the backend dropped a link that had been established. A
    /// client that was never connected, or was closed with
    /// [`ChannelClient::disconnect`], is not lost.
    pub fn is_lost(&self) -> bool {
        self.inner.lost.load(Ordering::SeqCst)
    }

    /// Outstanding correlated requests.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub async fn connect(&self) -> Result<(), TransportError> {
        let attempt = {
            let mut link = self.inner.link.lock();
            let in_flight = match &*link {
                LinkState::Connected { .. } => return Ok(()),
                LinkState::Connecting(attempt) => Some(attempt.clone()),
                LinkState::Idle => None,
            };
            match in_flight {
                Some(attempt) => attempt,
                None => {
                    let attempt = dial(self.inner.clone()).boxed().shared();
                    *link = LinkState::Connecting(attempt.clone());
                    attempt
                }
            }
        };

        attempt.await.map_err(|reason| TransportError::Connect {
            url: self.inner.config.url.clone(),
            reason,
        })
    }

    /// Send a frame without waiting for anything back.
    pub fn send(&self, message: &ChannelMessage) -> Result<(), TransportError> {
        let text = message.encode()?;
        match &*self.inner.link.lock() {
            LinkState::Connected { outgoing, .. } => outgoing
                .send(Message::Text(text.into()))
                .map_err(|_| TransportError::NotConnected),
            _ => Err(TransportError::NotConnected),
        }
    }

    /// Send a correlated request and wait for the frame carrying the same
    /// `requestId`. The handler is registered before the frame is sent and
    /// removed on every exit path.
    pub async fn request(
        &self,
        message: ChannelMessage,
        timeout: Duration,
    ) -> Result<ChannelMessage, TransportError> {
        self.connect().await?;

        let request_id = message.request_id().to_string();
        let kind = message.kind();
        let reply = self.inner.pending.register(request_id.clone(), None);
        self.send(&message)?;

        match reply.wait(timeout).await {
            Ok(response) => Ok(response),
            Err(PendingError::TimedOut) => Err(TransportError::Timeout {
                kind,
                request_id,
                timeout,
            }),
            Err(PendingError::Abandoned) => Err(TransportError::ConnectionLost { request_id }),
        }
    }

    /// Close the socket. Outstanding requests fail with `ConnectionLost`.
    pub fn disconnect(&self) {
        let previous = std::mem::replace(&mut *self.inner.link.lock(), LinkState::Idle);
        if let LinkState::Connected { outgoing, .. } = previous {
            let _ = outgoing.send(Message::Close(None));
            info!("Channel to {} closed", self.inner.config.url);
        }
        self.inner.pending.clear();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection tasks
// ─────────────────────────────────────────────────────────────────────────────

async fn dial(inner: Arc<Inner>) -> Result<(), String> {
    let config = &inner.config;
    let attempts = config.connect_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match tokio::time::timeout(config.attempt_timeout, connect_async(config.url.as_str())).await {
            Ok(Ok((stream, _))) => {
                let generation = inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
                let (ws_tx, ws_rx) = stream.split();
                let (outgoing, outgoing_rx) = mpsc::unbounded_channel();

                *inner.link.lock() = LinkState::Connected {
                    generation,
                    outgoing,
                };
                inner.lost.store(false, Ordering::SeqCst);
                tokio::spawn(write_loop(ws_tx, outgoing_rx));
                tokio::spawn(read_loop(inner.clone(), ws_rx, generation));

                info!("Channel connected to {}", config.url);
                return Ok(());
            }
            Ok(Err(e)) => last_error = e.to_string(),
            Err(_) => last_error = format!("timed out after {:?}", config.attempt_timeout),
        }

        warn!(
            "Channel connect attempt {attempt}/{attempts} to {} failed: {last_error}",
            config.url
        );
        if attempt < attempts {
            tokio::time::sleep(config.retry_delay).await;
        }
    }

    *inner.link.lock() = LinkState::Idle;
    Err(format!("{last_error} (after {attempts} attempts)"))
}

async fn write_loop<S>(mut ws_tx: S, mut outgoing: mpsc::UnboundedReceiver<Message>)
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    while let Some(message) = outgoing.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = ws_tx.send(message).await {
            debug!("Channel write failed: {e}");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = ws_tx.close().await;
}

async fn read_loop<S>(inner: Arc<Inner>, mut ws_rx: S, generation: u64)
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(frame) = ws_rx.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("Channel read failed: {e}");
                break;
            }
        };

        let message = match ChannelMessage::decode(text.as_str()) {
            Ok(message) => message,
            Err(err) => {
                warn!("Dropping malformed frame from backend: {}", err.message);
                continue;
            }
        };

        match message {
            ChannelMessage::ToolCallRequest(request) => {
                let _ = inner.events_tx.send(ChannelEvent::ToolCall(request));
            }
            reply if reply.is_response() => {
                let request_id = reply.request_id().to_string();
                if !inner.pending.resolve(&request_id, reply) {
                    debug!("Dropping unmatched reply {request_id}");
                }
            }
            other => warn!("Ignoring {} frame sent by backend", other.kind()),
        }
    }

    {
        let mut link = inner.link.lock();
        match &*link {
            LinkState::Connected { generation: g, .. } if *g == generation => {
                *link = LinkState::Idle;
            }
            LinkState::Idle => {}
            // A newer connection owns the link.
            _ => return,
        }
    }

    inner.lost.store(true, Ordering::SeqCst);
    inner.pending.clear();
    warn!("Channel to {} lost", inner.config.url);
    let _ = inner.events_tx.send(ChannelEvent::Disconnected);
}
