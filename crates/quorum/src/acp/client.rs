//! Protocol client: one duplex connection to the remote agent.
//!
//! Responsibilities:
//! - reliable delivery of requests and receipt of matching responses
//! - request/response correlation via a pending table owned exclusively
//!   by this client instance
//! - reconnection with exponential backoff after an unintentional drop
//!
//! Response coordination follows the register-before-send pattern: the
//! waiter is inserted into the pending table before the frame is
//! transmitted, so a fast response can never race the registration. The
//! reader task routes each inbound response to the waiter whose id
//! matches and removes the entry; a second response for the same id
//! finds no entry and is ignored.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{Notify, RwLock, mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use quorum_protocol::{BatchEnvelope, Envelope, RequestPayload, Response, codes};

use crate::error::{AcpError, AcpResult};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// A registered response waiter.
pub(crate) type Waiter = oneshot::Sender<AcpResult<Value>>;

/// Protocol client configuration.
#[derive(Debug, Clone)]
pub struct AcpClientConfig {
    /// Remote agent WebSocket endpoint.
    pub endpoint: String,
    /// Bearer credential sent with the connection handshake.
    pub token: Option<String>,
    /// Upper bound on connection establishment.
    pub connect_timeout: Duration,
    /// Upper bound on any single request/response round trip.
    pub request_timeout: Duration,
    /// Reconnect attempts before reporting permanent failure.
    pub max_reconnect_attempts: u32,
    /// First reconnect delay; doubles per attempt.
    pub reconnect_base_delay: Duration,
    /// Outbound frame buffer; a full buffer means back-pressure.
    pub send_buffer_size: usize,
}

impl Default for AcpClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://localhost:8001".to_string(),
            token: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            max_reconnect_attempts: 3,
            reconnect_base_delay: Duration::from_secs(1),
            send_buffer_size: 64,
        }
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Permanent failure: reconnection budget exhausted or handshake refused.
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Error => write!(f, "error"),
        }
    }
}

struct ClientInner {
    config: AcpClientConfig,
    /// Pending response waiters keyed by request id. Owned exclusively
    /// by this client; never shared across clients.
    pending: RwLock<HashMap<String, Waiter>>,
    /// Outbound frame channel for the current connection epoch.
    out_tx: std::sync::RwLock<Option<mpsc::Sender<Message>>>,
    state_tx: watch::Sender<ConnectionState>,
    /// Set by an intentional disconnect; suppresses reconnection.
    closed: AtomicBool,
    reconnect_attempts: AtomicU32,
    capabilities: RwLock<Vec<String>>,
    /// Woken on connect, write-drain, and removal so pool waiters can
    /// re-check availability.
    listener: Option<Arc<Notify>>,
}

/// Client for one duplex connection to the remote agent.
///
/// Cheap to clone; all clones share the same connection and pending
/// table.
#[derive(Clone)]
pub struct AcpClient {
    inner: Arc<ClientInner>,
}

impl AcpClient {
    /// Create a disconnected client.
    pub fn new(config: AcpClientConfig) -> Self {
        Self::with_listener(config, None)
    }

    /// Create a disconnected client that wakes `listener` on
    /// availability changes (used by the connection pool).
    pub fn with_listener(config: AcpClientConfig, listener: Option<Arc<Notify>>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(ClientInner {
                config,
                pending: RwLock::new(HashMap::new()),
                out_tx: std::sync::RwLock::new(None),
                state_tx,
                closed: AtomicBool::new(false),
                reconnect_attempts: AtomicU32::new(0),
                capabilities: RwLock::new(Vec::new()),
                listener,
            }),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Subscribe to state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Open and free of back-pressure.
    pub fn available(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.inner
            .out_tx
            .read()
            .unwrap()
            .as_ref()
            .map(|tx| tx.capacity() > 0)
            .unwrap_or(false)
    }

    /// Number of pending (unanswered) requests.
    pub async fn pending_count(&self) -> usize {
        self.inner.pending.read().await.len()
    }

    /// Establish the connection, advertising `capabilities` in the
    /// handshake. Resolves on open; fails on handshake rejection or
    /// after the connect timeout.
    pub async fn connect(&self, capabilities: &[&str]) -> AcpResult<()> {
        {
            let mut caps = self.inner.capabilities.write().await;
            *caps = capabilities.iter().map(|s| (*s).to_string()).collect();
        }
        self.inner.closed.store(false, Ordering::SeqCst);
        self.do_connect().await
    }

    fn do_connect(&self) -> impl std::future::Future<Output = AcpResult<()>> + Send + '_ { async move {
        let inner = &self.inner;
        inner.state_tx.send_replace(ConnectionState::Connecting);

        let mut request = inner
            .config
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| AcpError::Connection(format!("invalid endpoint: {e}")))?;

        // The handshake carries the bearer credential; the remote closes
        // the connection before any session traffic if it is rejected.
        if let Some(token) = &inner.config.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| AcpError::Connection(format!("invalid token: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        let caps = inner.capabilities.read().await.join(",");
        if !caps.is_empty() {
            let value = HeaderValue::from_str(&caps)
                .map_err(|e| AcpError::Connection(format!("invalid capabilities: {e}")))?;
            request.headers_mut().insert("x-acp-capabilities", value);
        }

        let connected = tokio::time::timeout(inner.config.connect_timeout, connect_async(request))
            .await
            .map_err(|_| {
                inner.state_tx.send_replace(ConnectionState::Error);
                AcpError::Connection(format!(
                    "connection timeout after {:?}",
                    inner.config.connect_timeout
                ))
            })?;

        let (socket, _) = connected.map_err(|e| {
            inner.state_tx.send_replace(ConnectionState::Error);
            AcpError::Connection(e.to_string())
        })?;

        let (sink, stream) = socket.split();
        let (out_tx, out_rx) = mpsc::channel(inner.config.send_buffer_size);
        *inner.out_tx.write().unwrap() = Some(out_tx);

        tokio::spawn(Self::writer_task(sink, out_rx, self.clone()));
        tokio::spawn(Self::reader_task(stream, self.clone()));

        inner.reconnect_attempts.store(0, Ordering::SeqCst);
        inner.state_tx.send_replace(ConnectionState::Connected);
        self.notify_available();
        info!("acp client connected to {}", inner.config.endpoint);
        Ok(())
    } }

    /// Send one request and await its matching response.
    pub async fn request(&self, payload: RequestPayload) -> AcpResult<Value> {
        let envelope = Envelope::new(payload);
        let (tx, rx) = oneshot::channel();
        self.send_with_waiters(vec![(envelope, tx)]).await?;
        rx.await.map_err(|_| AcpError::ConnectionLost)?
    }

    /// Send one or more envelopes as a single frame.
    ///
    /// Every waiter is registered in this client's pending table before
    /// the frame is transmitted. A single envelope is sent plain; more
    /// than one is wrapped in a batch frame so the remote processes them
    /// as one logical delivery. On transmit failure all given waiters
    /// are rejected immediately; none are silently dropped.
    pub(crate) async fn send_with_waiters(
        &self,
        entries: Vec<(Envelope, Waiter)>,
    ) -> AcpResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let out_tx = self.inner.out_tx.read().unwrap().clone();
        let Some(out_tx) = out_tx else {
            let error = if self.state() == ConnectionState::Error {
                AcpError::ReconnectFailed {
                    attempts: self.inner.config.max_reconnect_attempts,
                    message: "connection permanently failed".to_string(),
                }
            } else {
                AcpError::Connection("not connected".to_string())
            };
            for (_, waiter) in entries {
                let _ = waiter.send(Err(error.clone()));
            }
            return Err(error);
        };

        let ids: Vec<String> = entries.iter().map(|(e, _)| e.id.clone()).collect();
        let mut envelopes = Vec::with_capacity(entries.len());
        {
            let mut pending = self.inner.pending.write().await;
            for (envelope, waiter) in entries {
                pending.insert(envelope.id.clone(), waiter);
                envelopes.push(envelope);
            }
        }

        let json = if envelopes.len() == 1 {
            serde_json::to_string(&envelopes[0])
        } else {
            debug!("sending batch of {} envelopes", envelopes.len());
            serde_json::to_string(&BatchEnvelope::new(envelopes))
        }
        .map_err(|e| AcpError::Parse(e.to_string()))?;

        if let Err(err) = out_tx.send(Message::Text(json.into())).await {
            let error = AcpError::Connection(format!("transmit failed: {err}"));
            let mut pending = self.inner.pending.write().await;
            for id in &ids {
                if let Some(waiter) = pending.remove(id) {
                    let _ = waiter.send(Err(error.clone()));
                }
            }
            return Err(error);
        }

        // Arm a deadline per request. Expiry removes the entry so a
        // late response is ignored and the table cannot leak.
        for id in ids {
            let client = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(client.inner.config.request_timeout).await;
                if let Some(waiter) = client.inner.pending.write().await.remove(&id) {
                    debug!("request {id} timed out");
                    let _ = waiter.send(Err(AcpError::Timeout(client.inner.config.request_timeout)));
                }
            });
        }

        Ok(())
    }

    /// Close the connection intentionally. Suppresses reconnection.
    pub async fn disconnect(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let out_tx = self.inner.out_tx.write().unwrap().take();
        if let Some(tx) = out_tx {
            let _ = tx.send(Message::Close(None)).await;
        }
        self.inner
            .state_tx
            .send_replace(ConnectionState::Disconnected);
    }

    fn notify_available(&self) {
        if let Some(listener) = &self.inner.listener {
            listener.notify_waiters();
        }
    }

    async fn writer_task(mut sink: WsSink, mut out_rx: mpsc::Receiver<Message>, client: AcpClient) {
        while let Some(message) = out_rx.recv().await {
            if let Err(err) = sink.send(message).await {
                warn!("acp write failed: {err}");
                break;
            }
            // A drained slot may clear back-pressure for pool waiters.
            client.notify_available();
        }
        let _ = sink.close().await;
        debug!("acp writer task ended");
    }

    async fn reader_task(mut stream: WsStream, client: AcpClient) {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => client.handle_frame(&text).await,
                Ok(Message::Ping(data)) => client.send_raw(Message::Pong(data)).await,
                Ok(Message::Close(_)) => {
                    debug!("acp server sent close");
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("acp read failed: {err}");
                    break;
                }
            }
        }
        client.handle_disconnection().await;
    }

    async fn handle_frame(&self, text: &str) {
        let response: Response = match serde_json::from_str(text) {
            Ok(response) => response,
            Err(err) => {
                warn!("failed to parse acp response: {err}");
                return;
            }
        };

        let waiter = self.inner.pending.write().await.remove(&response.id);
        let Some(waiter) = waiter else {
            // Duplicate, expired, or never ours: at most one delivery
            // per request id.
            debug!("ignoring response with no pending waiter: {}", response.id);
            return;
        };

        let result = if response.success {
            Ok(response.data.unwrap_or(Value::Null))
        } else {
            let (code, message) = response
                .error
                .map(|e| (e.code, e.message))
                .unwrap_or_else(|| {
                    (
                        codes::OPERATION_FAILED.to_string(),
                        "request failed".to_string(),
                    )
                });
            Err(AcpError::Remote { code, message })
        };
        let _ = waiter.send(result);
    }

    async fn send_raw(&self, message: Message) {
        let out_tx = self.inner.out_tx.read().unwrap().clone();
        if let Some(tx) = out_tx {
            let _ = tx.send(message).await;
        }
    }

    async fn handle_disconnection(&self) {
        let inner = &self.inner;
        *inner.out_tx.write().unwrap() = None;
        inner.state_tx.send_replace(ConnectionState::Disconnected);

        // Reject every pending request in one sweep; the table is empty
        // afterwards.
        let drained: Vec<(String, Waiter)> = inner.pending.write().await.drain().collect();
        if !drained.is_empty() {
            warn!(
                "rejecting {} pending request(s) after connection loss",
                drained.len()
            );
        }
        for (_, waiter) in drained {
            let _ = waiter.send(Err(AcpError::ConnectionLost));
        }
        self.notify_available();

        if inner.closed.load(Ordering::SeqCst) {
            return;
        }

        let client = self.clone();
        tokio::spawn(async move { client.reconnect_loop().await });
    }

    async fn reconnect_loop(&self) {
        let max = self.inner.config.max_reconnect_attempts;
        loop {
            let attempt = self.inner.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > max {
                error!("acp reconnect exhausted after {max} attempt(s)");
                self.inner.state_tx.send_replace(ConnectionState::Error);
                self.notify_available();
                return;
            }

            let delay = self.inner.config.reconnect_base_delay * 2u32.pow(attempt - 1);
            info!("acp reconnect attempt {attempt}/{max} in {delay:?}");
            tokio::time::sleep(delay).await;

            if self.inner.closed.load(Ordering::SeqCst) {
                return;
            }
            match self.do_connect().await {
                // do_connect resets the attempt counter.
                Ok(()) => return,
                Err(err) => {
                    warn!("acp reconnect failed: {err}");
                    // Stay Disconnected (not Error) while attempts
                    // remain, so the pool keeps this member until the
                    // budget is truly exhausted.
                    self.inner
                        .state_tx
                        .send_replace(ConnectionState::Disconnected);
                }
            }
        }
    }
}

impl std::fmt::Debug for AcpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcpClient")
            .field("endpoint", &self.inner.config.endpoint)
            .field("state", &self.state())
            .finish()
    }
}
