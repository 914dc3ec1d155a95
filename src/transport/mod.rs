//! WebSocket connection transport
//!
//! Owns the socket for one agent session at a time. The socket handle lives
//! exclusively inside a spawned I/O task; callers reach it through a single
//! outbound channel, so send ordering can never be corrupted by concurrent
//! writers, and inbound frames are decoded and dispatched in delivery order.
//!
//! Every `connect` and `disconnect` bumps a connection epoch. Background work
//! spawned for one generation (the reconnect loop, the heartbeat monitor, a
//! dial still in flight) re-checks the epoch before touching shared state, so
//! a timer that fires after its connection has been replaced is a no-op.
//!
//! Abnormal closures trigger automatic reconnection with linearly growing,
//! capped delays. Running out of attempts is terminal: the transport parks in
//! [`ConnectionState::Failed`], emits a synthetic `error` event, and waits for
//! a manual `connect`.

pub mod backoff;
pub mod heartbeat;

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::{AgentdeckConfig, TransportConfig};
use crate::error::{Error, Result};
use crate::events::Dispatcher;
use crate::protocol::{parse_server_frame, ClientMessage, ErrorPayload, ServerMessage};
use crate::subscriptions::MessageSink;
use backoff::{is_clean_close, ReconnectPolicy};
use heartbeat::HeartbeatMonitor;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Socket lifecycle state, observable through [`Transport::subscribe_state`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket, nothing scheduled
    Disconnected,
    /// Dialing, or waiting between reconnect attempts
    Connecting,
    /// Socket open and usable
    Open,
    /// Close requested, the close frame is still draining
    Closing,
    /// Reconnect attempts exhausted; requires a manual `connect`
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// WebSocket transport for one agent session at a time
pub struct Transport {
    shared: Arc<Shared>,
}

struct Shared {
    base_url: String,
    config: TransportConfig,
    dispatcher: Dispatcher,
    state_tx: watch::Sender<ConnectionState>,
    inner: Mutex<Inner>,
}

struct Inner {
    /// Connection generation; bumped by connect, disconnect, and every
    /// socket install so stale background work can recognize itself
    epoch: u64,
    session_id: Option<String>,
    connection_id: Option<String>,
    outbound: Option<mpsc::UnboundedSender<ClientMessage>>,
    policy: ReconnectPolicy,
    heartbeat: Option<HeartbeatMonitor>,
    reconnect_task: Option<JoinHandle<()>>,
}

impl Transport {
    pub fn new(config: &AgentdeckConfig, dispatcher: Dispatcher) -> Self {
        let transport = config.transport.clone();
        let policy = ReconnectPolicy::new(
            transport.max_reconnect_attempts,
            transport.reconnect_base_delay(),
            transport.reconnect_delay_cap,
        );
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                base_url: config.server.base_url.clone(),
                config: transport,
                dispatcher,
                state_tx,
                inner: Mutex::new(Inner {
                    epoch: 0,
                    session_id: None,
                    connection_id: None,
                    outbound: None,
                    policy,
                    heartbeat: None,
                    reconnect_task: None,
                }),
            }),
        }
    }

    /// Open a socket to the per-session endpoint.
    ///
    /// Resolves once the socket is open; the application handshake (the
    /// `connection_established` event carrying the connection id) completes
    /// afterwards on the I/O task. While a connection is already open or in
    /// flight this is a silent no-op; `disconnect` first to switch sessions.
    pub async fn connect(&self, session_id: &str) -> Result<()> {
        let url = websocket_url(&self.shared.base_url, session_id)?;

        let generation = {
            let mut inner = self.shared.lock_inner();
            match self.shared.state() {
                ConnectionState::Connecting | ConnectionState::Open => {
                    tracing::debug!(session_id, "Connect ignored, already connected or connecting");
                    return Ok(());
                }
                _ => {}
            }
            inner.epoch += 1;
            if let Some(task) = inner.reconnect_task.take() {
                task.abort();
            }
            inner.heartbeat = None;
            inner.outbound = None;
            inner.connection_id = None;
            inner.session_id = Some(session_id.to_string());
            inner.policy.reset();
            self.shared.set_state(ConnectionState::Connecting);
            inner.epoch
        };

        tracing::info!(session_id, url = %url, "Connecting");
        let dial = tokio::time::timeout(self.shared.config.connect_timeout(), connect_async(&url));
        let stream = match dial.await {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                self.shared.abandon(generation);
                tracing::warn!(session_id, error = %e, "Connect failed");
                return Err(e.into());
            }
            Err(_) => {
                self.shared.abandon(generation);
                tracing::warn!(session_id, "Connect timed out");
                return Err(Error::Timeout(format!("connect to {url} timed out")));
            }
        };

        let mut inner = self.shared.lock_inner();
        if inner.epoch != generation {
            // A disconnect raced the dial; the socket we just opened is unwanted.
            drop(inner);
            tokio::spawn(async move {
                let mut stream = stream;
                let _ = stream.close(None).await;
            });
            return Ok(());
        }
        self.shared.install_socket(&mut inner, stream);
        drop(inner);
        tracing::info!(session_id, "Connected");
        Ok(())
    }

    /// Close the socket with a normal-closure code and clear local state.
    ///
    /// Idempotent. Bumps the epoch, so any scheduled reconnect or in-flight
    /// dial for the torn-down connection is suppressed.
    pub fn disconnect(&self) {
        let outbound = {
            let mut inner = self.shared.lock_inner();
            inner.epoch += 1;
            if let Some(task) = inner.reconnect_task.take() {
                task.abort();
            }
            inner.heartbeat = None;
            inner.connection_id = None;
            inner.session_id = None;
            inner.policy.reset();
            inner.outbound.take()
        };
        if outbound.is_some() {
            tracing::info!("Disconnecting");
            self.shared.set_state(ConnectionState::Closing);
            // Dropping the sender makes the I/O task send Close(1000) and
            // finish the Closing -> Disconnected transition.
            drop(outbound);
        } else {
            self.shared.set_state(ConnectionState::Disconnected);
        }
    }

    /// Queue a typed message for sending. Fails when no socket is open.
    pub fn send_message(&self, message: ClientMessage) -> Result<()> {
        self.shared.send(message)
    }

    /// Server-assigned connection id, present once the handshake completed
    pub fn connection_id(&self) -> Option<String> {
        self.shared.lock_inner().connection_id.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Watch-style state signal; receivers see every settled state change
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }
}

impl MessageSink for Transport {
    fn send_message(&self, message: ClientMessage) -> Result<()> {
        self.shared.send(message)
    }

    fn connection_id(&self) -> Option<String> {
        self.shared.lock_inner().connection_id.clone()
    }
}

impl Shared {
    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Handler panics are isolated by the dispatcher, so a poisoned lock
        // only means a panic between guard and drop; the data is still sound.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        self.state_tx.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            tracing::debug!(from = %state, to = %next, "Transport state change");
            *state = next;
            true
        });
    }

    fn send(&self, message: ClientMessage) -> Result<()> {
        let inner = self.lock_inner();
        match &inner.outbound {
            Some(tx) => tx.send(message).map_err(|_| Error::NotConnected),
            None => Err(Error::NotConnected),
        }
    }

    /// Roll back to Disconnected after a failed dial, unless something newer
    /// owns the state already
    fn abandon(&self, generation: u64) {
        let inner = self.lock_inner();
        if inner.epoch == generation {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Wire a freshly opened socket into the transport. Takes a new epoch,
    /// spawns the I/O task, and resets the reconnect budget.
    fn install_socket(self: &Arc<Self>, inner: &mut Inner, stream: WsStream) {
        inner.epoch += 1;
        let generation = inner.epoch;
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        inner.outbound = Some(out_tx);
        inner.connection_id = None;
        inner.heartbeat = None;
        inner.policy.reset();
        self.set_state(ConnectionState::Open);
        tokio::spawn(run_io(Arc::downgrade(self), generation, stream, out_rx));
    }

    /// Decode one inbound text frame and fan it out. The handshake event is
    /// intercepted first so handlers already see the connection id.
    fn handle_frame(self: &Arc<Self>, generation: u64, text: &str) {
        let Some(message) = parse_server_frame(text) else {
            return;
        };
        if let ServerMessage::ConnectionEstablished(est) = &message {
            let mut inner = self.lock_inner();
            if inner.epoch == generation {
                tracing::info!(connection_id = %est.connection_id, "Connection established");
                inner.connection_id = Some(est.connection_id.clone());
                let weak = Arc::downgrade(self);
                // Replaced wholesale if the server re-handshakes on the same
                // socket; the old monitor is aborted by drop.
                inner.heartbeat = Some(HeartbeatMonitor::start(
                    est.connection_id.clone(),
                    self.config.heartbeat_interval(),
                    move |beat| match weak.upgrade() {
                        Some(shared) => shared.send(beat),
                        None => Err(Error::NotConnected),
                    },
                ));
            }
        }
        self.dispatcher.dispatch(&message);
    }

    /// Settle state after the I/O task stops reading.
    ///
    /// For the current generation this either finishes a clean close or hands
    /// the connection to the reconnect loop. For a superseded generation the
    /// only thing left to finish is a user-requested close.
    fn on_io_exit(self: &Arc<Self>, generation: u64, clean: bool) {
        let mut inner = self.lock_inner();
        if inner.epoch != generation {
            if clean && self.state() == ConnectionState::Closing {
                self.set_state(ConnectionState::Disconnected);
            }
            return;
        }
        inner.outbound = None;
        inner.connection_id = None;
        inner.heartbeat = None;
        if clean {
            drop(inner);
            self.set_state(ConnectionState::Disconnected);
            tracing::info!("Connection closed");
            return;
        }
        self.set_state(ConnectionState::Connecting);
        tracing::warn!("Connection lost, scheduling reconnect");
        let weak = Arc::downgrade(self);
        inner.reconnect_task = Some(tokio::spawn(run_reconnect(weak, generation)));
    }
}

/// Owns the socket: writes queued outbound messages, decodes and dispatches
/// inbound frames, and classifies how the connection ended.
async fn run_io(
    shared: Weak<Shared>,
    generation: u64,
    stream: WsStream,
    mut out_rx: mpsc::UnboundedReceiver<ClientMessage>,
) {
    let (mut writer, mut reader) = stream.split();
    let mut clean = false;
    loop {
        tokio::select! {
            outbound = out_rx.recv() => match outbound {
                Some(message) => {
                    let text = match serde_json::to_string(&message) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::warn!(error = %e, "Dropping unserializable outbound message");
                            continue;
                        }
                    };
                    if let Err(e) = writer.send(Message::Text(text)).await {
                        tracing::debug!(error = %e, "Socket write failed");
                        break;
                    }
                }
                None => {
                    // Disconnect requested: close politely and stop.
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "client disconnect".into(),
                    };
                    let _ = writer.send(Message::Close(Some(frame))).await;
                    clean = true;
                    break;
                }
            },
            inbound = reader.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    let Some(shared) = shared.upgrade() else { break };
                    shared.handle_frame(generation, &text);
                }
                Some(Ok(Message::Ping(payload))) => {
                    if writer.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    clean = is_clean_close(frame.as_ref());
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "Socket read failed");
                    break;
                }
                None => break,
            },
        }
    }
    if let Some(shared) = shared.upgrade() {
        shared.on_io_exit(generation, clean);
    }
}

/// Redial after an abnormal closure until a socket opens or the attempt
/// budget runs out. Exhaustion is terminal: Failed state plus a synthetic
/// `error` event, nothing further scheduled.
async fn run_reconnect(shared: Weak<Shared>, generation: u64) {
    loop {
        let (delay, url) = {
            let Some(shared) = shared.upgrade() else { return };
            let mut inner = shared.lock_inner();
            if inner.epoch != generation {
                return;
            }
            let Some(session_id) = inner.session_id.clone() else { return };
            let url = match websocket_url(&shared.base_url, &session_id) {
                Ok(url) => url,
                Err(_) => return,
            };
            match inner.policy.next_delay() {
                Some(delay) => (delay, url),
                None => {
                    let attempts = inner.policy.max_attempts();
                    drop(inner);
                    shared.set_state(ConnectionState::Failed);
                    tracing::error!(attempts, "Reconnect attempts exhausted, giving up");
                    shared.dispatcher.dispatch(&ServerMessage::Error(ErrorPayload {
                        error: Some(format!(
                            "connection lost: reconnect failed after {attempts} attempts"
                        )),
                        message: None,
                        timestamp: Some(chrono::Utc::now().to_rfc3339()),
                    }));
                    return;
                }
            }
        };

        tracing::info!(delay_ms = delay.as_millis() as u64, "Reconnecting after delay");
        tokio::time::sleep(delay).await;

        let Some(shared) = shared.upgrade() else { return };
        {
            let inner = shared.lock_inner();
            if inner.epoch != generation {
                return;
            }
        }
        let dial = tokio::time::timeout(shared.config.connect_timeout(), connect_async(&url));
        match dial.await {
            Ok(Ok((stream, _response))) => {
                let mut inner = shared.lock_inner();
                if inner.epoch != generation {
                    drop(inner);
                    tokio::spawn(async move {
                        let mut stream = stream;
                        let _ = stream.close(None).await;
                    });
                    return;
                }
                shared.install_socket(&mut inner, stream);
                drop(inner);
                tracing::info!("Reconnected");
                return;
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Reconnect attempt failed");
            }
            Err(_) => {
                tracing::warn!("Reconnect attempt timed out");
            }
        }
    }
}

/// Per-session WebSocket endpoint derived from the configured server base.
///
/// `http` maps to `ws` and `https` to `wss`; a base that is already a
/// WebSocket URL passes through unchanged.
pub(crate) fn websocket_url(base_url: &str, session_id: &str) -> Result<String> {
    let trimmed = base_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        trimmed.to_string()
    } else {
        return Err(Error::Config(format!(
            "unsupported server URL scheme: {base_url}"
        )));
    };
    Ok(format!("{ws_base}/api/v1/ws/sessions/{session_id}"))
}
