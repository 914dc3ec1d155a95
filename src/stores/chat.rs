//! Chat transcript store
//!
//! Sending is optimistic: the user's bubble goes into the transcript
//! immediately, and the agent's bubble is appended only when a
//! `query_response` arrives. With the socket closed the store falls back to
//! the HTTP query endpoint and appends exactly one agent bubble from its
//! response, so a transcript never shows duplicates for one send.

use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use super::{BindingState, BoundedBuffer, ChangeSignal};
use crate::config::LimitsConfig;
use crate::error::{Error, Result};
use crate::events::{Dispatcher, HandlerGuard};
use crate::protocol::{ClientMessage, QueryPayload, ServerMessage};
use crate::rest::types::AgentQueryRequest;
use crate::rest::RestClient;
use crate::transport::Transport;

/// Who a transcript bubble belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    User,
    Agent,
    System,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::User => "user",
            Self::Agent => "agent",
            Self::System => "system",
        };
        f.write_str(s)
    }
}

/// One transcript bubble
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub id: String,
    pub kind: MessageKind,
    pub content: String,
    pub timestamp: String,
    pub session_id: String,
}

impl ChatMessage {
    fn new(kind: MessageKind, content: String, timestamp: String, session_id: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            content,
            timestamp,
            session_id,
        }
    }
}

/// Owns the chat transcript for the currently entered session
pub struct ChatStore {
    transport: Arc<Transport>,
    rest: Arc<RestClient>,
    dispatcher: Dispatcher,
    shared: Arc<ChatShared>,
}

struct ChatShared {
    state: Mutex<ChatState>,
    signal: ChangeSignal,
}

struct ChatState {
    session_id: Option<String>,
    binding: BindingState,
    history: BoundedBuffer<ChatMessage>,
    typing: bool,
    error: Option<String>,
    guards: Vec<HandlerGuard>,
}

impl ChatStore {
    pub(crate) fn new(
        transport: Arc<Transport>,
        rest: Arc<RestClient>,
        dispatcher: Dispatcher,
        limits: &LimitsConfig,
    ) -> Self {
        Self {
            transport,
            rest,
            dispatcher,
            shared: Arc::new(ChatShared {
                state: Mutex::new(ChatState {
                    session_id: None,
                    binding: BindingState::Unbound,
                    history: BoundedBuffer::new(limits.max_chat_messages),
                    typing: false,
                    error: None,
                    guards: Vec::new(),
                }),
                signal: ChangeSignal::new(),
            }),
        }
    }

    /// Enter a session: tear down the previous binding, clear the transcript,
    /// connect the transport, and register fresh handlers.
    ///
    /// A different session may still own the socket, and `connect` is a no-op
    /// while one is open, so the old connection is dropped first. Re-entering
    /// the current session keeps it.
    ///
    /// The session id is retained even when the connect fails, so sends can
    /// still go out over the HTTP fallback.
    pub async fn set_session(&self, session_id: &str) -> Result<()> {
        let previous = self.shared.lock().session_id.clone();
        if previous.map(|prev| prev != session_id).unwrap_or(false) {
            self.transport.disconnect();
        }

        {
            let mut state = self.shared.lock();
            state.guards.clear();
            state.session_id = Some(session_id.to_string());
            state.binding = BindingState::Connecting;
            state.history.clear();
            state.typing = false;
            state.error = None;
        }
        self.shared.signal.notify();

        if let Err(e) = self.transport.connect(session_id).await {
            {
                let mut state = self.shared.lock();
                state.binding = BindingState::Error;
                state.error = Some(e.to_string());
            }
            self.shared.signal.notify();
            return Err(e);
        }

        let guards = self.register_handlers(session_id);
        {
            let mut state = self.shared.lock();
            state.guards = guards;
            state.binding = BindingState::Bound;
        }
        self.shared.signal.notify();
        tracing::debug!(session_id, "Chat store bound");
        Ok(())
    }

    fn register_handlers(&self, session_id: &str) -> Vec<HandlerGuard> {
        let session = session_id.to_string();
        let weak = Arc::downgrade(&self.shared);
        let on_response = self.dispatcher.on("query_response", move |msg| {
            let Some(shared) = weak.upgrade() else { return };
            if let ServerMessage::QueryResponse(response) = msg {
                let timestamp = response
                    .timestamp
                    .clone()
                    .unwrap_or_else(|| chrono::Utc::now().to_rfc3339());
                shared.push_agent_reply(ChatMessage::new(
                    MessageKind::Agent,
                    response.text().to_string(),
                    timestamp,
                    session.clone(),
                ));
            }
        });

        let weak = Arc::downgrade(&self.shared);
        let on_typing_start = self.dispatcher.on("typing_start", move |_| {
            if let Some(shared) = weak.upgrade() {
                shared.set_typing(true);
            }
        });

        let weak = Arc::downgrade(&self.shared);
        let on_typing_end = self.dispatcher.on("typing_end", move |_| {
            if let Some(shared) = weak.upgrade() {
                shared.set_typing(false);
            }
        });

        let weak = Arc::downgrade(&self.shared);
        let on_error = self.dispatcher.on("error", move |msg| {
            let Some(shared) = weak.upgrade() else { return };
            if let ServerMessage::Error(payload) = msg {
                shared.record_error(payload.text().to_string());
            }
        });

        vec![on_response, on_typing_start, on_typing_end, on_error]
    }

    /// Send a message to the agent.
    ///
    /// The user's bubble is appended before anything touches the network.
    /// Failures after that point are recorded in the transcript and the error
    /// slot rather than returned; only a missing session is an error.
    pub async fn send_message(
        &self,
        text: &str,
        context: Option<serde_json::Value>,
    ) -> Result<()> {
        let session_id = {
            let mut state = self.shared.lock();
            match state.session_id.clone() {
                Some(id) => id,
                None => {
                    state.error = Some("No active session".to_string());
                    drop(state);
                    self.shared.signal.notify();
                    return Err(Error::Session("no active session".to_string()));
                }
            }
        };

        {
            let mut state = self.shared.lock();
            state.history.push(ChatMessage::new(
                MessageKind::User,
                text.to_string(),
                chrono::Utc::now().to_rfc3339(),
                session_id.clone(),
            ));
            state.typing = true;
            state.error = None;
        }
        self.shared.signal.notify();

        if self.transport.is_connected() {
            let query = ClientMessage::Query(QueryPayload {
                message: text.to_string(),
                context: context.clone(),
            });
            // The reply arrives through the query_response handler. A send
            // racing a close falls through to the HTTP path below.
            if self.transport.send_message(query).is_ok() {
                return Ok(());
            }
        }

        let request = AgentQueryRequest {
            message: text.to_string(),
            context,
        };
        match self.rest.query_agent(&session_id, &request).await {
            Ok(response) => {
                let timestamp = if response.timestamp.is_empty() {
                    chrono::Utc::now().to_rfc3339()
                } else {
                    response.timestamp.clone()
                };
                {
                    let mut state = self.shared.lock();
                    state.typing = false;
                    state.history.push(ChatMessage::new(
                        MessageKind::Agent,
                        response.response,
                        timestamp,
                        session_id,
                    ));
                }
                self.shared.signal.notify();
            }
            Err(e) => {
                tracing::warn!(error = %e, "Query fallback failed");
                let text = e.to_string();
                {
                    let mut state = self.shared.lock();
                    state.typing = false;
                    state.error = Some(text.clone());
                    state.history.push(ChatMessage::new(
                        MessageKind::System,
                        format!("Error: {text}"),
                        chrono::Utc::now().to_rfc3339(),
                        session_id,
                    ));
                }
                self.shared.signal.notify();
            }
        }
        Ok(())
    }

    /// Drop the binding's handlers without touching the transcript
    pub fn unbind(&self) {
        {
            let mut state = self.shared.lock();
            state.guards.clear();
            state.binding = BindingState::Unbound;
            state.typing = false;
        }
        self.shared.signal.notify();
    }

    pub fn history(&self) -> Vec<ChatMessage> {
        self.shared.lock().history.to_vec()
    }

    pub fn is_typing(&self) -> bool {
        self.shared.lock().typing
    }

    pub fn error(&self) -> Option<String> {
        self.shared.lock().error.clone()
    }

    pub fn clear_error(&self) {
        self.shared.lock().error = None;
        self.shared.signal.notify();
    }

    pub fn clear_history(&self) {
        self.shared.lock().history.clear();
        self.shared.signal.notify();
    }

    pub fn binding(&self) -> BindingState {
        self.shared.lock().binding
    }

    pub fn session_id(&self) -> Option<String> {
        self.shared.lock().session_id.clone()
    }

    /// Change counter for console redraw loops
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.shared.signal.subscribe()
    }
}

impl ChatShared {
    fn lock(&self) -> std::sync::MutexGuard<'_, ChatState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push_agent_reply(&self, message: ChatMessage) {
        {
            let mut state = self.lock();
            state.typing = false;
            state.history.push(message);
        }
        self.signal.notify();
    }

    fn set_typing(&self, typing: bool) {
        self.lock().typing = typing;
        self.signal.notify();
    }

    fn record_error(&self, text: String) {
        {
            let mut state = self.lock();
            state.typing = false;
            state.error = Some(text);
        }
        self.signal.notify();
    }
}
