//! Verbose progress stream store
//!
//! Long-running agent operations emit fine-grained `verbose_status` frames
//! (memory digests, graph merges, retrievals). The stream is opt-in per
//! connection: nothing arrives until [`VerboseStore::subscribe`] is called
//! on an open socket, and the subscribed flag is confirmation-driven.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use super::{BindingState, BoundedBuffer, ChangeSignal};
use crate::config::LimitsConfig;
use crate::error::{Error, Result};
use crate::events::{Dispatcher, HandlerGuard};
use crate::protocol::{ClientMessage, ServerMessage, VerboseStatus, VerboseSubscription};
use crate::transport::Transport;

/// Owns the verbose progress buffer for the currently entered session
pub struct VerboseStore {
    transport: Arc<Transport>,
    dispatcher: Dispatcher,
    shared: Arc<VerboseShared>,
}

struct VerboseShared {
    state: Mutex<VerboseState>,
    signal: ChangeSignal,
}

struct VerboseState {
    binding: BindingState,
    session_id: Option<String>,
    messages: BoundedBuffer<VerboseStatus>,
    subscribed: bool,
    guards: Vec<HandlerGuard>,
}

impl VerboseStore {
    pub(crate) fn new(
        transport: Arc<Transport>,
        dispatcher: Dispatcher,
        limits: &LimitsConfig,
    ) -> Self {
        Self {
            transport,
            dispatcher,
            shared: Arc::new(VerboseShared {
                state: Mutex::new(VerboseState {
                    binding: BindingState::Unbound,
                    session_id: None,
                    messages: BoundedBuffer::new(limits.max_verbose_messages),
                    subscribed: false,
                    guards: Vec::new(),
                }),
                signal: ChangeSignal::new(),
            }),
        }
    }

    /// Attach to a session: clear the buffer and register handlers. Shares
    /// the chat store's socket, so binding never dials.
    pub fn bind(&self, session_id: &str) {
        let guards = self.register_handlers();
        {
            let mut state = self.shared.lock();
            state.guards = guards;
            state.binding = BindingState::Bound;
            state.session_id = Some(session_id.to_string());
            state.messages.clear();
            state.subscribed = false;
        }
        self.shared.signal.notify();
    }

    fn register_handlers(&self) -> Vec<HandlerGuard> {
        let weak = Arc::downgrade(&self.shared);
        let on_status = self.dispatcher.on("verbose_status", move |msg| {
            let Some(shared) = weak.upgrade() else { return };
            if let ServerMessage::VerboseStatus(status) = msg {
                shared.lock().messages.push(status.clone());
                shared.signal.notify();
            }
        });

        let weak = Arc::downgrade(&self.shared);
        let on_subscribed = self.dispatcher.on("verbose_subscribed", move |_| {
            if let Some(shared) = weak.upgrade() {
                shared.set_subscribed(true);
            }
        });

        let weak = Arc::downgrade(&self.shared);
        let on_unsubscribed = self.dispatcher.on("verbose_unsubscribed", move |_| {
            if let Some(shared) = weak.upgrade() {
                shared.set_subscribed(false);
            }
        });

        vec![on_status, on_subscribed, on_unsubscribed]
    }

    /// Ask the server to start streaming verbose status to this connection.
    ///
    /// Requires an open socket and a completed handshake; the flag only
    /// flips when `verbose_subscribed` comes back.
    pub fn subscribe(&self) -> Result<()> {
        if !self.transport.is_connected() {
            return Err(Error::NotConnected);
        }
        let connection_id = self
            .transport
            .connection_id()
            .ok_or(Error::HandshakePending)?;
        self.transport
            .send_message(ClientMessage::SubscribeVerbose(VerboseSubscription {
                connection_id,
            }))
    }

    /// Stop the stream. With the socket already gone the server-side
    /// subscription died with it, so this just clears the flag.
    pub fn unsubscribe(&self) -> Result<()> {
        if !self.transport.is_connected() {
            self.shared.set_subscribed(false);
            return Ok(());
        }
        let connection_id = self
            .transport
            .connection_id()
            .ok_or(Error::HandshakePending)?;
        self.transport
            .send_message(ClientMessage::UnsubscribeVerbose(VerboseSubscription {
                connection_id,
            }))
    }

    pub fn messages(&self) -> Vec<VerboseStatus> {
        self.shared.lock().messages.to_vec()
    }

    pub fn is_subscribed(&self) -> bool {
        self.shared.lock().subscribed
    }

    pub fn binding(&self) -> BindingState {
        self.shared.lock().binding
    }

    pub fn session_id(&self) -> Option<String> {
        self.shared.lock().session_id.clone()
    }

    pub fn clear(&self) {
        self.shared.lock().messages.clear();
        self.shared.signal.notify();
    }

    /// Drop handlers and forget the binding
    pub fn unbind(&self) {
        {
            let mut state = self.shared.lock();
            state.guards.clear();
            state.binding = BindingState::Unbound;
            state.session_id = None;
            state.subscribed = false;
        }
        self.shared.signal.notify();
    }

    /// Change counter for console redraw loops
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.shared.signal.subscribe()
    }
}

impl VerboseShared {
    fn lock(&self) -> std::sync::MutexGuard<'_, VerboseState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_subscribed(&self, subscribed: bool) {
        self.lock().subscribed = subscribed;
        self.signal.notify();
    }
}
