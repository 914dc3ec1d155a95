//! Log subscription tracking
//!
//! Keeps the client's view of which server log sources it is subscribed to.
//! The tracked set is confirmation-driven: requests are sent optimistically,
//! but the set only changes when the server confirms. A `logs_subscribed`
//! confirmation carrying a source list *replaces* the tracked set (the server
//! is authoritative, which also corrects races between concurrent subscribe
//! calls), and `logs_unsubscribed` removes the named sources or clears
//! everything when the server says "all".

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::events::{Dispatcher, HandlerGuard};
use crate::protocol::{
    ClientMessage, EmptyPayload, LogSubscription, LogsSubscribed, LogsUnsubscribed, ServerMessage,
};

/// Outbound surface the tracker needs from the transport
pub trait MessageSink: Send + Sync {
    /// Queue a message for sending; fails when no socket is open
    fn send_message(&self, message: ClientMessage) -> Result<()>;

    /// Server-assigned connection id, once the handshake has completed
    fn connection_id(&self) -> Option<String>;
}

/// Tracks confirmed log source subscriptions for one connection
pub struct SubscriptionTracker {
    sink: Arc<dyn MessageSink>,
    tracked: Arc<Mutex<BTreeSet<String>>>,
    guards: Mutex<Vec<HandlerGuard>>,
}

impl SubscriptionTracker {
    pub fn new(sink: Arc<dyn MessageSink>) -> Self {
        Self {
            sink,
            tracked: Arc::new(Mutex::new(BTreeSet::new())),
            guards: Mutex::new(Vec::new()),
        }
    }

    /// Register confirmation handlers on the dispatcher.
    ///
    /// Binding again replaces the previous registrations, so this is safe to
    /// call on every reconnect.
    pub fn bind(&self, dispatcher: &Dispatcher) {
        let tracked = Arc::clone(&self.tracked);
        let on_subscribed = dispatcher.on_keyed("logs_subscribed", "subscription_tracker", {
            move |msg| {
                if let ServerMessage::LogsSubscribed(confirmation) = msg {
                    Self::apply_confirmation(&tracked, confirmation);
                }
            }
        });

        let tracked = Arc::clone(&self.tracked);
        let on_unsubscribed = dispatcher.on_keyed("logs_unsubscribed", "subscription_tracker", {
            move |msg| {
                if let ServerMessage::LogsUnsubscribed(confirmation) = msg {
                    Self::apply_removal(&tracked, confirmation);
                }
            }
        });

        let mut guards = self.lock_guards();
        guards.clear();
        guards.push(on_subscribed);
        guards.push(on_unsubscribed);
    }

    /// Request subscription to the given sources.
    ///
    /// Requires a completed handshake: the server correlates subscriptions by
    /// connection id.
    pub fn subscribe(&self, sources: &[String]) -> Result<()> {
        let connection_id = self.require_connection_id()?;
        tracing::debug!("Subscribing to log sources: {:?}", sources);
        self.sink
            .send_message(ClientMessage::SubscribeLogs(LogSubscription {
                log_sources: Some(sources.to_vec()),
                connection_id,
            }))
    }

    /// Request unsubscription. `None` means every source the server has for
    /// this connection.
    pub fn unsubscribe(&self, sources: Option<&[String]>) -> Result<()> {
        let connection_id = self.require_connection_id()?;
        tracing::debug!(
            "Unsubscribing from log sources: {:?}",
            sources.unwrap_or(&[])
        );
        self.sink
            .send_message(ClientMessage::UnsubscribeLogs(LogSubscription {
                log_sources: sources.map(<[String]>::to_vec),
                connection_id,
            }))
    }

    /// Unsubscribe from everything currently subscribed
    pub fn unsubscribe_all(&self) -> Result<()> {
        self.unsubscribe(None)
    }

    /// Ask the server for its available log sources
    pub fn request_sources(&self) -> Result<()> {
        self.sink
            .send_message(ClientMessage::GetLogSources(EmptyPayload::default()))
    }

    /// Sources the server has confirmed, in sorted order
    pub fn tracked(&self) -> Vec<String> {
        self.lock_tracked().iter().cloned().collect()
    }

    pub fn is_tracked(&self, source: &str) -> bool {
        self.lock_tracked().contains(source)
    }

    /// Forget all tracked sources without telling the server. Used when the
    /// session (and with it the whole subscription scope) goes away.
    pub fn clear(&self) {
        self.lock_tracked().clear();
    }

    fn apply_confirmation(tracked: &Mutex<BTreeSet<String>>, confirmation: &LogsSubscribed) {
        // A confirmation without a source list (unexpected but possible from
        // older servers) leaves the tracked set alone.
        let Some(confirmed) = confirmation.confirmed() else {
            tracing::warn!("logs_subscribed confirmation carried no source list");
            return;
        };
        let mut tracked = tracked.lock().unwrap_or_else(|e| e.into_inner());
        tracked.clear();
        tracked.extend(confirmed.iter().cloned());
        tracing::debug!("Log subscriptions now: {:?}", tracked);
    }

    fn apply_removal(tracked: &Mutex<BTreeSet<String>>, confirmation: &LogsUnsubscribed) {
        let mut tracked = tracked.lock().unwrap_or_else(|e| e.into_inner());
        match confirmation.removed() {
            Some(removed) => {
                for source in &removed {
                    tracked.remove(source);
                }
                tracing::debug!("Unsubscribed {:?}, remaining: {:?}", removed, tracked);
            }
            None => {
                tracked.clear();
                tracing::debug!("Unsubscribed from all log sources");
            }
        }
    }

    fn require_connection_id(&self) -> Result<String> {
        self.sink.connection_id().ok_or(Error::HandshakePending)
    }

    fn lock_tracked(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.tracked.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_guards(&self) -> std::sync::MutexGuard<'_, Vec<HandlerGuard>> {
        self.guards.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for SubscriptionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionTracker")
            .field("tracked", &*self.lock_tracked())
            .finish()
    }
}
