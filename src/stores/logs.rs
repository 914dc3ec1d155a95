//! Streamed server log store
//!
//! Entries arrive over the socket as `log_stream` frames and land in a
//! capped buffer after passing the level filter. Source subscriptions go
//! through the [`SubscriptionTracker`] so the subscribed set survives
//! reconnects.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use super::{BindingState, BoundedBuffer, ChangeSignal};
use crate::config::LimitsConfig;
use crate::error::Result;
use crate::events::{Dispatcher, HandlerGuard};
use crate::protocol::{LogEntry, LogLevel, ServerMessage};
use crate::subscriptions::SubscriptionTracker;

/// Owns the streamed log buffer and the level filter
pub struct LogStore {
    tracker: Arc<SubscriptionTracker>,
    dispatcher: Dispatcher,
    shared: Arc<LogShared>,
}

struct LogShared {
    tracker: Arc<SubscriptionTracker>,
    state: Mutex<LogState>,
    signal: ChangeSignal,
}

struct LogState {
    binding: BindingState,
    entries: BoundedBuffer<LogEntry>,
    available_sources: Vec<String>,
    enabled_levels: BTreeSet<LogLevel>,
    guards: Vec<HandlerGuard>,
}

fn default_levels() -> BTreeSet<LogLevel> {
    // DEBUG is off by default; the firehose drowns the panel otherwise.
    LogLevel::ALL
        .into_iter()
        .filter(|l| *l != LogLevel::Debug)
        .collect()
}

impl LogStore {
    pub(crate) fn new(
        tracker: Arc<SubscriptionTracker>,
        dispatcher: Dispatcher,
        limits: &LimitsConfig,
    ) -> Self {
        Self {
            tracker: tracker.clone(),
            dispatcher,
            shared: Arc::new(LogShared {
                tracker,
                state: Mutex::new(LogState {
                    binding: BindingState::Unbound,
                    entries: BoundedBuffer::new(limits.max_log_entries),
                    available_sources: Vec::new(),
                    enabled_levels: default_levels(),
                    guards: Vec::new(),
                }),
                signal: ChangeSignal::new(),
            }),
        }
    }

    /// Attach to the current session's stream: clear previous state and
    /// register handlers. The transport connection is shared with the chat
    /// store, so binding here never dials.
    pub fn bind(&self) {
        let guards = self.register_handlers();
        {
            let mut state = self.shared.lock();
            state.guards = guards;
            state.binding = BindingState::Bound;
            state.entries.clear();
            state.available_sources.clear();
        }
        self.shared.signal.notify();

        // The handshake may already be behind us; ask for sources directly
        // and let the connection_established handler cover the next one.
        if let Err(e) = self.tracker.request_sources() {
            tracing::debug!(error = %e, "Log source listing deferred");
        }
    }

    fn register_handlers(&self) -> Vec<HandlerGuard> {
        let weak = Arc::downgrade(&self.shared);
        let on_entry = self.dispatcher.on("log_stream", move |msg| {
            let Some(shared) = weak.upgrade() else { return };
            if let ServerMessage::LogStream(entry) = msg {
                shared.ingest(entry);
            }
        });

        let weak = Arc::downgrade(&self.shared);
        let on_sources = self.dispatcher.on("log_sources_response", move |msg| {
            let Some(shared) = weak.upgrade() else { return };
            if let ServerMessage::LogSourcesResponse(response) = msg {
                shared.lock().available_sources = response.available_sources.clone();
                shared.signal.notify();
            }
        });

        let weak = Arc::downgrade(&self.shared);
        let on_established = self.dispatcher.on("connection_established", move |_| {
            let Some(shared) = weak.upgrade() else { return };
            if let Err(e) = shared.tracker.request_sources() {
                tracing::debug!(error = %e, "Log source listing failed");
            }
        });

        vec![on_entry, on_sources, on_established]
    }

    /// Subscribe to the given source streams
    pub fn subscribe(&self, sources: &[String]) -> Result<()> {
        self.tracker.subscribe(sources)
    }

    /// Unsubscribe the given sources, or everything when `None`
    pub fn unsubscribe(&self, sources: Option<&[String]>) -> Result<()> {
        self.tracker.unsubscribe(sources)
    }

    /// Sources currently subscribed (tracker view)
    pub fn subscribed_sources(&self) -> Vec<String> {
        self.tracker.tracked()
    }

    /// Re-request the server's available source list
    pub fn request_sources(&self) -> Result<()> {
        self.tracker.request_sources()
    }

    pub fn available_sources(&self) -> Vec<String> {
        self.shared.lock().available_sources.clone()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.shared.lock().entries.to_vec()
    }

    /// Last `n` entries whose source is in `sources`, oldest first.
    ///
    /// Panel tabs group related sources, e.g. `["ollama_general",
    /// "ollama_digest", "ollama_embed"]` for the model tab.
    pub fn tab_logs(&self, sources: &[&str], n: usize) -> Vec<LogEntry> {
        let state = self.shared.lock();
        let matched: Vec<&LogEntry> = state
            .entries
            .iter()
            .filter(|entry| sources.contains(&entry.source.as_str()))
            .collect();
        let skip = matched.len().saturating_sub(n);
        matched.into_iter().skip(skip).cloned().collect()
    }

    /// Toggle one level in the ingest filter
    pub fn set_level_enabled(&self, level: LogLevel, enabled: bool) {
        {
            let mut state = self.shared.lock();
            if enabled {
                state.enabled_levels.insert(level);
            } else {
                state.enabled_levels.remove(&level);
            }
        }
        self.shared.signal.notify();
    }

    pub fn enabled_levels(&self) -> BTreeSet<LogLevel> {
        self.shared.lock().enabled_levels.clone()
    }

    /// Change the buffer cap at runtime; shrinking evicts oldest entries
    pub fn set_cap(&self, cap: usize) {
        self.shared.lock().entries.set_cap(cap);
        self.shared.signal.notify();
    }

    pub fn clear(&self) {
        self.shared.lock().entries.clear();
        self.shared.signal.notify();
    }

    pub fn binding(&self) -> BindingState {
        self.shared.lock().binding
    }

    /// Unsubscribe everything, drop handlers, and clear the buffer
    pub fn cleanup(&self) {
        if let Err(e) = self.tracker.unsubscribe_all() {
            tracing::debug!(error = %e, "Log unsubscribe skipped");
        }
        {
            let mut state = self.shared.lock();
            state.guards.clear();
            state.binding = BindingState::Unbound;
            state.entries.clear();
            state.available_sources.clear();
        }
        self.shared.signal.notify();
    }

    /// Change counter for console redraw loops
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.shared.signal.subscribe()
    }
}

impl LogShared {
    fn lock(&self) -> std::sync::MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ingest(&self, entry: &LogEntry) {
        {
            let mut state = self.lock();
            if !state.enabled_levels.contains(&entry.level) {
                return;
            }
            state.entries.push(entry.clone());
        }
        self.signal.notify();
    }
}
