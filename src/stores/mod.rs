//! Feature stores
//!
//! Each store owns one slice of console state (chat transcript, log buffer,
//! session list, verbose progress feed), translates inbound events into state
//! updates, and exposes imperative actions that send outbound messages or REST
//! calls. Stores never touch the socket; they go through the transport's send
//! channel, the subscription tracker, and the dispatcher.
//!
//! Binding: entering a session drops the previous binding's handler guards,
//! which deregisters them, then registers fresh ones. At most one binding per
//! store at a time.

pub mod chat;
pub mod logs;
pub mod sessions;
pub mod verbose;

pub use chat::{ChatMessage, ChatStore, MessageKind};
pub use logs::LogStore;
pub use sessions::SessionStore;
pub use verbose::VerboseStore;

use std::collections::VecDeque;

use tokio::sync::watch;

/// Per-store binding lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    /// No session entered
    Unbound,
    /// Waiting for the transport to open
    Connecting,
    /// Handlers registered, session active
    Bound,
    /// Binding failed; the error is recorded on the store
    Error,
}

/// Monotonic change counter stores use to wake watchers.
///
/// Receivers obtained from [`ChangeSignal::subscribe`] resolve `changed()`
/// whenever the store mutated since they last looked, so a console loop can
/// redraw without polling.
pub(crate) struct ChangeSignal {
    tx: watch::Sender<u64>,
}

impl ChangeSignal {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx }
    }

    pub(crate) fn notify(&self) {
        self.tx.send_modify(|revision| *revision += 1);
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }
}

/// FIFO buffer that evicts the oldest entries past a cap.
///
/// Capping is a memory bound, not an error signal; the buffers survive
/// reconnects untouched.
pub(crate) struct BoundedBuffer<T> {
    items: VecDeque<T>,
    cap: usize,
}

impl<T> BoundedBuffer<T> {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            items: VecDeque::new(),
            cap: cap.max(1),
        }
    }

    pub(crate) fn push(&mut self, item: T) {
        self.items.push_back(item);
        while self.items.len() > self.cap {
            self.items.pop_front();
        }
    }

    /// Change the cap; shrinking trims the oldest entries immediately
    pub(crate) fn set_cap(&mut self, cap: usize) {
        self.cap = cap.max(1);
        while self.items.len() > self.cap {
            self.items.pop_front();
        }
    }

    pub(crate) fn cap(&self) -> usize {
        self.cap
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.items.clear();
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

impl<T: Clone> BoundedBuffer<T> {
    pub(crate) fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}
