//! Event dispatcher
//!
//! Routes decoded [`ServerMessage`]s to handlers registered by tag. Stores
//! bind to a session by registering handlers and keep the returned
//! [`HandlerGuard`]s; dropping a guard removes its registration, so tearing a
//! store down cannot leave a stale handler behind.
//!
//! Dispatch is synchronous on the caller (the transport reader task) in
//! registration order. A panicking handler is isolated: it is logged and the
//! remaining handlers for the same message still run.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, Weak};

use crate::protocol::ServerMessage;

/// Identity of a single registration, unique per dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler = Arc<dyn Fn(&ServerMessage) + Send + Sync>;

struct Entry {
    id: HandlerId,
    key: Option<String>,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    handlers: HashMap<String, Vec<Entry>>,
    next_id: u64,
}

impl Registry {
    fn register(&mut self, tag: &str, key: Option<String>, handler: Handler) -> HandlerId {
        let id = HandlerId(self.next_id);
        self.next_id += 1;
        self.handlers
            .entry(tag.to_string())
            .or_default()
            .push(Entry { id, key, handler });
        id
    }

    fn remove(&mut self, tag: &str, id: HandlerId) -> bool {
        let Some(entries) = self.handlers.get_mut(tag) else {
            return false;
        };
        let Some(pos) = entries.iter().position(|e| e.id == id) else {
            return false;
        };
        entries.remove(pos);
        if entries.is_empty() {
            self.handlers.remove(tag);
        }
        true
    }

    fn has_key(&self, tag: &str, key: &str) -> bool {
        self.handlers
            .get(tag)
            .map(|entries| entries.iter().any(|e| e.key.as_deref() == Some(key)))
            .unwrap_or(false)
    }
}

/// Tag-keyed handler registry shared by the transport and the stores
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Mutex<Registry>>,
    dedup: bool,
}

impl Dispatcher {
    /// `dedup` controls [`Dispatcher::on_keyed`]: with it off (the default
    /// config), registering the same key twice invokes the handler twice per
    /// message, matching how repeated registration has always behaved.
    pub fn new(dedup: bool) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            dedup,
        }
    }

    /// Register a handler for one message tag.
    ///
    /// The registration lives until the returned guard is dropped (or
    /// [`HandlerGuard::detach`]ed, after which only [`Dispatcher::off`] or
    /// [`Dispatcher::clear`] remove it).
    pub fn on<F>(&self, tag: &str, handler: F) -> HandlerGuard
    where
        F: Fn(&ServerMessage) + Send + Sync + 'static,
    {
        let id = self.lock().register(tag, None, Arc::new(handler));
        self.guard(tag, id)
    }

    /// Register under a caller-chosen key.
    ///
    /// With dedup enabled a key already present for the tag makes this a
    /// no-op and the returned guard is inert; otherwise behaves like
    /// [`Dispatcher::on`].
    pub fn on_keyed<F>(&self, tag: &str, key: &str, handler: F) -> HandlerGuard
    where
        F: Fn(&ServerMessage) + Send + Sync + 'static,
    {
        let mut registry = self.lock();
        if self.dedup && registry.has_key(tag, key) {
            tracing::debug!("Handler '{}' already registered for '{}', skipping", key, tag);
            drop(registry);
            return HandlerGuard::inert();
        }
        let id = registry.register(tag, Some(key.to_string()), Arc::new(handler));
        drop(registry);
        self.guard(tag, id)
    }

    /// Remove the first registration matching `id`. Returns whether one was
    /// found.
    pub fn off(&self, tag: &str, id: HandlerId) -> bool {
        self.lock().remove(tag, id)
    }

    /// Drop every handler for one tag
    pub fn clear(&self, tag: &str) {
        self.lock().handlers.remove(tag);
    }

    /// Drop every handler for every tag
    pub fn clear_all(&self) {
        self.lock().handlers.clear();
    }

    pub fn handler_count(&self, tag: &str) -> usize {
        self.lock().handlers.get(tag).map_or(0, Vec::len)
    }

    /// Invoke every handler registered for the message's tag, in registration
    /// order. Returns the number of handlers invoked.
    ///
    /// Handlers run outside the registry lock, so a handler may re-register
    /// or remove handlers; such changes take effect from the next dispatch.
    pub fn dispatch(&self, message: &ServerMessage) -> usize {
        let tag = message.tag();
        let handlers: Vec<Handler> = {
            let registry = self.lock();
            match registry.handlers.get(tag) {
                Some(entries) => entries.iter().map(|e| Arc::clone(&e.handler)).collect(),
                None => Vec::new(),
            }
        };
        for handler in &handlers {
            if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| handler(message))) {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                tracing::error!("Handler for '{}' panicked: {}", tag, reason);
            }
        }
        handlers.len()
    }

    fn guard(&self, tag: &str, id: HandlerId) -> HandlerGuard {
        HandlerGuard {
            registry: Arc::downgrade(&self.registry),
            tag: tag.to_string(),
            id,
            active: true,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        // Registry mutations never panic, so the lock cannot be poisoned.
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.lock();
        let total: usize = registry.handlers.values().map(Vec::len).sum();
        f.debug_struct("Dispatcher")
            .field("tags", &registry.handlers.len())
            .field("handlers", &total)
            .field("dedup", &self.dedup)
            .finish()
    }
}

/// Owns one handler registration; dropping it deregisters the handler
#[must_use = "dropping the guard immediately removes the handler"]
pub struct HandlerGuard {
    registry: Weak<Mutex<Registry>>,
    tag: String,
    id: HandlerId,
    active: bool,
}

impl HandlerGuard {
    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Leave the handler registered past this guard's lifetime
    pub fn detach(mut self) {
        self.active = false;
    }

    fn inert() -> Self {
        Self {
            registry: Weak::new(),
            tag: String::new(),
            id: HandlerId(u64::MAX),
            active: false,
        }
    }
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            let mut registry = registry.lock().unwrap_or_else(|e| e.into_inner());
            registry.remove(&self.tag, self.id);
        }
    }
}

impl std::fmt::Debug for HandlerGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerGuard")
            .field("tag", &self.tag)
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}
