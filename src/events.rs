//! Typed publish/subscribe for session changes.
//!
//! UI consumers register a listener per [`EventKind`] and receive the
//! matching [`SessionEvent`]. Publication is synchronous: [`EventBus::publish`]
//! returns after every listener has run. A listener that panics is logged and
//! skipped; the others still run.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::types::{SessionError, Status, User};

/// Kinds of events a listener can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StatusChange,
    Error,
    TokenExpired,
    TokenExpiring,
    LoggingOut,
    AuthSuccess,
}

/// An event with its payload.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StatusChange(Status),
    Error(SessionError),
    TokenExpired,
    TokenExpiring,
    LoggingOut,
    AuthSuccess(User),
}

impl SessionEvent {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::StatusChange(_) => EventKind::StatusChange,
            Self::Error(_) => EventKind::Error,
            Self::TokenExpired => EventKind::TokenExpired,
            Self::TokenExpiring => EventKind::TokenExpiring,
            Self::LoggingOut => EventKind::LoggingOut,
            Self::AuthSuccess(_) => EventKind::AuthSuccess,
        }
    }
}

/// Callback invoked on publication.
pub type Listener = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: HashMap<EventKind, Vec<(u64, Listener)>>,
}

impl Registry {
    fn remove(&mut self, kind: EventKind, id: u64) {
        if let Some(entries) = self.listeners.get_mut(&kind) {
            entries.retain(|(entry_id, _)| *entry_id != id);
            if entries.is_empty() {
                self.listeners.remove(&kind);
            }
        }
    }
}

/// Listener registry. Cloning shares the registry.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.lock();
        let total: usize = registry.listeners.values().map(Vec::len).sum();
        f.debug_struct("EventBus").field("listeners", &total).finish()
    }
}

fn same_listener(a: &Listener, b: &Listener) -> bool {
    // Compare data pointers only; vtable addresses are not unique.
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for events of `kind`.
    ///
    /// Registering the same `Arc` twice for one kind keeps a single
    /// subscription; both returned disposers refer to it.
    pub fn subscribe(&self, kind: EventKind, listener: Listener) -> Disposer {
        let mut registry = self.registry.lock();
        let existing = registry.listeners.get(&kind).and_then(|entries| {
            entries
                .iter()
                .find(|(_, registered)| same_listener(registered, &listener))
                .map(|(id, _)| *id)
        });
        let id = match existing {
            Some(id) => id,
            None => {
                let id = registry.next_id;
                registry.next_id += 1;
                registry
                    .listeners
                    .entry(kind)
                    .or_default()
                    .push((id, listener));
                id
            }
        };
        Disposer {
            registry: Arc::downgrade(&self.registry),
            kind,
            id,
        }
    }

    /// Convenience for closures.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> Disposer
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.subscribe(kind, Arc::new(listener))
    }

    /// Invoke every listener registered for `event.kind()`.
    ///
    /// Listeners run without the registry lock held. Returns how many ran
    /// to completion.
    pub fn publish(&self, event: &SessionEvent) -> usize {
        let kind = event.kind();
        let snapshot: Vec<Listener> = self
            .registry
            .lock()
            .listeners
            .get(&kind)
            .map(|entries| entries.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();

        let mut delivered = 0;
        for listener in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_owned())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".into());
                    tracing::error!(?kind, %reason, "Session event listener panicked");
                }
            }
        }
        tracing::trace!(?kind, delivered, "Session event published");
        delivered
    }

    /// Number of listeners registered for `kind`.
    #[must_use]
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.registry
            .lock()
            .listeners
            .get(&kind)
            .map_or(0, Vec::len)
    }
}

/// Removes one subscription. Calling [`dispose`](Self::dispose) more than
/// once is harmless. Dropping a `Disposer` does not unsubscribe.
#[derive(Debug, Clone)]
pub struct Disposer {
    registry: Weak<Mutex<Registry>>,
    kind: EventKind,
    id: u64,
}

impl Disposer {
    pub fn dispose(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().remove(self.kind, self.id);
        }
    }
}
