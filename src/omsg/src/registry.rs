//! The ordered set of listeners owned by a receiving context.

use std::fmt;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::Listener;

/// Opaque handle for a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(Uuid);

impl ListenerId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// One registered listener.
#[derive(Clone)]
pub struct ListenerEntry {
    pub id: ListenerId,

    /// Registration order; strictly increasing within a registry.
    pub order: u64,

    pub listener: Arc<dyn Listener>,
}

impl fmt::Debug for ListenerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerEntry")
            .field("id", &self.id)
            .field("order", &self.order)
            .field("listener", &self.listener.describe())
            .finish()
    }
}

#[derive(Default)]
struct RegistryInner {
    next_order: u64,
    entries: Vec<ListenerEntry>,
}

/// Ordered collection of listeners.
///
/// Cloning yields another handle onto the same registry, so listeners may
/// register further listeners while a dispatch is in progress. Such
/// registrations only affect later dispatches.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a listener. The same listener may be registered more than once.
    pub fn register(&self, listener: impl Listener + 'static) -> ListenerId {
        let listener: Arc<dyn Listener> = Arc::new(listener);
        let mut inner = self.lock();
        let id = ListenerId::new();
        let order = inner.next_order;
        inner.next_order += 1;
        tracing::trace!(%id, order, listener = %listener.describe(), "register");
        inner.entries.push(ListenerEntry {
            id,
            order,
            listener,
        });
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|entry| entry.id != id);
        let removed = inner.entries.len() != before;
        tracing::trace!(%id, removed, "unregister");
        removed
    }

    /// Copy of the current listeners in registration order.
    pub fn snapshot(&self) -> Vec<ListenerEntry> {
        self.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Remove every listener, e.g. when the receiving context is destroyed.
    pub fn clear(&self) {
        self.lock().entries.clear();
    }
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.snapshot()).finish()
    }
}
