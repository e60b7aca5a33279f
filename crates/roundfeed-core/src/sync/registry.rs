//! Typed observer registry for update events.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::event::{UpdateEvent, UpdateKind};

type Handler = Arc<dyn Fn(&UpdateEvent) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    next_id: u64,
    /// `None` kind means every kind.
    entries: BTreeMap<u64, (Option<UpdateKind>, Handler)>,
}

/// Fan-out of update events to handlers keyed by `UpdateKind`.
///
/// Cheap to clone; clones share the same handler set. Handlers run on the
/// dispatching task in subscription order, outside the registry lock, so a
/// handler may subscribe or unsubscribe.
#[derive(Clone, Default)]
pub struct EventRegistry {
    handlers: Arc<Mutex<Handlers>>,
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRegistry")
            .field("handlers", &self.handlers.lock().entries.len())
            .finish()
    }
}

impl EventRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for events of `kind`.
    pub fn subscribe<F>(&self, kind: UpdateKind, handler: F) -> Subscription
    where
        F: Fn(&UpdateEvent) + Send + Sync + 'static,
    {
        self.insert(Some(kind), Arc::new(handler))
    }

    /// Registers `handler` for every event.
    pub fn subscribe_all<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&UpdateEvent) + Send + Sync + 'static,
    {
        self.insert(None, Arc::new(handler))
    }

    fn insert(&self, kind: Option<UpdateKind>, handler: Handler) -> Subscription {
        let mut handlers = self.handlers.lock();
        let id = handlers.next_id;
        handlers.next_id = handlers.next_id.wrapping_add(1);
        handlers.entries.insert(id, (kind, handler));
        Subscription {
            id,
            handlers: Arc::downgrade(&self.handlers),
        }
    }

    /// Delivers `event` to every matching handler and returns how many ran.
    pub fn dispatch(&self, event: &UpdateEvent) -> usize {
        let matching: Vec<Handler> = self
            .handlers
            .lock()
            .entries
            .values()
            .filter(|(kind, _)| kind.is_none_or(|k| k == event.kind))
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in &matching {
            handler(event);
        }
        matching.len()
    }

    /// Number of handlers that would receive an event of `kind`.
    #[must_use]
    pub fn subscriber_count(&self, kind: UpdateKind) -> usize {
        self.handlers
            .lock()
            .entries
            .values()
            .filter(|(k, _)| k.is_none_or(|k| k == kind))
            .count()
    }

    /// Callback suitable for `PollSynchronizer::start_session`.
    #[must_use]
    pub fn sink(&self) -> impl Fn(UpdateEvent) + Send + Sync + 'static {
        let registry = self.clone();
        move |event| {
            registry.dispatch(&event);
        }
    }
}

/// Handle returned by `EventRegistry::subscribe`.
///
/// Dropping the handle keeps the handler registered; call `unsubscribe` to
/// remove it.
#[derive(Debug)]
#[must_use = "dropping a Subscription keeps the handler registered forever"]
pub struct Subscription {
    id: u64,
    handlers: Weak<Mutex<Handlers>>,
}

impl Subscription {
    /// Removes the handler. Returns `false` if the registry is gone.
    pub fn unsubscribe(self) -> bool {
        self.handlers
            .upgrade()
            .is_some_and(|handlers| handlers.lock().entries.remove(&self.id).is_some())
    }
}
