//! Process-local publish/subscribe.
//!
//! Topics are exact-match dotted strings. Handlers run synchronously on the
//! dispatching task; a panicking handler is isolated and logged so one bad
//! listener cannot take down the dispatch loop.

use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex},
};

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Entry<T> {
    id:      u64,
    once:    bool,
    handler: Handler<T>,
}

struct Registry<T> {
    next_id: u64,
    topics:  HashMap<String, Vec<Entry<T>>>,
}

/// Topic → list-of-handlers map shared by the transport and its adapters.
pub struct EventBus<T> {
    inner: Arc<Mutex<Registry<T>>>,
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: 'static> Default for EventBus<T> {
    fn default() -> Self { Self::new() }
}

impl<T: 'static> EventBus<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                next_id: 0,
                topics:  HashMap::new(),
            })),
        }
    }

    /// Registers `handler` for every emission of `topic` until the returned
    /// subscription is disposed or dropped.
    pub fn on(
        &self,
        topic: impl Into<String>,
        handler: impl Fn(&T) + Send + Sync + 'static,
    ) -> Subscription {
        self.register(topic.into(), false, Arc::new(handler))
    }

    /// Registers `handler` for the next emission of `topic` only.
    pub fn once(
        &self,
        topic: impl Into<String>,
        handler: impl Fn(&T) + Send + Sync + 'static,
    ) -> Subscription {
        self.register(topic.into(), true, Arc::new(handler))
    }

    fn register(&self, topic: String, once: bool, handler: Handler<T>) -> Subscription {
        let id = {
            let mut registry = self.inner.lock().unwrap();
            let id = registry.next_id;
            registry.next_id += 1;
            registry
                .topics
                .entry(topic.clone())
                .or_default()
                .push(Entry { id, once, handler });
            id
        };
        let inner = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                let mut registry = inner.lock().unwrap();
                if let Some(entries) = registry.topics.get_mut(&topic) {
                    entries.retain(|entry| entry.id != id);
                    if entries.is_empty() {
                        registry.topics.remove(&topic);
                    }
                }
            }
        })
    }

    /// Dispatches `payload` to every handler registered for `topic`, in
    /// registration order. Returns how many handlers ran.
    pub fn emit(&self, topic: &str, payload: &T) -> usize {
        let handlers: Vec<Handler<T>> = {
            let mut registry = self.inner.lock().unwrap();
            match registry.topics.get_mut(topic) {
                None => return 0,
                Some(entries) => {
                    let handlers = entries.iter().map(|e| Arc::clone(&e.handler)).collect();
                    entries.retain(|entry| !entry.once);
                    if entries.is_empty() {
                        registry.topics.remove(topic);
                    }
                    handlers
                },
            }
        };
        for handler in &handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(payload))).is_err() {
                tracing::warn!(topic, "event handler panicked; listener isolated");
            }
        }
        handlers.len()
    }

    pub fn handler_count(&self, topic: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .topics
            .get(topic)
            .map_or(0, Vec::len)
    }

    /// Drops every registration. Outstanding [`Subscription`] handles become
    /// no-ops.
    pub fn clear(&self) {
        self.inner.lock().unwrap().topics.clear();
    }
}

impl<T> std::fmt::Debug for EventBus<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.inner.lock().unwrap();
        f.debug_struct("EventBus")
            .field("topics", &registry.topics.len())
            .finish()
    }
}

/// A registration handle. Disposing (or dropping) detaches the handler;
/// both are idempotent.
pub struct Subscription {
    detach: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    fn new(detach: impl FnOnce() + Send + 'static) -> Self {
        Self {
            detach: Mutex::new(Some(Box::new(detach))),
        }
    }

    /// A subscription that was never attached to anything.
    pub fn detached() -> Self {
        Self {
            detach: Mutex::new(None),
        }
    }

    pub fn dispose(&self) {
        if let Some(detach) = self.detach.lock().unwrap().take() {
            detach();
        }
    }

    pub fn is_disposed(&self) -> bool { self.detach.lock().unwrap().is_none() }
}

impl Drop for Subscription {
    fn drop(&mut self) { self.dispose(); }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
