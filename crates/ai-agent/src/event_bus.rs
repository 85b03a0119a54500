//! Generic typed publish/subscribe used by the plan coordinator, the
//! orchestrator and the subagent manager.
//!
//! Listeners are plain closures. `emit` snapshots the listener lists before
//! invoking anything, so a listener may subscribe or unsubscribe (itself or a
//! sibling) while an event is being delivered. A panicking listener is caught
//! and logged; the remaining listeners still run and `emit` returns normally.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, warn};

/// Event type that [`EventBus::listener_count`] resolves to wildcard listeners.
pub const WILDCARD: &str = "*";

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;
type WildcardListener<E> = Arc<dyn Fn(&str, &E) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

struct Registry<E> {
    typed: HashMap<String, Vec<(ListenerId, Listener<E>)>>,
    wildcard: Vec<(ListenerId, WildcardListener<E>)>,
    disposed: bool,
}

struct Inner<E> {
    registry: Mutex<Registry<E>>,
    next_id: AtomicU64,
}

impl<E> Inner<E> {
    fn lock(&self) -> MutexGuard<'_, Registry<E>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, event_type: Option<&str>, id: ListenerId) -> bool {
        let mut registry = self.lock();
        match event_type {
            Some(event_type) => {
                let Some(listeners) = registry.typed.get_mut(event_type) else {
                    return false;
                };
                let before = listeners.len();
                listeners.retain(|(listener_id, _)| *listener_id != id);
                let removed = listeners.len() != before;
                if listeners.is_empty() {
                    registry.typed.remove(event_type);
                }
                removed
            }
            None => {
                let before = registry.wildcard.len();
                registry.wildcard.retain(|(listener_id, _)| *listener_id != id);
                registry.wildcard.len() != before
            }
        }
    }
}

/// Handle returned by every registration. Dropping it keeps the listener
/// registered; call [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    id: Option<ListenerId>,
    remove: Mutex<Option<Box<dyn FnOnce() -> bool + Send>>>,
}

impl Subscription {
    fn new(id: ListenerId, remove: impl FnOnce() -> bool + Send + 'static) -> Self {
        Self {
            id: Some(id),
            remove: Mutex::new(Some(Box::new(remove))),
        }
    }

    fn inert() -> Self {
        Self {
            id: None,
            remove: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Option<ListenerId> {
        self.id
    }

    /// Removes the listener. Returns `true` only for the call that actually
    /// removed it; later calls are no-ops.
    pub fn unsubscribe(&self) -> bool {
        let remove = self
            .remove
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        remove.map(|remove| remove()).unwrap_or(false)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Cloning yields another handle onto the same set of listeners.
pub struct EventBus<E> {
    inner: Arc<Inner<E>>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: 'static> EventBus<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry {
                    typed: HashMap::new(),
                    wildcard: Vec::new(),
                    disposed: false,
                }),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    fn next_id(&self) -> ListenerId {
        ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn register(&self, event_type: &str, id: ListenerId, listener: Listener<E>) -> Subscription {
        {
            let mut registry = self.inner.lock();
            if registry.disposed {
                debug!(event_type, "ignoring registration on disposed event bus");
                return Subscription::inert();
            }
            registry
                .typed
                .entry(event_type.to_string())
                .or_default()
                .push((id, listener));
        }
        let weak = Arc::downgrade(&self.inner);
        let key = event_type.to_string();
        Subscription::new(id, move || remove_from(&weak, Some(&key), id))
    }

    /// Registers `listener` for every event of `event_type`.
    pub fn on<F>(&self, event_type: &str, listener: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.register(event_type, id, Arc::new(listener))
    }

    /// Registers `listener` for the next event of `event_type` only. The
    /// wrapper removes itself from the bus before invoking the callback, and
    /// unsubscribing first guarantees the callback never runs.
    pub fn once<F>(&self, event_type: &str, listener: F) -> Subscription
    where
        F: FnOnce(&E) + Send + 'static,
    {
        let id = self.next_id();
        let weak = Arc::downgrade(&self.inner);
        let key = event_type.to_string();
        let slot = Mutex::new(Some(listener));
        let wrapper: Listener<E> = Arc::new(move |data: &E| {
            remove_from(&weak, Some(&key), id);
            let callback = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(callback) = callback {
                callback(data);
            }
        });
        self.register(event_type, id, wrapper)
    }

    /// Registers `listener` for every event regardless of type. This is the
    /// `"*"` subscription.
    pub fn on_any<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&str, &E) + Send + Sync + 'static,
    {
        let id = self.next_id();
        {
            let mut registry = self.inner.lock();
            if registry.disposed {
                debug!("ignoring wildcard registration on disposed event bus");
                return Subscription::inert();
            }
            registry.wildcard.push((id, Arc::new(listener)));
        }
        let weak = Arc::downgrade(&self.inner);
        Subscription::new(id, move || remove_from(&weak, None, id))
    }

    /// Delivers `data` to the listeners of `event_type`, then to the wildcard
    /// listeners. Returns how many listeners were invoked.
    pub fn emit(&self, event_type: &str, data: &E) -> usize {
        let (typed, wildcard): (Vec<Listener<E>>, Vec<WildcardListener<E>>) = {
            let registry = self.inner.lock();
            if registry.disposed {
                return 0;
            }
            let typed = registry
                .typed
                .get(event_type)
                .map(|listeners| listeners.iter().map(|(_, l)| l.clone()).collect())
                .unwrap_or_default();
            let wildcard = registry.wildcard.iter().map(|(_, l)| l.clone()).collect();
            (typed, wildcard)
        };

        let delivered = typed.len() + wildcard.len();
        for listener in typed {
            invoke_isolated(event_type, || listener(data));
        }
        for listener in wildcard {
            invoke_isolated(event_type, || listener(event_type, data));
        }
        delivered
    }

    /// Number of listeners for `event_type` (`"*"` counts wildcard
    /// listeners), or of all listeners when `None`.
    pub fn listener_count(&self, event_type: Option<&str>) -> usize {
        let registry = self.inner.lock();
        match event_type {
            Some(WILDCARD) => registry.wildcard.len(),
            Some(event_type) => registry.typed.get(event_type).map_or(0, Vec::len),
            None => registry.typed.values().map(Vec::len).sum::<usize>() + registry.wildcard.len(),
        }
    }

    /// Drops every listener. Later registrations are ignored and `emit`
    /// becomes a no-op.
    pub fn dispose(&self) {
        let mut registry = self.inner.lock();
        registry.typed.clear();
        registry.wildcard.clear();
        registry.disposed = true;
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.lock().disposed
    }
}

fn remove_from<E>(weak: &Weak<Inner<E>>, event_type: Option<&str>, id: ListenerId) -> bool {
    weak.upgrade()
        .map(|inner| inner.remove(event_type, id))
        .unwrap_or(false)
}

fn invoke_isolated(event_type: &str, call: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(call)) {
        warn!(
            event_type,
            error = panic_message(panic.as_ref()),
            "event listener panicked"
        );
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
