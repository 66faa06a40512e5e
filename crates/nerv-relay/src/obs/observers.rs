//! Observer list: register/unregister, synchronous notify-all with per-handler
//! fault isolation.
//!
//! Handlers are snapshotted before notification, so a handler may subscribe or
//! unsubscribe (itself included) without deadlocking. A panicking handler is
//! caught and counted; the remaining handlers and the caller are unaffected.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Inner<T> {
    next_id: AtomicU64,
    handlers: RwLock<Vec<(u64, Handler<T>)>>,
}

pub struct ObserverList<T> {
    inner: Arc<Inner<T>>,
}

/// Clones share the same handler list.
impl<T> Clone for ObserverList<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for ObserverList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ObserverList<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(1),
                handlers: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
        T: 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        match self.inner.handlers.write() {
            Ok(mut g) => g.push((id, Arc::new(handler))),
            Err(poisoned) => poisoned.into_inner().push((id, Arc::new(handler))),
        }
        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        Subscription {
            remove: Some(Box::new(move || {
                weak.upgrade().map(|inner| remove(&inner, id)).unwrap_or(false)
            })),
        }
    }

    /// Notify every current handler. Returns how many handlers panicked.
    pub fn notify(&self, value: &T) -> usize {
        let snapshot: Vec<Handler<T>> = match self.inner.handlers.read() {
            Ok(g) => g.iter().map(|(_, h)| Arc::clone(h)).collect(),
            Err(poisoned) => poisoned.into_inner().iter().map(|(_, h)| Arc::clone(h)).collect(),
        };

        let mut failures = 0;
        for h in snapshot {
            if catch_unwind(AssertUnwindSafe(|| h(value))).is_err() {
                failures += 1;
            }
        }
        failures
    }

    pub fn len(&self) -> usize {
        match self.inner.handlers.read() {
            Ok(g) => g.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        match self.inner.handlers.write() {
            Ok(mut g) => g.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }
}

fn remove<T>(inner: &Inner<T>, id: u64) -> bool {
    let mut g = match inner.handlers.write() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    let before = g.len();
    g.retain(|(hid, _)| *hid != id);
    g.len() != before
}

/// Handle returned by `subscribe`. Dropping it keeps the handler registered;
/// call [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() -> bool + Send + Sync>>,
}

impl Subscription {
    /// Remove the handler. Returns false if it was already gone.
    pub fn unsubscribe(mut self) -> bool {
        self.remove.take().map(|f| f()).unwrap_or(false)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}
