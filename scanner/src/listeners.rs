/*!
Event listener registry.

Observers register callbacks and receive a [`Subscription`] handle. Dropping
the handle (or calling [`Subscription::unsubscribe`]) removes exactly that
registration. Registering a second callback without disposing the first
leaves both active: the registry never deduplicates, so a host that
re-subscribes must replace (and thereby drop) its previous handle.

Dispatch never holds the registry lock while a callback runs, so callbacks
may unsubscribe themselves or others. A callback removed before its turn in
the current dispatch is skipped; callbacks added during a dispatch first see
the next event. A panicking callback is logged and the dispatch continues
with the next one.
*/

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::error;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Slots<T> {
    next_id: u64,
    entries: Vec<(u64, Callback<T>)>,
}

impl<T> Slots<T> {
    fn contains(&self, id: u64) -> bool {
        self.entries.iter().any(|(entry_id, _)| *entry_id == id)
    }
}

/// Type-erased removal so [`Subscription`] need not be generic
trait Detach: Send + Sync {
    fn detach(&self, id: u64) -> bool;
}

impl<T: 'static> Detach for Mutex<Slots<T>> {
    fn detach(&self, id: u64) -> bool {
        let mut slots = self.lock().unwrap_or_else(PoisonError::into_inner);
        let before = slots.entries.len();
        slots.entries.retain(|(entry_id, _)| *entry_id != id);
        slots.entries.len() != before
    }
}

/// Callbacks for one event kind
pub struct EventRegistry<T> {
    slots: Arc<Mutex<Slots<T>>>,
}

impl<T: 'static> EventRegistry<T> {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slots {
                next_id: 1,
                entries: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots<T>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a callback; it stays active until the handle is disposed
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let mut slots = self.lock();
        let id = slots.next_id;
        slots.next_id += 1;
        slots.entries.push((id, Arc::new(callback)));
        drop(slots);

        let weak: Weak<Mutex<Slots<T>>> = Arc::downgrade(&self.slots);
        let registry: Weak<dyn Detach> = weak;
        Subscription {
            id,
            registry,
            active: AtomicBool::new(true),
        }
    }

    /// Deliver an event to every registered callback, in registration order.
    /// Returns the number of callbacks that returned normally.
    pub fn emit(&self, event: &T) -> usize {
        let snapshot: Vec<(u64, Callback<T>)> = self
            .lock()
            .entries
            .iter()
            .map(|(id, callback)| (*id, Arc::clone(callback)))
            .collect();

        let mut delivered = 0;
        for (id, callback) in snapshot {
            // Skip listeners removed by an earlier callback in this dispatch
            if !self.lock().contains(id) {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(()) => delivered += 1,
                Err(panic) => error!("Listener {} panicked: {}", id, panic_message(&*panic)),
            }
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every listener; outstanding handles become inert
    pub fn clear(&self) {
        self.lock().entries.clear();
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

impl<T: 'static> Default for EventRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Disposer returned by [`EventRegistry::subscribe`].
///
/// Unsubscribing is idempotent, and a handle never keeps its registry alive.
#[must_use = "dropping a Subscription immediately unregisters the listener"]
pub struct Subscription {
    id: u64,
    registry: Weak<dyn Detach>,
    active: AtomicBool,
}

impl Subscription {
    /// Remove this registration. Returns `true` only on the call that removed it.
    pub fn unsubscribe(&self) -> bool {
        if !self.active.swap(false, Ordering::SeqCst) {
            return false;
        }
        match self.registry.upgrade() {
            Some(registry) => registry.detach(self.id),
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Keep the listener registered for the registry's lifetime
    pub fn detach(self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
