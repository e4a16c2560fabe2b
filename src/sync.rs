//! Synchronization primitives for protocol bookkeeping
//!
//! `Deferred` is a single-assignment result cell used as a barrier
//! (discovery complete, process started, navigation resolved). `Listeners`
//! is the id-keyed subscriber registry behind every event surface.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

/// A result cell that can be set at most once and read any number of times.
///
/// The first `set` wins; later writers are silently ignored, so a losing
/// branch of a race (a late endpoint announcement, a lifecycle event after
/// a timeout) resolves into a no-op. Waiters registered before or after the
/// write all observe the same value.
pub struct Deferred<T> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone> Deferred<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Assign the value. Returns `true` if this call won the assignment.
    pub fn set(&self, value: T) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(value);
                true
            } else {
                false
            }
        })
    }

    /// Read the current value, if assigned.
    pub fn get(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    /// Whether the cell has been assigned.
    pub fn is_set(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Suspend until the cell is assigned, then return the value.
    pub async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(value) = rx.borrow_and_update().clone() {
                return value;
            }
            // The sender lives as long as `self`, so `changed` cannot fail
            // while we hold `&self`.
            let _ = rx.changed().await;
        }
    }
}

impl<T: Clone> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred")
            .field("set", &self.tx.borrow().is_some())
            .finish()
    }
}

/// Identifier returned by [`Listeners::add`], used for removal.
pub type ListenerId = u64;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Id-keyed subscriber registry.
///
/// Removal is deterministic: once `remove(id)` returns, that handler is
/// never invoked again. `emit` snapshots the handler list and invokes
/// outside the registry lock, so handlers may add or remove subscribers.
pub struct Listeners<T> {
    next_id: AtomicU64,
    handlers: Mutex<Vec<(ListenerId, Handler<T>)>>,
}

impl<T> Listeners<T> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// Register a handler and return its removal id.
    pub fn add(&self, handler: impl Fn(&T) + Send + Sync + 'static) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.lock().push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler by id. No-op for unknown ids.
    pub fn remove(&self, id: ListenerId) {
        self.handlers.lock().retain(|(hid, _)| *hid != id);
    }

    /// Invoke every currently-registered handler with `event`.
    pub fn emit(&self, event: &T) {
        let handlers: Vec<Handler<T>> = self
            .handlers
            .lock()
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in handlers {
            handler(event);
        }
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.lock().is_empty()
    }
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn deferred_first_write_wins() {
        let cell = Deferred::new();
        assert!(cell.set(1));
        assert!(!cell.set(2));
        assert_eq!(cell.get(), Some(1));
    }

    #[tokio::test]
    async fn deferred_wakes_waiters_registered_before_set() {
        let cell = Arc::new(Deferred::new());
        let waiter = {
            let cell = Arc::clone(&cell);
            tokio::spawn(async move { cell.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cell.set("done");
        assert_eq!(waiter.await.unwrap(), "done");
    }

    #[tokio::test]
    async fn deferred_resolves_waiters_registered_after_set() {
        let cell = Deferred::new();
        cell.set(7u32);
        assert_eq!(cell.wait().await, 7);
    }

    #[test]
    fn listeners_removal_is_deterministic() {
        let listeners: Listeners<u32> = Listeners::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        let id = listeners.add(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        listeners.emit(&1);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        listeners.remove(id);
        listeners.emit(&2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listeners_handler_may_remove_itself() {
        let listeners: Arc<Listeners<u32>> = Arc::new(Listeners::new());
        let count = Arc::new(AtomicUsize::new(0));

        let inner = Arc::clone(&listeners);
        let c = Arc::clone(&count);
        let id = Arc::new(Mutex::new(0));
        let id_slot = Arc::clone(&id);
        *id.lock() = listeners.add(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            inner.remove(*id_slot.lock());
        });

        listeners.emit(&1);
        listeners.emit(&2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
