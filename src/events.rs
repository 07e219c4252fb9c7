//! Subscriber sets for diagnostics and generic server notifications.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use tracing::warn;

type Entries<C> = Mutex<HashMap<u64, Arc<C>>>;

fn lock_entries<C: ?Sized>(entries: &Entries<C>) -> MutexGuard<'_, HashMap<u64, Arc<C>>> {
    // A subscriber panicking during fan-out is already tolerated, so a
    // poisoned lock carries no invariant damage worth propagating.
    entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Unordered set of callbacks, each addressable for removal.
pub(crate) struct SubscriberSet<C: ?Sized> {
    entries: Arc<Entries<C>>,
    next_id: AtomicU64,
}

impl<C: ?Sized> SubscriberSet<C> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a callback; the returned token removes it again.
    pub(crate) fn insert(&self, callback: Arc<C>) -> Subscription
    where
        C: Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock_entries(&self.entries).insert(id, callback);
        let entries: Weak<Entries<C>> = Arc::downgrade(&self.entries);
        Subscription::new(move || {
            if let Some(entries) = entries.upgrade() {
                lock_entries(&entries).remove(&id);
            }
        })
    }

    /// Current callbacks, cloned out so fan-out runs without the lock held.
    pub(crate) fn snapshot(&self) -> Vec<Arc<C>> {
        lock_entries(&self.entries).values().cloned().collect()
    }
}

/// Run one subscriber, containing a panic so the remaining subscribers in a
/// fan-out still run.
pub(crate) fn deliver(kind: &str, call: impl FnOnce()) {
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(call)).is_err() {
        warn!("{kind} subscriber panicked; continuing fan-out");
    }
}

/// Handle for one registered callback. Unsubscribing is idempotent, and a
/// dropped (but not unsubscribed) token leaves the subscription in place.
pub struct Subscription {
    cancel: Box<dyn Fn() + Send + Sync>,
}

impl Subscription {
    pub(crate) fn new(cancel: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Box::new(cancel),
        }
    }

    pub fn unsubscribe(&self) {
        (self.cancel)()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}
