//! Keyed listener registry.
//!
//! Components publish events by kind; any number of callbacks may subscribe
//! to each kind. Callbacks run synchronously on the emitting task, in the
//! order they were registered. The registry lock is released before any
//! callback runs, so a callback may subscribe or unsubscribe listeners
//! (including itself) without deadlocking.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Handle returned by [`ListenerRegistry::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

type Callback<P> = Arc<dyn Fn(&P) + Send + Sync>;

/// Insertion-ordered callbacks keyed by event kind.
pub struct ListenerRegistry<K, P> {
    listeners: Mutex<HashMap<K, Vec<(ListenerId, Callback<P>)>>>,
    next_id: AtomicU64,
}

impl<K, P> Default for ListenerRegistry<K, P>
where
    K: Eq + Hash + Clone + fmt::Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, P> fmt::Debug for ListenerRegistry<K, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.lock();
        f.debug_struct("ListenerRegistry")
            .field("kinds", &listeners.len())
            .field("listeners", &listeners.values().map(Vec::len).sum::<usize>())
            .finish()
    }
}

impl<K, P> ListenerRegistry<K, P>
where
    K: Eq + Hash + Clone + fmt::Debug,
{
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribes `callback` to events of `kind`.
    ///
    /// Registering the same closure twice yields two independent listeners.
    pub fn on<F>(&self, kind: K, callback: F) -> ListenerId
    where
        F: Fn(&P) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    /// Removes the listener `id` from `kind`. Returns whether it was present.
    pub fn off(&self, kind: &K, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let Some(list) = listeners.get_mut(kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;
        if list.is_empty() {
            listeners.remove(kind);
        }
        removed
    }

    /// Invokes every listener of `kind` with `payload` and returns how many ran.
    ///
    /// A panicking listener is logged and skipped; the remaining listeners
    /// still run. Listeners added during the emit are not invoked for it.
    pub fn emit(&self, kind: &K, payload: &P) -> usize {
        let snapshot: Vec<(ListenerId, Callback<P>)> = self
            .listeners
            .lock()
            .get(kind)
            .map(Clone::clone)
            .unwrap_or_default();

        for (id, callback) in &snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(payload))).is_err() {
                tracing::error!(?kind, listener = %id, "event listener panicked");
            }
        }
        snapshot.len()
    }

    /// Number of listeners currently registered for `kind`.
    #[must_use]
    pub fn listener_count(&self, kind: &K) -> usize {
        self.listeners.lock().get(kind).map_or(0, Vec::len)
    }
}
