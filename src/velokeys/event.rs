//! Listener lists with two dispatch flavors.
//!
//! - [`Broadcast`]: every listener gets every message.
//! - [`Bubbling`]: listeners are tried newest first, and the first one
//!   that returns `true` claims the message, the rest never see it.
//!
//! Listeners are called with no lock held, so a listener may add or
//! remove listeners (including itself).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::velokeys::{read_poison, write_poison};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Returned by `add_listener()`, pass it to `remove_listener()`.
pub struct ListenerId(u64);

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

fn next_listener_id() -> ListenerId {
    ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
}

type BroadcastFn<M> = Arc<dyn Fn(&M) + Send + Sync>;
type BubblingFn<M> = Arc<dyn Fn(&M) -> bool + Send + Sync>;

/// Deliver each message to all listeners.
pub struct Broadcast<M> {
    /// Newest listener first.
    listeners: RwLock<Vec<(ListenerId, BroadcastFn<M>)>>,
}

/// Deliver each message to listeners, newest first, until one claims
/// it.
pub struct Bubbling<M> {
    /// Newest listener first, this is the bubbling order.
    listeners: RwLock<Vec<(ListenerId, BubblingFn<M>)>>,
}

impl<M> Default for Broadcast<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Broadcast<M> {
    pub fn new() -> Broadcast<M> {
        Broadcast {
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&M) + Send + Sync + 'static,
    {
        let id = next_listener_id();
        self.listeners
            .write()
            .unwrap_or_else(write_poison)
            .insert(0, (id, Arc::new(listener)));
        id
    }

    /// Returns whether the listener was found.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(write_poison);
        let before = listeners.len();
        listeners.retain(|(one_id, _)| *one_id != id);
        before != listeners.len()
    }

    pub fn len(&self) -> usize {
        self.listeners.read().unwrap_or_else(read_poison).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn emit(&self, message: &M) {
        let snapshot: Vec<BroadcastFn<M>> = self
            .listeners
            .read()
            .unwrap_or_else(read_poison)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect(); // listeners lock freed.

        for listener in snapshot {
            listener(message);
        }
    }
}

impl<M> Default for Bubbling<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Bubbling<M> {
    pub fn new() -> Bubbling<M> {
        Bubbling {
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// The new listener goes on top of the stack: it gets the first
    /// chance at every message.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&M) -> bool + Send + Sync + 'static,
    {
        let id = next_listener_id();
        self.listeners
            .write()
            .unwrap_or_else(write_poison)
            .insert(0, (id, Arc::new(listener)));
        id
    }

    /// Returns whether the listener was found.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(write_poison);
        let before = listeners.len();
        listeners.retain(|(one_id, _)| *one_id != id);
        before != listeners.len()
    }

    pub fn len(&self) -> usize {
        self.listeners.read().unwrap_or_else(read_poison).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns whether some listener claimed the message.
    pub fn emit(&self, message: &M) -> bool {
        let snapshot: Vec<BubblingFn<M>> = self
            .listeners
            .read()
            .unwrap_or_else(read_poison)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect(); // listeners lock freed.

        snapshot.iter().any(|listener| listener(message))
    }
}

impl<M> fmt::Debug for Broadcast<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broadcast")
            .field("listeners", &self.len())
            .finish()
    }
}

impl<M> fmt::Debug for Bubbling<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bubbling")
            .field("listeners", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn broadcast_reaches_everyone() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let broadcast = Broadcast::<u8>::new();
        for name in ["a", "b", "c"] {
            let seen = seen.clone();
            broadcast.add_listener(move |m| seen.lock().unwrap().push((name, *m)));
        }
        broadcast.emit(&7);
        assert_eq!(*seen.lock().unwrap(), vec![("c", 7), ("b", 7), ("a", 7)]);
    }

    #[test]
    fn bubbling_stops_at_first_claim() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let bubbling = Bubbling::<u8>::new();

        let seen_a = seen.clone();
        bubbling.add_listener(move |_| {
            seen_a.lock().unwrap().push("a");
            true
        });
        let seen_b = seen.clone();
        let b = bubbling.add_listener(move |m| {
            seen_b.lock().unwrap().push("b");
            *m == 1
        });

        assert!(bubbling.emit(&1));
        assert_eq!(*seen.lock().unwrap(), vec!["b"]);

        seen.lock().unwrap().clear();
        assert!(bubbling.emit(&2));
        assert_eq!(*seen.lock().unwrap(), vec!["b", "a"]);

        assert!(bubbling.remove_listener(b));
        assert!(!bubbling.remove_listener(b));
        assert_eq!(bubbling.len(), 1);
    }

    #[test]
    fn unclaimed_when_empty() {
        let bubbling = Bubbling::<u8>::new();
        assert!(bubbling.is_empty());
        assert!(!bubbling.emit(&0));
    }

    #[test]
    fn listener_may_remove_itself() {
        let broadcast = Arc::new(Broadcast::<u8>::new());
        let id_slot = Arc::new(Mutex::new(None));
        let inner = broadcast.clone();
        let slot = id_slot.clone();
        let id = broadcast.add_listener(move |_| {
            if let Some(id) = *slot.lock().unwrap() {
                inner.remove_listener(id);
            }
        });
        *id_slot.lock().unwrap() = Some(id);
        broadcast.emit(&0);
        assert!(broadcast.is_empty());
    }
}
