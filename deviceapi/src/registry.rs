use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;

use log::trace;

use crate::ListenerId;

/// Maps listener ids to registered callbacks.
///
/// Ids come from a per-registry counter that starts at 1 and only ever
/// increases. Broadcasts iterate a snapshot taken under the lock and invoke
/// actions without holding it, so an action can subscribe or unsubscribe
/// without affecting the current broadcast.
pub struct CallbackRegistry<C> {
    next_id: AtomicU64,
    entries: StdMutex<BTreeMap<ListenerId, C>>,
}

impl<C: Clone> Default for CallbackRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clone> CallbackRegistry<C> {
    pub fn new() -> Self {
        CallbackRegistry {
            next_id: AtomicU64::new(1),
            entries: StdMutex::new(BTreeMap::new()),
        }
    }

    pub fn subscribe(&self, callback: C) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().unwrap().insert(id, callback);
        trace!("Listener {} subscribed", id);
        id
    }

    /// Removes `id`, returning whether it was registered
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let removed = self.entries.lock().unwrap().remove(&id);
        trace!("Listener {} unsubscribed (present = {})", id, removed.is_some());
        removed.is_some()
    }

    pub fn contains(&self, id: ListenerId) -> bool {
        self.entries.lock().unwrap().contains_key(&id)
    }

    pub fn snapshot(&self) -> Vec<(ListenerId, C)> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|(id, callback)| (*id, callback.clone()))
            .collect()
    }

    /// Invokes `action` on every entry matching `predicate`, in id order,
    /// returning how many entries matched.
    pub fn broadcast<P, A>(&self, predicate: P, mut action: A) -> usize
    where
        P: Fn(&C) -> bool,
        A: FnMut(ListenerId, &C),
    {
        let snapshot = self.snapshot();
        let mut matched = 0;
        for (id, callback) in snapshot.iter() {
            if predicate(callback) {
                action(*id, callback);
                matched += 1;
            }
        }
        matched
    }

    pub fn broadcast_all<A>(&self, action: A) -> usize
    where
        A: FnMut(ListenerId, &C),
    {
        self.broadcast(|_| true, action)
    }

    /// Removes every entry for which `predicate` holds, returning how many
    /// were removed.
    pub fn remove_where<P>(&self, predicate: P) -> usize
    where
        P: Fn(&C) -> bool,
    {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, callback| !predicate(callback));
        before - entries.len()
    }

    pub fn count_where<P>(&self, predicate: P) -> usize
    where
        P: Fn(&C) -> bool,
    {
        self.entries.lock().unwrap().values().filter(|c| predicate(c)).count()
    }

    pub fn clear(&self) {
        let drained = std::mem::take(&mut *self.entries.lock().unwrap());
        trace!("Cleared {} listeners", drained.len());
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn ids_strictly_increase_and_are_never_reused() {
        let registry = CallbackRegistry::<u32>::new();
        let mut seen = Vec::new();

        // An arbitrary interleaving of subscribe/unsubscribe calls
        for round in 0..20u32 {
            let id = registry.subscribe(round);
            seen.push(id);
            if round % 3 == 0 {
                registry.unsubscribe(id);
            }
            if round % 5 == 0 {
                registry.clear();
            }
        }
        assert_eq!(seen[0], ListenerId(1));
        assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn unsubscribe_unknown_is_noop() {
        let registry = CallbackRegistry::<u32>::new();
        let id = registry.subscribe(1);
        assert!(!registry.unsubscribe(ListenerId(42)));
        assert!(registry.unsubscribe(id));
        assert!(!registry.unsubscribe(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn broadcast_is_snapshot_isolated() {
        let registry = Arc::new(CallbackRegistry::<u32>::new());
        let a = registry.subscribe(10);
        let b = registry.subscribe(20);
        let c = registry.subscribe(30);

        let mut delivered = Vec::new();
        registry.broadcast_all(|id, value| {
            delivered.push(*value);
            if id == a {
                // Nested unsubscribe of other listeners plus a new subscription
                registry.unsubscribe(b);
                registry.unsubscribe(c);
                registry.subscribe(40);
            }
        });
        assert_eq!(delivered, vec![10, 20, 30]);

        let remaining: Vec<u32> = registry.snapshot().into_iter().map(|(_, v)| v).collect();
        assert_eq!(remaining, vec![10, 40]);
    }

    #[test]
    fn broadcast_filters_with_predicate() {
        let registry = CallbackRegistry::<&'static str>::new();
        registry.subscribe("AA:BB");
        registry.subscribe("CC:DD");
        registry.subscribe("AA:BB");

        let mut hits = 0;
        let matched = registry.broadcast(|addr| *addr == "AA:BB", |_, _| hits += 1);
        assert_eq!(matched, 2);
        assert_eq!(hits, 2);
        assert_eq!(registry.count_where(|addr| *addr == "CC:DD"), 1);
        assert_eq!(registry.remove_where(|addr| *addr == "AA:BB"), 2);
        assert_eq!(registry.len(), 1);
    }
}
