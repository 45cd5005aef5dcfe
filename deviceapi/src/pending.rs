use std::fmt::Debug;
use std::hash::Hash;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{trace, warn};

use crate::{Error, Result};

/// In-flight operations awaiting exactly one native completion, at most one
/// per key.
///
/// Entries must be inserted with [`begin`](Self::begin) before the native
/// operation is started, so that a completion delivered from inside the
/// native call already finds its entry. If the native call then fails
/// synchronously the entry is taken back out with [`abort`](Self::abort).
pub struct PendingOperationTable<K: Eq + Hash, C> {
    name: &'static str,
    pending: DashMap<K, C>,
}

impl<K, C> PendingOperationTable<K, C>
where
    K: Eq + Hash + Clone + Debug,
{
    pub fn new(name: &'static str) -> Self {
        PendingOperationTable {
            name,
            pending: DashMap::new(),
        }
    }

    pub fn begin(&self, key: K, callback: C) -> Result<()> {
        match self.pending.entry(key) {
            Entry::Occupied(entry) => {
                trace!("{}: operation already pending for {:?}", self.name, entry.key());
                Err(Error::InvalidState("Operation now in progress".to_string()))
            }
            Entry::Vacant(entry) => {
                trace!("{}: operation started for {:?}", self.name, entry.key());
                entry.insert(callback);
                Ok(())
            }
        }
    }

    /// Takes the entry for `key` in response to a native completion.
    ///
    /// Stray completions for unknown keys are logged and ignored.
    pub fn complete(&self, key: &K) -> Option<C> {
        match self.pending.remove(key) {
            Some((_, callback)) => {
                trace!("{}: operation for {:?} completed", self.name, key);
                Some(callback)
            }
            None => {
                warn!("{}: no operation pending for {:?}", self.name, key);
                None
            }
        }
    }

    /// Takes back an entry whose native operation failed to start
    pub fn abort(&self, key: &K) -> Option<C> {
        trace!("{}: operation for {:?} aborted", self.name, key);
        self.pending.remove(key).map(|(_, callback)| callback)
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    /// Removes every entry for which `predicate` holds
    pub fn remove_where<P>(&self, predicate: P) -> Vec<(K, C)>
    where
        P: Fn(&K, &C) -> bool,
    {
        let keys: Vec<K> = self
            .pending
            .iter()
            .filter(|entry| predicate(entry.key(), entry.value()))
            .map(|entry| entry.key().clone())
            .collect();
        keys.into_iter().filter_map(|key| self.pending.remove(&key)).collect()
    }

    pub fn drain(&self) -> Vec<(K, C)> {
        self.remove_where(|_, _| true)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
