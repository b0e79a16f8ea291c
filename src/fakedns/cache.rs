//! Session caches with per-entry eviction timers
//!
//! Each entry stores the handle of the one-shot task that will evict it and a
//! generation number. Replacing or removing an entry aborts its timer. A timer
//! that still fires after its entry was replaced carries a stale generation
//! and removes nothing.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::task::AbortHandle;

use super::session::DnsSession;

#[derive(Debug)]
struct CacheEntry {
    session: Arc<DnsSession>,
    generation: u64,
    timer: AbortHandle,
}

/// Concurrent map of sessions keyed by fake address or transaction ID
#[derive(Debug)]
pub struct SessionCache<K: Eq + Hash> {
    entries: DashMap<K, CacheEntry>,
}

impl<K: Eq + Hash + Copy> SessionCache<K> {
    /// Create an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Insert a session, replacing any entry under the same key
    ///
    /// The replaced entry's timer is aborted and its session returned.
    pub fn insert(
        &self,
        key: K,
        session: Arc<DnsSession>,
        generation: u64,
        timer: AbortHandle,
    ) -> Option<Arc<DnsSession>> {
        let previous = self.entries.insert(
            key,
            CacheEntry {
                session,
                generation,
                timer,
            },
        );
        previous.map(|entry| {
            entry.timer.abort();
            entry.session
        })
    }

    /// Look up a session
    #[must_use]
    pub fn get(&self, key: &K) -> Option<Arc<DnsSession>> {
        self.entries.get(key).map(|entry| Arc::clone(&entry.session))
    }

    /// Remove an entry early and cancel its timer
    pub fn remove(&self, key: &K) -> Option<Arc<DnsSession>> {
        self.entries.remove(key).map(|(_, entry)| {
            entry.timer.abort();
            entry.session
        })
    }

    /// Remove an entry on behalf of its timer
    ///
    /// Does nothing if the entry is gone or was replaced by a newer generation.
    pub fn expire(&self, key: &K, generation: u64) -> Option<Arc<DnsSession>> {
        self.entries
            .remove_if(key, |_, entry| entry.generation == generation)
            .map(|(_, entry)| entry.session)
    }

    /// Check if a key is present
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Eq + Hash + Copy> Default for SessionCache<K> {
    fn default() -> Self {
        Self::new()
    }
}
