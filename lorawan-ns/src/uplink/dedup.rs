//! Uplink deduplication
//!
//! The first arrival of a fingerprint becomes the leader: it waits for the
//! deduplication window, then gets the metadata accumulated from every copy.
//! A cooldown window follows during which late copies are reported as
//! duplicates. The key is evicted once both windows have passed.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::trace;

use super::accumulator::Accumulator;
use crate::error::Result;

#[derive(Debug)]
struct Entry<V> {
    values: Accumulator<V>,
    cooling: bool,
}

type Entries<K, V> = Arc<Mutex<HashMap<K, Entry<V>>>>;

/// Removes the entry of a leader that is dropped before its window ends
struct LeaderGuard<K: Eq + Hash, V> {
    entries: Entries<K, V>,
    key: Option<K>,
}

impl<K: Eq + Hash, V> Drop for LeaderGuard<K, V> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.entries
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&key);
        }
    }
}

/// Keyed deduplication window store
#[derive(Debug)]
pub struct Deduplicator<K, V> {
    entries: Entries<K, V>,
    cooldown: Duration,
}

impl<K, V> Deduplicator<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Eq + Hash + Clone + Send + 'static,
{
    /// Deduplicator with cooldown window `cooldown`
    pub fn new(cooldown: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            cooldown,
        }
    }

    /// Deduplicate an arrival of `key` carrying `values`
    ///
    /// Returns `(Some(accumulated), false)` to the leader once `window` has
    /// elapsed, `(None, false)` to copies arriving within `window` and
    /// `(None, true)` to copies arriving during the cooldown.
    pub async fn deduplicate(
        &self,
        key: K,
        values: impl IntoIterator<Item = V>,
        window: Duration,
    ) -> Result<(Option<Vec<V>>, bool)> {
        {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = entries.get(&key) {
                if entry.cooling {
                    return Ok((None, true));
                }
                for v in values {
                    entry.values.add(v);
                }
                return Ok((None, false));
            }
            let entry = Entry {
                values: Accumulator::new(),
                cooling: false,
            };
            for v in values {
                entry.values.add(v);
            }
            entries.insert(key.clone(), entry);
        }

        let mut guard = LeaderGuard {
            entries: self.entries.clone(),
            key: Some(key.clone()),
        };
        tokio::time::sleep(window).await;

        let accumulated = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            match entries.get_mut(&key) {
                Some(entry) => {
                    entry.cooling = true;
                    entry.values.snapshot()
                }
                None => Vec::new(),
            }
        };
        guard.key = None;

        let entries = self.entries.clone();
        let cooldown = self.cooldown;
        tokio::spawn(async move {
            tokio::time::sleep(cooldown).await;
            entries
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&key);
        });
        trace!(count = accumulated.len(), "Deduplication window closed");
        Ok((Some(accumulated), false))
    }

    /// Number of keys in a deduplication or cooldown window
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether no key is tracked
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
