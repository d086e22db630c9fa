//! Set-like collector of reception metadata

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::Mutex;

#[derive(Debug)]
struct Inner<V> {
    order: Vec<V>,
    seen: HashSet<V>,
}

/// Concurrency-safe set preserving insertion order
///
/// Values that compare equal collapse into the first one added.
#[derive(Debug)]
pub struct Accumulator<V> {
    inner: Mutex<Inner<V>>,
}

impl<V> Default for Accumulator<V> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                order: Vec::new(),
                seen: HashSet::new(),
            }),
        }
    }
}

impl<V: Eq + Hash + Clone> Accumulator<V> {
    /// Empty accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value; returns `false` if an equal value is already present
    pub fn add(&self, value: V) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !inner.seen.insert(value.clone()) {
            return false;
        }
        inner.order.push(value);
        true
    }

    /// Visit every value until `f` returns `false`
    pub fn range(&self, mut f: impl FnMut(&V) -> bool) {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for v in &inner.order {
            if !f(v) {
                break;
            }
        }
    }

    /// Copy of the values in insertion order
    pub fn snapshot(&self) -> Vec<V> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .order
            .clone()
    }

    /// Remove every value
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.order.clear();
        inner.seen.clear();
    }

    /// Number of distinct values
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).order.len()
    }

    /// Whether no value was added
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
