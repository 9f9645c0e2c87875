//! Space-Saving approximate top-K tracker (Metwally-Agrawal-Abbadi).
//!
//! Fixed memory over an unbounded key space: at capacity, the minimum-count
//! entry is evicted and its count becomes the newcomer's over-estimate
//! bound. For any tracked key, `count` >= true frequency and
//! `count - error` <= true frequency.

use std::sync::Mutex;

use rustc_hash::FxHashMap;

/// A tracked key with its estimated count and over-estimate bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopEntry {
    pub key: String,
    pub count: u64,
    pub error: u64,
}

struct Inner {
    entries: FxHashMap<String, TopEntry>,
    // Cached key with minimum count; None when unknown.
    min_key: Option<String>,
}

/// Mutex-serialised Space-Saving tracker with room for `k` keys.
pub struct SpaceSaving {
    k: usize,
    inner: Mutex<Inner>,
}

impl SpaceSaving {
    /// Create a tracker with space for `k` keys.
    pub fn new(k: usize) -> Self {
        Self {
            k,
            inner: Mutex::new(Inner {
                entries: FxHashMap::default(),
                min_key: None,
            }),
        }
    }

    /// Record one occurrence of `key`.
    pub fn add(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        // Already tracked: bump the count. If this was the cached minimum
        // the minimum may have moved, so recompute.
        if let Some(entry) = inner.entries.get_mut(key) {
            entry.count += 1;
            if inner.min_key.as_deref() == Some(key) {
                inner.min_key = recompute_min(&inner.entries);
            }
            return;
        }

        // Room left: insert fresh.
        if inner.entries.len() < self.k {
            inner.entries.insert(
                key.to_owned(),
                TopEntry { key: key.to_owned(), count: 1, error: 0 },
            );
            let min_count = inner
                .min_key
                .as_ref()
                .and_then(|k| inner.entries.get(k))
                .map(|e| e.count);
            if min_count.map_or(true, |count| count > 1) {
                inner.min_key = Some(key.to_owned());
            }
            return;
        }

        // Full: evict the minimum and inherit its count as the error bound.
        let cached = inner.min_key.take();
        let min_key = cached
            .filter(|k| inner.entries.contains_key(k))
            .or_else(|| recompute_min(&inner.entries));
        let Some(min_key) = min_key else {
            return; // k == 0, nothing is ever tracked
        };
        let Some(min) = inner.entries.remove(&min_key) else {
            return;
        };
        inner.entries.insert(
            key.to_owned(),
            TopEntry {
                key: key.to_owned(),
                count: min.count + 1,
                error: min.count,
            },
        );
        inner.min_key = recompute_min(&inner.entries);
    }

    /// The current top-`n` entries, sorted by count descending. Ties break
    /// arbitrarily.
    pub fn top_n(&self, n: usize) -> Vec<TopEntry> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<TopEntry> = inner.entries.values().cloned().collect();
        all.sort_by(|a, b| b.count.cmp(&a.count));
        all.truncate(n);
        all
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.len()
    }

    /// True when nothing has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn recompute_min(entries: &FxHashMap<String, TopEntry>) -> Option<String> {
    entries.values().min_by_key(|e| e.count).map(|e| e.key.clone())
}
