//! Fixed-capacity duplicate suppression.
//!
//! Realtime channels can deliver the same event more than once, for example
//! when the service fans out to several replicas. Each subscription keeps a
//! small window of recently seen event fingerprints and drops repeats.

use std::collections::{HashSet, VecDeque};

/// Number of fingerprints remembered per subscription.
pub const DEFAULT_DEDUP_CAPACITY: usize = 50;

/// Recency window over event fingerprints.
///
/// Eviction is strictly insertion-ordered: re-seeing a fingerprint does not
/// refresh its position, so a fingerprint is forgotten exactly `capacity`
/// distinct insertions after it was first added.
#[derive(Debug)]
pub struct DedupWindow {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl DedupWindow {
    /// Creates a window remembering up to `capacity` fingerprints.
    ///
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Records a fingerprint.
    ///
    /// Returns `true` when the fingerprint was not in the window (the caller
    /// should deliver the event) and `false` for a duplicate. When the window
    /// is full the oldest fingerprint is evicted first.
    pub fn insert(&mut self, fingerprint: impl Into<String>) -> bool {
        let fingerprint = fingerprint.into();
        if self.seen.contains(&fingerprint) {
            return false;
        }

        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(fingerprint.clone());
        self.seen.insert(fingerprint);
        true
    }

    /// Whether the fingerprint is currently in the window.
    pub fn contains(&self, fingerprint: &str) -> bool {
        self.seen.contains(fingerprint)
    }

    /// Number of fingerprints currently remembered.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True when nothing has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Maximum number of fingerprints the window holds.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Forgets every recorded fingerprint.
    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }
}

impl Default for DedupWindow {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}
