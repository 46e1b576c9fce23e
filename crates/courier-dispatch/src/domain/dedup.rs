//! Bounded duplicate filter over delivery hashes.

use crate::config::DuplicateCacheConfig;
use crate::domain::MessageHash;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};

/// Remembers recently admitted delivery hashes.
///
/// When the count exceeds `max_entries` the oldest hashes are dropped until
/// `retain_after_trim` remain. A message older than the retained window can
/// therefore be admitted again.
pub struct DuplicateFilter {
    inner: Mutex<SeenHashes>,
    max_entries: usize,
    retain_after_trim: usize,
}

#[derive(Default)]
struct SeenHashes {
    members: HashSet<MessageHash>,
    order: VecDeque<MessageHash>,
}

impl DuplicateFilter {
    /// Create with explicit bounds.
    pub fn new(max_entries: usize, retain_after_trim: usize) -> Self {
        Self {
            inner: Mutex::new(SeenHashes::default()),
            max_entries,
            retain_after_trim: retain_after_trim.min(max_entries),
        }
    }

    /// Create from configuration.
    pub fn from_config(config: &DuplicateCacheConfig) -> Self {
        Self::new(config.max_entries, config.retain_after_trim)
    }

    /// Record `hash`; `false` if it was already present.
    pub fn admit(&self, hash: MessageHash) -> bool {
        let mut seen = self.inner.lock();
        if !seen.members.insert(hash) {
            return false;
        }
        seen.order.push_back(hash);

        if seen.order.len() > self.max_entries {
            let evict = seen.order.len() - self.retain_after_trim;
            for _ in 0..evict {
                if let Some(oldest) = seen.order.pop_front() {
                    seen.members.remove(&oldest);
                }
            }
            tracing::debug!(
                evicted = evict,
                retained = seen.order.len(),
                "Duplicate cache trimmed"
            );
        }
        true
    }

    /// Whether `hash` is currently remembered.
    pub fn contains(&self, hash: &MessageHash) -> bool {
        self.inner.lock().members.contains(hash)
    }

    /// Number of remembered hashes.
    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    /// Whether nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget everything.
    pub fn reset(&self) {
        let mut seen = self.inner.lock();
        seen.members.clear();
        seen.order.clear();
    }
}
