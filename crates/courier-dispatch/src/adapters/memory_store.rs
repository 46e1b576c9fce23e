//! In-memory local store.

use crate::domain::{Direction, MessageHash, StoredMessage};
use crate::errors::StoreError;
use crate::ports::{LocalStore, PutOutcome};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Insertion-ordered store keyed by content hash.
///
/// A duplicate insert fails with `StoreError::Conflict`, the way a unique
/// index would.
#[derive(Default)]
pub struct InMemoryStore {
    records: RwLock<Records>,
    unavailable: AtomicBool,
    put_calls: AtomicUsize,
}

#[derive(Default)]
struct Records {
    rows: Vec<StoredMessage>,
    keys: HashSet<MessageHash>,
}

impl InMemoryStore {
    /// Empty, ready store.
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose `ready()` fails.
    pub fn unavailable() -> Self {
        let store = Self::default();
        store.unavailable.store(true, Ordering::SeqCst);
        store
    }

    /// Pre-populate, bypassing the put counter.
    pub fn with_records(records: impl IntoIterator<Item = StoredMessage>) -> Self {
        let store = Self::default();
        {
            let mut guard = store.records.write();
            for record in records {
                if guard.keys.insert(record.content_hash) {
                    guard.rows.push(record);
                }
            }
        }
        store
    }

    /// Number of `put` calls, including rejected duplicates.
    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.read().rows.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store is closed".into()));
        }
        Ok(())
    }

    fn select(&self, predicate: impl Fn(&StoredMessage) -> bool) -> Vec<StoredMessage> {
        self.records
            .read()
            .rows
            .iter()
            .filter(|r| predicate(r))
            .cloned()
            .collect()
    }

    fn remove(&self, predicate: impl Fn(&StoredMessage) -> bool) -> usize {
        let mut records = self.records.write();
        let Records { rows, keys } = &mut *records;
        let before = rows.len();
        rows.retain(|r| {
            let matched = predicate(r);
            if matched {
                keys.remove(&r.content_hash);
            }
            !matched
        });
        before - rows.len()
    }
}

#[async_trait]
impl LocalStore for InMemoryStore {
    async fn ready(&self) -> Result<(), StoreError> {
        self.check_available()
    }

    async fn put(&self, message: StoredMessage) -> Result<PutOutcome, StoreError> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let mut records = self.records.write();
        if !records.keys.insert(message.content_hash) {
            return Err(StoreError::Conflict(message.content_hash.to_hex()));
        }
        records.rows.push(message);
        Ok(PutOutcome::Inserted)
    }

    async fn get_all(&self) -> Result<Vec<StoredMessage>, StoreError> {
        self.check_available()?;
        Ok(self.select(|_| true))
    }

    async fn get_by_direction(&self, direction: Direction) -> Result<Vec<StoredMessage>, StoreError> {
        self.check_available()?;
        Ok(self.select(|r| r.direction == direction))
    }

    async fn get_by_content_topic(
        &self,
        content_topic: &str,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        self.check_available()?;
        Ok(self.select(|r| r.message.content_topic == content_topic))
    }

    async fn delete_by_direction(&self, direction: Direction) -> Result<usize, StoreError> {
        self.check_available()?;
        Ok(self.remove(|r| r.direction == direction))
    }

    async fn delete_by_content_topic(&self, content_topic: &str) -> Result<usize, StoreError> {
        self.check_available()?;
        Ok(self.remove(|r| r.message.content_topic == content_topic))
    }
}
