//! Local store adapter.
//!
//! Normalises store semantics for the rest of the crate: a duplicate key is
//! success whichever way the backend reports it.

use crate::domain::{Direction, StoredMessage, TransportMessage};
use crate::errors::StoreError;
use crate::ports::{LocalStore, PutOutcome};
use std::sync::Arc;
use tracing::{debug, warn};

/// Idempotent persistence over any [`LocalStore`].
#[derive(Clone)]
pub struct LocalStoreAdapter {
    store: Arc<dyn LocalStore>,
}

impl LocalStoreAdapter {
    /// Wrap a store.
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    /// Wait for the backend.
    pub async fn ready(&self) -> Result<(), StoreError> {
        self.store.ready().await
    }

    /// Persist `message` with `direction`. A conflict is reported as
    /// `AlreadyExists`.
    pub async fn persist(
        &self,
        message: TransportMessage,
        direction: Direction,
    ) -> Result<PutOutcome, StoreError> {
        let record = StoredMessage::new(message, direction);
        let hash = record.content_hash;

        match self.store.put(record).await {
            Ok(outcome) => {
                debug!(hash = %hash, ?direction, ?outcome, "Message persisted");
                Ok(outcome)
            }
            Err(StoreError::Conflict(_)) => {
                debug!(hash = %hash, ?direction, "Message already stored");
                Ok(PutOutcome::AlreadyExists)
            }
            Err(e) => {
                warn!(hash = %hash, error = %e, "Failed to persist message");
                Err(e)
            }
        }
    }

    /// Every stored message.
    pub async fn load_all(&self) -> Result<Vec<StoredMessage>, StoreError> {
        self.store.get_all().await
    }

    /// Stored messages with `direction`.
    pub async fn by_direction(&self, direction: Direction) -> Result<Vec<StoredMessage>, StoreError> {
        self.store.get_by_direction(direction).await
    }

    /// Stored messages on `content_topic`.
    pub async fn by_content_topic(&self, content_topic: &str) -> Result<Vec<StoredMessage>, StoreError> {
        self.store.get_by_content_topic(content_topic).await
    }

    /// Delete stored messages with `direction`.
    pub async fn delete_by_direction(&self, direction: Direction) -> Result<usize, StoreError> {
        self.store.delete_by_direction(direction).await
    }

    /// Delete stored messages on `content_topic`.
    pub async fn delete_by_content_topic(&self, content_topic: &str) -> Result<usize, StoreError> {
        self.store.delete_by_content_topic(content_topic).await
    }
}
