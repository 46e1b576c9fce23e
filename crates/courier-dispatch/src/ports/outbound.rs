//! # Outbound Ports
//!
//! Traits for the collaborators the dispatcher drives: the publish/subscribe
//! transport, the local message store, and the cryptographic providers.

use crate::domain::{Direction, StoredMessage, TransportMessage};
use crate::errors::{StoreError, TransportError};
use async_trait::async_trait;
use courier_crypto::CryptoError;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::Stream;

/// Transport capability a caller can wait for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Live push subscriptions
    Filter,
    /// Fire-and-forget publish
    LightPush,
    /// Historical queries
    Store,
}

/// Publish result as reported by the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublishOutcome {
    /// At least one peer accepted the message
    pub delivered: bool,
}

/// Selects which messages a subscription or query returns.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ContentDecoder {
    /// Content topic to accept
    pub content_topic: String,
    /// Pubsub topic the content topic lives on
    pub pubsub_topic: String,
}

impl ContentDecoder {
    /// Decoder for one content topic.
    pub fn new(content_topic: impl Into<String>, pubsub_topic: impl Into<String>) -> Self {
        Self {
            content_topic: content_topic.into(),
            pubsub_topic: pubsub_topic.into(),
        }
    }

    /// Whether `message` passes this decoder.
    pub fn matches(&self, message: &TransportMessage) -> bool {
        self.content_topic == message.content_topic && self.pubsub_topic == message.pubsub_topic
    }
}

/// Where a live subscription pushes its deliveries.
pub type MessageSink = mpsc::UnboundedSender<TransportMessage>;

/// Page ordering for historical queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageDirection {
    /// Oldest first
    Forward,
    /// Newest first
    Backward,
}

/// Historical query parameters. Times are milliseconds, inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HistoryQuery {
    /// Window start
    pub start_ms: u64,
    /// Window end
    pub end_ms: u64,
    /// Page ordering
    pub direction: PageDirection,
    /// Messages per page
    pub page_size: usize,
}

/// Lazily fetched pages of historical messages.
pub type PageStream =
    Pin<Box<dyn Stream<Item = Result<Vec<TransportMessage>, TransportError>> + Send>>;

/// A peer connection the transport lost.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerDisconnected {
    /// Transport-specific peer identifier
    pub peer_id: String,
}

/// Publish/subscribe transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Resolve once every listed protocol has a usable peer.
    async fn wait_ready(&self, protocols: &[Protocol]) -> Result<(), TransportError>;

    /// Publish one message.
    async fn publish(&self, message: &TransportMessage) -> Result<PublishOutcome, TransportError>;

    /// Create a fresh filter subscription object on `pubsub_topic`.
    async fn create_subscription(
        &self,
        pubsub_topic: &str,
    ) -> Result<Arc<dyn FilterSubscription>, TransportError>;

    /// Query the transport's history service.
    async fn query_history(
        &self,
        decoders: &[ContentDecoder],
        query: HistoryQuery,
    ) -> Result<PageStream, TransportError>;

    /// Peer disconnect notifications.
    fn peer_disconnects(&self) -> broadcast::Receiver<PeerDisconnected>;
}

/// A live push subscription.
#[async_trait]
pub trait FilterSubscription: Send + Sync {
    /// Start (or restart) delivery for `decoders` into `sink`.
    async fn subscribe(
        &self,
        decoders: &[ContentDecoder],
        sink: MessageSink,
    ) -> Result<(), TransportError>;

    /// Heartbeat.
    async fn ping(&self) -> Result<(), TransportError>;

    /// Stop all delivery on this subscription.
    async fn unsubscribe_all(&self) -> Result<(), TransportError>;
}

/// Result of a successful store insert.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    /// New record
    Inserted,
    /// Record with this content hash already existed
    AlreadyExists,
}

/// Local message persistence.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Resolve once the store accepts reads and writes.
    async fn ready(&self) -> Result<(), StoreError>;

    /// Insert keyed by `content_hash`. A duplicate key may be reported
    /// either as `AlreadyExists` or as `StoreError::Conflict`.
    async fn put(&self, message: StoredMessage) -> Result<PutOutcome, StoreError>;

    /// Every record, in insertion order.
    async fn get_all(&self) -> Result<Vec<StoredMessage>, StoreError>;

    /// Records with `direction`.
    async fn get_by_direction(&self, direction: Direction) -> Result<Vec<StoredMessage>, StoreError>;

    /// Records on `content_topic`.
    async fn get_by_content_topic(&self, content_topic: &str)
        -> Result<Vec<StoredMessage>, StoreError>;

    /// Delete records with `direction`; returns the number removed.
    async fn delete_by_direction(&self, direction: Direction) -> Result<usize, StoreError>;

    /// Delete records on `content_topic`; returns the number removed.
    async fn delete_by_content_topic(&self, content_topic: &str) -> Result<usize, StoreError>;
}

/// Signing identity for outbound envelopes.
pub trait Identity: Send + Sync {
    /// `0x` hex address recorded as the envelope signer.
    fn address(&self) -> String;

    /// Sign canonical envelope bytes; returns `r || s || v`.
    fn sign(&self, canonical: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Recovers the signer address from a signature.
pub trait SignerRecovery: Send + Sync {
    /// `0x` hex address that produced `signature` over `canonical`.
    fn recover_signer(&self, canonical: &[u8], signature: &[u8]) -> Result<String, CryptoError>;
}

/// Envelope encryption provider. A decrypt error means "not decryptable with this key".
pub trait Cipher: Send + Sync {
    /// Encrypt to a public key.
    fn encrypt_asymmetric(&self, public_key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Decrypt with a private key.
    fn decrypt_asymmetric(&self, private_key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Encrypt with a shared secret.
    fn encrypt_symmetric(&self, plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Decrypt with a shared secret.
    fn decrypt_symmetric(&self, ciphertext: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Public key belonging to `private_key`.
    fn derive_public_key(&self, private_key: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_matches_both_topics() {
        let decoder = ContentDecoder::new("/a", "/ps");
        let hit = TransportMessage::new("/a", "/ps", vec![]);
        let wrong_content = TransportMessage::new("/b", "/ps", vec![]);
        let wrong_pubsub = TransportMessage::new("/a", "/other", vec![]);

        assert!(decoder.matches(&hit));
        assert!(!decoder.matches(&wrong_content));
        assert!(!decoder.matches(&wrong_pubsub));
    }
}
