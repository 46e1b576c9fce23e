//! Transport-level messages, delivery hashes and stored records.

use courier_crypto::keccak256_many;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// A message as the transport delivers or publishes it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportMessage {
    /// Application namespace
    pub content_topic: String,
    /// Transport topic
    pub pubsub_topic: String,
    /// Envelope bytes, possibly encrypted
    pub payload: Vec<u8>,
    /// Sender timestamp in milliseconds
    pub timestamp: Option<u64>,
    /// Not retained by the transport's history service
    pub ephemeral: bool,
}

impl TransportMessage {
    /// Create a persistent message without a timestamp.
    pub fn new(
        content_topic: impl Into<String>,
        pubsub_topic: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            content_topic: content_topic.into(),
            pubsub_topic: pubsub_topic.into(),
            payload,
            timestamp: None,
            ephemeral: false,
        }
    }

    /// Set the timestamp (milliseconds).
    pub fn with_timestamp(mut self, timestamp_ms: u64) -> Self {
        self.timestamp = Some(timestamp_ms);
        self
    }

    /// Mark as ephemeral.
    pub fn ephemeral(mut self, ephemeral: bool) -> Self {
        self.ephemeral = ephemeral;
        self
    }

    /// Delivery hash used for duplicate suppression and as the storage key.
    pub fn hash(&self) -> MessageHash {
        transport_hash(self)
    }
}

/// 32-byte delivery hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageHash(pub [u8; 32]);

impl MessageHash {
    /// `0x`-prefixed lowercase hex.
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for MessageHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for MessageHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageHash({})", self.to_hex())
    }
}

/// keccak256(content_topic || payload || timestamp || pubsub_topic).
///
/// The timestamp is its decimal rendering, or nothing when absent, so two
/// copies of one message hash identically regardless of which path
/// (live, local replay, network backfill) delivered them.
pub fn transport_hash(message: &TransportMessage) -> MessageHash {
    let timestamp = message
        .timestamp
        .map(|t| t.to_string())
        .unwrap_or_default();

    MessageHash(keccak256_many(&[
        message.content_topic.as_bytes(),
        message.payload.as_slice(),
        timestamp.as_bytes(),
        message.pubsub_topic.as_bytes(),
    ]))
}

/// Whether a stored message was received or sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Received from the network
    In,
    /// Published by this node
    Out,
}

/// A locally persisted message, keyed by `content_hash`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredMessage {
    /// The transport message as received or sent
    pub message: TransportMessage,
    /// Primary key
    pub content_hash: MessageHash,
    /// Received or sent
    pub direction: Direction,
}

impl StoredMessage {
    /// Wrap a message, computing its key.
    pub fn new(message: TransportMessage, direction: Direction) -> Self {
        let content_hash = message.hash();
        Self {
            message,
            content_hash,
            direction,
        }
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TransportMessage {
        TransportMessage::new("/app/1/chat/json", "/courier/2/default/proto", b"hi".to_vec())
            .with_timestamp(1_700_000_000_000)
    }

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(sample().hash(), sample().hash());
    }

    #[test]
    fn test_hash_ignores_ephemeral_flag() {
        assert_eq!(sample().hash(), sample().ephemeral(true).hash());
    }

    #[test]
    fn test_hash_covers_every_field() {
        let base = sample().hash();

        let mut other = sample();
        other.content_topic.push('x');
        assert_ne!(other.hash(), base);

        let mut other = sample();
        other.payload.push(0);
        assert_ne!(other.hash(), base);

        let mut other = sample();
        other.timestamp = None;
        assert_ne!(other.hash(), base);

        let mut other = sample();
        other.pubsub_topic.push('x');
        assert_ne!(other.hash(), base);
    }

    #[test]
    fn test_hash_matches_concatenation() {
        let message = sample();
        let expected = courier_crypto::keccak256(
            b"/app/1/chat/jsonhi1700000000000/courier/2/default/proto",
        );
        assert_eq!(message.hash().0, expected);
    }

    #[test]
    fn test_hex_rendering() {
        let hash = MessageHash([0xab; 32]);
        assert_eq!(hash.to_hex().len(), 66);
        assert!(hash.to_string().starts_with("0xabab"));
    }

    #[test]
    fn test_stored_message_key() {
        let stored = StoredMessage::new(sample(), Direction::In);
        assert_eq!(stored.content_hash, sample().hash());
    }
}
