//! # Errors
//!
//! Error types for the dispatch layer.
//!
//! Most failures in this crate are per-message and never reach a caller:
//! a wrong decryption key falls through, an unknown type is dropped, a
//! signature mismatch skips one registration. The types below cover what
//! does surface: local encode failures, collaborator errors at the port
//! boundary, and configuration mistakes.

use courier_crypto::CryptoError;
use thiserror::Error;

/// Envelope encode/decode errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Envelope could not be serialized to JSON.
    #[error("Envelope serialization failed: {0}")]
    Serialize(#[source] serde_json::Error),

    /// Bytes were neither decryptable with a registered key nor valid JSON.
    #[error("Malformed envelope: {0}")]
    Malformed(String),

    /// Encryption with the selected key failed.
    #[error("Encryption failed: {0}")]
    Encryption(#[source] CryptoError),

    /// Signing with the supplied identity failed.
    #[error("Signing failed: {0}")]
    Signing(#[source] CryptoError),

    /// Public key could not be derived from a registered private key.
    #[error("Key derivation failed: {0}")]
    KeyDerivation(#[source] CryptoError),
}

/// Transport port errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Required protocols never became available.
    #[error("Transport not ready: {0}")]
    NotReady(String),

    /// Publish could not be attempted.
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// Filter subscription request was rejected.
    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),

    /// Subscription heartbeat failed.
    #[error("Ping failed: {0}")]
    PingFailed(String),

    /// Historical query failed.
    #[error("History query failed: {0}")]
    QueryFailed(String),

    /// An operation exceeded its deadline.
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Transport has been shut down.
    #[error("Transport closed")]
    Closed,
}

impl TransportError {
    /// Whether the next scheduled cycle may succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Closed)
    }
}

/// Local store port errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Store is not (yet) usable.
    #[error("Local store unavailable: {0}")]
    Unavailable(String),

    /// A record with the same content hash already exists.
    #[error("Record {0} already exists")]
    Conflict(String),

    /// Backend-specific failure.
    #[error("Local store backend error: {0}")]
    Backend(String),
}

/// Invalid configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Content topic is empty.
    #[error("Content topic must not be empty")]
    EmptyContentTopic,

    /// Pubsub topic is empty.
    #[error("Pubsub topic must not be empty")]
    EmptyPubsubTopic,

    /// A bound that must be positive was zero.
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    /// Duplicate cache trim target is not below its bound.
    #[error("retain_after_trim ({retain}) must be below max_entries ({max})")]
    TrimBound {
        /// Entries kept after a trim
        retain: usize,
        /// Maximum entries before trimming
        max: usize,
    },

    /// Backoff ceiling is below the base step.
    #[error("max_backoff ({max:?}) must not be below base_backoff ({base:?})")]
    BackoffRange {
        /// Per-attempt step
        base: std::time::Duration,
        /// Ceiling
        max: std::time::Duration,
    },
}

/// Errors surfaced by the dispatcher's public API.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Configuration rejected at construction.
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Transport could not be initialised during start.
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(#[from] TransportError),

    /// Local store could not be initialised, or a direct store call failed.
    #[error("Local store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// Local encode, sign or encrypt failure.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}
