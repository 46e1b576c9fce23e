//! # Courier Dispatch
//!
//! Typed message dispatch over a lossy pub/sub transport.
//!
//! Applications register handlers per message type and emit JSON payloads.
//! The dispatcher turns them into (optionally signed and encrypted)
//! envelopes, publishes them, and on the receiving side merges three
//! delivery paths into one exactly-once-per-node stream:
//!
//! ```text
//!   [Local Store] ──replay──┐
//!                           │
//!   [Filter Subscription] ──┼──→ [Duplicate Filter] → [Codec] → [Routing] → handlers
//!                           │
//!   [History Service] ──────┘        (backfill pages)
//! ```
//!
//! ## Reliability
//!
//! - **Dedup**: every delivery is keyed by its transport hash, so replays,
//!   backfills and live pushes may overlap freely
//! - **Subscription health**: heartbeat pings with linear backoff
//!   resubscription; the subscription is recreated after repeated failures
//! - **Gap recovery**: each successful resubscription backfills the window
//!   since the last history query
//! - **Retry**: optional FIFO of undelivered publishes, drained oldest-first
//!
//! ## Layout
//!
//! - `domain` - messages, envelopes, keys, registrations, dedup, routing
//! - `ports` - transport, store and crypto traits
//! - `adapters` - secp256k1 crypto providers, in-memory transport and store
//! - `service` - codec, pipeline, reconciliation, retry, subscription, facade

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapters;
pub mod config;
pub mod domain;
pub mod errors;
pub mod ports;
pub mod service;

// Re-exports
pub use adapters::{InMemoryStore, InMemoryTransport, LocalIdentity, LocalStoreAdapter};
pub use config::{
    DispatcherConfig, DuplicateCacheConfig, ReconciliationConfig, RetryConfig, SubscriptionConfig,
    DEFAULT_CONTENT_TOPIC, DEFAULT_PUBSUB_TOPIC,
};
pub use domain::{
    handler_fn, DecryptionKey, Direction, DispatchMetadata, DispatchOutcome, EncryptionKey,
    EncryptionMode, Envelope, MessageHandler, MessageHash, RegistrationId, RegistrationOptions,
    SharedHandler, StoredMessage, TransportMessage,
};
pub use errors::{CodecError, ConfigError, DispatchError, StoreError, TransportError};
pub use service::{
    Dispatcher, DispatcherDeps, DrainReport, EmitOptions, NetworkBackfill, SubscriptionState,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
