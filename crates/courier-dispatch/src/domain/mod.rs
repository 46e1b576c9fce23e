//! # Domain Layer
//!
//! Messages, envelopes, keys, registrations and the two in-memory
//! structures the dispatch pipeline consults on every delivery:
//! the duplicate filter and the routing table.

pub mod dedup;
pub mod envelope;
pub mod keys;
pub mod message;
pub mod registration;
pub mod routing;

pub use dedup::DuplicateFilter;
pub use envelope::{map_entries, Envelope};
pub use keys::{DecryptionKey, EncryptionKey, EncryptionMode, KeyKind};
pub use message::{now_ms, transport_hash, Direction, MessageHash, StoredMessage, TransportMessage};
pub use registration::{
    handler_fn, DispatchMetadata, MessageHandler, Registration, RegistrationId,
    RegistrationOptions, SharedHandler,
};
pub use routing::RoutingTable;

/// Result of handing one transport message to the dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Delivery hash already seen
    Duplicate,
    /// Neither decryptable nor parseable
    Undecodable,
    /// No registration for the envelope type
    UnknownType,
    /// Number of handlers invoked (zero if every registration filtered it out)
    Delivered {
        /// Handlers invoked
        handlers: usize,
    },
}
