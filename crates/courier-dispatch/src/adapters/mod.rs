//! # Adapters Layer (Hexagonal Architecture)
//!
//! Concrete implementations of the outbound ports: crypto providers backed
//! by `courier-crypto`, the idempotent store adapter, and in-memory
//! transport and store used by tests and demos.

mod crypto;
mod memory_store;
mod memory_transport;
mod store;

pub use crypto::{LocalIdentity, RecoverySigner, Secp256k1Cipher};
pub use memory_store::InMemoryStore;
pub use memory_transport::{InMemoryTransport, MemorySubscription};
pub use store::LocalStoreAdapter;
