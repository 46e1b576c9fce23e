//! # Courier Crypto - Envelope Cryptography
//!
//! Concrete primitives behind the dispatcher's cipher and identity ports.
//!
//! ## Components
//!
//! | Module | Algorithm | Use Case |
//! |--------|-----------|----------|
//! | `hashing` | Keccak-256 | Delivery hashes, signing digests, addresses |
//! | `symmetric` | XChaCha20-Poly1305 | Shared-secret envelope encryption |
//! | `asymmetric` | ECIES (secp256k1 ECDH + HKDF-SHA256 + XChaCha20-Poly1305) | Public-key envelope encryption |
//! | `ecdsa` | secp256k1 recoverable ECDSA | Envelope signing, signer recovery |
//!
//! ## Wire Formats
//!
//! - Symmetric: `nonce (24) || ciphertext`
//! - Asymmetric: `ephemeral_pubkey (33, compressed) || nonce (24) || ciphertext`
//! - Signature: `r (32) || s (32) || v (1)`, `v` in {27, 28}

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod asymmetric;
pub mod ecdsa;
pub mod errors;
pub mod hashing;
pub mod symmetric;

// Re-exports
pub use asymmetric::{derive_public_key, open_from, seal_to, EciesKeyPair};
pub use ecdsa::{format_address, recover_address, Address, RecoverableSignature, Secp256k1Identity};
pub use errors::CryptoError;
pub use hashing::{keccak256, keccak256_many, Hash};
pub use symmetric::{open, seal, SecretKey};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
