//! # Recoverable ECDSA (secp256k1)
//!
//! Envelope signatures carry the recovery id, so a verifier needs no public
//! key: it recovers the signer address from `(message, signature)` and
//! compares it with the address the envelope claims.
//!
//! ## Conventions (Ethereum-compatible)
//!
//! - Digest: `keccak256("\x19Ethereum Signed Message:\n" || len || message)`
//! - Signature: `r || s || v`, low-S (EIP-2), `v = 27 + recovery_id`
//! - Address: last 20 bytes of `keccak256(uncompressed_pubkey[1..])`

use crate::hashing::{keccak256, keccak256_many, Hash};
use crate::CryptoError;
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};

/// 20-byte account address.
pub type Address = [u8; 20];

/// Signature length: r (32) || s (32) || v (1).
pub const SIGNATURE_LEN: usize = 65;

const PERSONAL_MESSAGE_PREFIX: &[u8] = b"\x19Ethereum Signed Message:\n";

/// A 65-byte recoverable signature.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecoverableSignature([u8; SIGNATURE_LEN]);

impl RecoverableSignature {
    /// Parse from raw bytes (must be exactly 65 bytes).
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; SIGNATURE_LEN] = bytes.try_into().map_err(|_| CryptoError::InvalidSignature)?;
        Ok(Self(array))
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LEN] {
        &self.0
    }

    /// Recovery byte `v`.
    pub fn v(&self) -> u8 {
        self.0[64]
    }
}

/// A local signing identity.
pub struct Secp256k1Identity {
    signing_key: SigningKey,
}

impl Secp256k1Identity {
    /// Generate a random identity.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::random(&mut rand::thread_rng()),
        }
    }

    /// Restore from a 32-byte secret scalar.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let signing_key = SigningKey::from_slice(bytes).map_err(|_| CryptoError::InvalidPrivateKey)?;
        Ok(Self { signing_key })
    }

    /// The identity's address.
    pub fn address(&self) -> Address {
        address_from_pubkey(self.signing_key.verifying_key())
    }

    /// Sign a message (deterministic RFC 6979, low-S).
    pub fn sign(&self, message: &[u8]) -> Result<RecoverableSignature, CryptoError> {
        let digest = personal_message_hash(message);
        let (signature, recovery_id) = self
            .signing_key
            .sign_prehash_recoverable(&digest)
            .map_err(|e| CryptoError::SigningFailed(e.to_string()))?;

        // k256 already emits low-S; normalising again is a no-op then.
        let (signature, recovery_id) = match signature.normalize_s() {
            Some(normalized) => (
                normalized,
                RecoveryId::new(!recovery_id.is_y_odd(), recovery_id.is_x_reduced()),
            ),
            None => (signature, recovery_id),
        };

        let mut bytes = [0u8; SIGNATURE_LEN];
        bytes[..64].copy_from_slice(&signature.to_bytes());
        bytes[64] = 27 + recovery_id.to_byte();
        Ok(RecoverableSignature(bytes))
    }
}

/// Recover the signer address of `message` from a 65-byte signature.
pub fn recover_address(message: &[u8], signature: &[u8]) -> Result<Address, CryptoError> {
    let signature = RecoverableSignature::from_slice(signature)?;
    let recovery_id = parse_recovery_id(signature.v())?;
    let sig = Signature::from_slice(&signature.as_bytes()[..64])
        .map_err(|_| CryptoError::InvalidSignature)?;

    let digest = personal_message_hash(message);
    let recovered = VerifyingKey::recover_from_prehash(&digest, &sig, recovery_id)
        .map_err(|_| CryptoError::RecoveryFailed)?;

    Ok(address_from_pubkey(&recovered))
}

/// `0x`-prefixed lowercase hex rendering of an address.
pub fn format_address(address: &Address) -> String {
    format!("0x{}", hex::encode(address))
}

/// Derive the address from a public key.
fn address_from_pubkey(public_key: &VerifyingKey) -> Address {
    let encoded = public_key.to_encoded_point(false);
    // Keccak256 of the public key without the 0x04 prefix
    let hash = keccak256(&encoded.as_bytes()[1..]);

    let mut address = [0u8; 20];
    address.copy_from_slice(&hash[12..]);
    address
}

fn personal_message_hash(message: &[u8]) -> Hash {
    let length = message.len().to_string();
    keccak256_many(&[PERSONAL_MESSAGE_PREFIX, length.as_bytes(), message])
}

/// Valid v values: 0, 1, 27, 28
fn parse_recovery_id(v: u8) -> Result<RecoveryId, CryptoError> {
    let id = match v {
        0 | 27 => 0,
        1 | 28 => 1,
        _ => return Err(CryptoError::InvalidRecoveryId(v)),
    };

    RecoveryId::try_from(id).map_err(|_| CryptoError::InvalidRecoveryId(v))
}
