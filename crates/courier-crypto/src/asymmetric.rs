//! # Asymmetric Encryption (ECIES over secp256k1)
//!
//! A fresh ephemeral key agrees a shared secret with the recipient's public
//! key; HKDF-SHA256 turns it into an XChaCha20-Poly1305 key.
//!
//! Output: `ephemeral_pubkey (33, compressed) || nonce (24) || ciphertext`.
//! Only the holder of the matching private key can open it.

use crate::symmetric::{self, SecretKey};
use crate::CryptoError;
use hkdf::Hkdf;
use k256::ecdh::{diffie_hellman, EphemeralSecret};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use sha2::Sha256;
use zeroize::Zeroize;

const HKDF_INFO: &[u8] = b"courier:ecies:v1";

/// Compressed SEC1 public key length.
pub const PUBLIC_KEY_LEN: usize = 33;

/// Private scalar length.
pub const PRIVATE_KEY_LEN: usize = 32;

/// secp256k1 keypair for receiving asymmetrically encrypted envelopes.
pub struct EciesKeyPair {
    secret: k256::SecretKey,
}

impl EciesKeyPair {
    /// Generate a random keypair.
    pub fn generate() -> Self {
        Self {
            secret: k256::SecretKey::random(&mut rand::thread_rng()),
        }
    }

    /// Restore from a 32-byte private scalar.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret = k256::SecretKey::from_slice(bytes).map_err(|_| CryptoError::InvalidPrivateKey)?;
        Ok(Self { secret })
    }

    /// Compressed public key (33 bytes).
    pub fn public_key(&self) -> Vec<u8> {
        self.secret
            .public_key()
            .to_encoded_point(true)
            .as_bytes()
            .to_vec()
    }

    /// Private scalar bytes.
    pub fn private_key(&self) -> Vec<u8> {
        self.secret.to_bytes().to_vec()
    }
}

/// Derive the compressed public key for a private scalar.
pub fn derive_public_key(private_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    Ok(EciesKeyPair::from_bytes(private_key)?.public_key())
}

/// Encrypt `plaintext` to the holder of `public_key` (SEC1, compressed or not).
pub fn seal_to(public_key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let recipient =
        k256::PublicKey::from_sec1_bytes(public_key).map_err(|_| CryptoError::InvalidPublicKey)?;

    let ephemeral = EphemeralSecret::random(&mut rand::thread_rng());
    let ephemeral_public = ephemeral.public_key().to_encoded_point(true);
    let shared = ephemeral.diffie_hellman(&recipient);

    let key = derive_key(shared.raw_secret_bytes().as_slice(), ephemeral_public.as_bytes())?;
    let sealed = symmetric::seal(&key, plaintext)?;

    let mut out = Vec::with_capacity(PUBLIC_KEY_LEN + sealed.len());
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Decrypt a blob produced by [`seal_to`] with the recipient's private scalar.
///
/// Fails with `DecryptionFailed` when the blob was not addressed to this key,
/// which callers treat as "try the next key".
pub fn open_from(private_key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() <= PUBLIC_KEY_LEN {
        return Err(CryptoError::CiphertextTooShort {
            minimum: PUBLIC_KEY_LEN + 1,
            actual: data.len(),
        });
    }
    let secret = k256::SecretKey::from_slice(private_key).map_err(|_| CryptoError::InvalidPrivateKey)?;

    let (ephemeral_bytes, sealed) = data.split_at(PUBLIC_KEY_LEN);
    let ephemeral = k256::PublicKey::from_sec1_bytes(ephemeral_bytes)
        .map_err(|_| CryptoError::DecryptionFailed("no ephemeral key header".to_string()))?;

    let shared = diffie_hellman(secret.to_nonzero_scalar(), ephemeral.as_affine());
    let key = derive_key(shared.raw_secret_bytes().as_slice(), ephemeral_bytes)?;

    symmetric::open(&key, sealed)
}

fn derive_key(shared_secret: &[u8], salt: &[u8]) -> Result<SecretKey, CryptoError> {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), shared_secret);
    let mut okm = [0u8; symmetric::KEY_LEN];
    hkdf.expand(HKDF_INFO, &mut okm)
        .map_err(|_| CryptoError::KeyDerivationFailed)?;
    let key = SecretKey::from_bytes(okm);
    okm.zeroize();
    Ok(key)
}
