//! Crypto adapters backed by `courier-crypto`.

use crate::ports::{Cipher, Identity, SignerRecovery};
use courier_crypto::{
    derive_public_key, format_address, open, open_from, recover_address, seal, seal_to,
    CryptoError, SecretKey, Secp256k1Identity,
};

/// XChaCha20-Poly1305 for shared secrets, secp256k1 ECIES for key pairs.
#[derive(Clone, Copy, Debug, Default)]
pub struct Secp256k1Cipher;

impl Cipher for Secp256k1Cipher {
    fn encrypt_asymmetric(&self, public_key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        seal_to(public_key, plaintext)
    }

    fn decrypt_asymmetric(&self, private_key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        open_from(private_key, ciphertext)
    }

    fn encrypt_symmetric(&self, plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        seal(&SecretKey::from_slice(key)?, plaintext)
    }

    fn decrypt_symmetric(&self, ciphertext: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        open(&SecretKey::from_slice(key)?, ciphertext)
    }

    fn derive_public_key(&self, private_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        derive_public_key(private_key)
    }
}

/// Signs envelopes with a local secp256k1 key.
pub struct LocalIdentity {
    inner: Secp256k1Identity,
    address: String,
}

impl LocalIdentity {
    /// Wrap an existing identity.
    pub fn new(inner: Secp256k1Identity) -> Self {
        let address = format_address(&inner.address());
        Self { inner, address }
    }

    /// Fresh random identity.
    pub fn generate() -> Self {
        Self::new(Secp256k1Identity::generate())
    }

    /// Restore from a 32-byte secret.
    pub fn from_bytes(secret: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self::new(Secp256k1Identity::from_bytes(secret)?))
    }
}

impl Identity for LocalIdentity {
    fn address(&self) -> String {
        self.address.clone()
    }

    fn sign(&self, canonical: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(self.inner.sign(canonical)?.as_bytes().to_vec())
    }
}

/// Recovers Ethereum-style signer addresses.
#[derive(Clone, Copy, Debug, Default)]
pub struct RecoverySigner;

impl SignerRecovery for RecoverySigner {
    fn recover_signer(&self, canonical: &[u8], signature: &[u8]) -> Result<String, CryptoError> {
        recover_address(canonical, signature).map(|address| format_address(&address))
    }
}
