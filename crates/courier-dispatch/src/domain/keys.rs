//! Encryption and decryption key material.

use std::fmt;

/// Which cipher a key belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeyKind {
    /// Shared secret
    Symmetric,
    /// secp256k1 key pair
    Asymmetric,
}

/// A key tried when decoding inbound messages.
///
/// For `Asymmetric` the bytes are the private key.
#[derive(Clone, PartialEq, Eq)]
pub struct DecryptionKey {
    /// Raw key bytes
    pub bytes: Vec<u8>,
    /// Cipher selector
    pub kind: KeyKind,
}

impl DecryptionKey {
    /// Shared-secret key.
    pub fn symmetric(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            kind: KeyKind::Symmetric,
        }
    }

    /// Private key of an asymmetric pair.
    pub fn asymmetric(private_key: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: private_key.into(),
            kind: KeyKind::Asymmetric,
        }
    }
}

impl fmt::Debug for DecryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptionKey")
            .field("kind", &self.kind)
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A key used to encrypt outbound messages.
///
/// For `Asymmetric` the bytes are the recipient's public key.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey {
    /// Raw key bytes
    pub bytes: Vec<u8>,
    /// Cipher selector
    pub kind: KeyKind,
}

impl EncryptionKey {
    /// Shared-secret key.
    pub fn symmetric(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            kind: KeyKind::Symmetric,
        }
    }

    /// Recipient public key.
    pub fn asymmetric(public_key: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: public_key.into(),
            kind: KeyKind::Asymmetric,
        }
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            KeyKind::Symmetric => f
                .debug_struct("EncryptionKey")
                .field("kind", &self.kind)
                .field("bytes", &"[REDACTED]")
                .finish(),
            KeyKind::Asymmetric => f
                .debug_struct("EncryptionKey")
                .field("kind", &self.kind)
                .field("public_key", &hex::encode(&self.bytes))
                .finish(),
        }
    }
}

/// How an outbound envelope is encrypted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum EncryptionMode {
    /// Plaintext
    #[default]
    None,
    /// The key registered with `auto_encrypt`; plaintext if there is none
    ImplicitDefault,
    /// This key
    Explicit(EncryptionKey),
}
