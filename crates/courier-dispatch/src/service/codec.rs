//! # Message Codec
//!
//! Envelope encode (sign, then encrypt) and decode (try every registered key,
//! fall back to plaintext), plus signature verification.

use crate::domain::{now_ms, DecryptionKey, EncryptionKey, EncryptionMode, Envelope, KeyKind};
use crate::errors::CodecError;
use crate::ports::{Cipher, Identity, SignerRecovery};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, trace};

/// Output of [`MessageCodec::encode`].
#[derive(Clone, Debug)]
pub struct EncodedEnvelope {
    /// Bytes to publish
    pub bytes: Vec<u8>,
    /// Whether `bytes` are ciphertext
    pub encrypted: bool,
    /// The envelope before serialization
    pub envelope: Envelope,
}

/// Output of [`MessageCodec::decode`].
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedEnvelope {
    /// Parsed envelope
    pub envelope: Envelope,
    /// Decrypted with one of the registered keys
    pub was_encrypted: bool,
}

#[derive(Default)]
struct KeyRing {
    decryption: Vec<DecryptionKey>,
    default_encryption: Option<EncryptionKey>,
}

/// Envelope codec with a key ring.
pub struct MessageCodec {
    cipher: Arc<dyn Cipher>,
    recovery: Arc<dyn SignerRecovery>,
    keys: RwLock<KeyRing>,
}

impl MessageCodec {
    /// Create with no keys.
    pub fn new(cipher: Arc<dyn Cipher>, recovery: Arc<dyn SignerRecovery>) -> Self {
        Self {
            cipher,
            recovery,
            keys: RwLock::new(KeyRing::default()),
        }
    }

    /// Add a decryption key. With `auto_encrypt`, it also becomes the
    /// implicit default for outbound messages (for a private key, its
    /// public half). Emits with default options pick it up; pass
    /// [`EncryptionMode::None`] to publish plaintext anyway.
    pub fn register_key(&self, key: DecryptionKey, auto_encrypt: bool) -> Result<(), CodecError> {
        let default = if auto_encrypt {
            Some(match key.kind {
                KeyKind::Symmetric => EncryptionKey::symmetric(key.bytes.clone()),
                KeyKind::Asymmetric => EncryptionKey::asymmetric(
                    self.cipher
                        .derive_public_key(&key.bytes)
                        .map_err(CodecError::KeyDerivation)?,
                ),
            })
        } else {
            None
        };

        let mut ring = self.keys.write();
        debug!(kind = ?key.kind, auto_encrypt, position = ring.decryption.len(), "Key registered");
        ring.decryption.push(key);
        if default.is_some() {
            ring.default_encryption = default;
        }
        Ok(())
    }

    /// Number of registered decryption keys.
    pub fn key_count(&self) -> usize {
        self.keys.read().decryption.len()
    }

    /// The implicit default encryption key, if any.
    pub fn default_encryption_key(&self) -> Option<EncryptionKey> {
        self.keys.read().default_encryption.clone()
    }

    /// Forget every key.
    pub fn clear_keys(&self) {
        let mut ring = self.keys.write();
        ring.decryption.clear();
        ring.default_encryption = None;
    }

    /// Build, optionally sign, serialize and optionally encrypt an envelope.
    pub fn encode(
        &self,
        message_type: &str,
        payload: Value,
        identity: Option<&dyn Identity>,
        mode: &EncryptionMode,
    ) -> Result<EncodedEnvelope, CodecError> {
        let mut envelope = Envelope::new(message_type, payload);
        envelope.timestamp = Some(now_ms());

        if let Some(identity) = identity {
            envelope.signer = Some(identity.address());
            let canonical = envelope.canonical_bytes()?;
            let signature = identity.sign(&canonical).map_err(CodecError::Signing)?;
            envelope.signature = Some(format!("0x{}", hex::encode(signature)));
        }

        let plaintext = serde_json::to_vec(&envelope).map_err(CodecError::Serialize)?;

        let key = match mode {
            EncryptionMode::None => None,
            EncryptionMode::ImplicitDefault => self.default_encryption_key(),
            EncryptionMode::Explicit(key) => Some(key.clone()),
        };

        let (bytes, encrypted) = match key {
            None => (plaintext, false),
            Some(key) => {
                let sealed = match key.kind {
                    KeyKind::Asymmetric => self.cipher.encrypt_asymmetric(&key.bytes, &plaintext),
                    KeyKind::Symmetric => self.cipher.encrypt_symmetric(&plaintext, &key.bytes),
                }
                .map_err(CodecError::Encryption)?;
                (sealed, true)
            }
        };

        Ok(EncodedEnvelope {
            bytes,
            encrypted,
            envelope,
        })
    }

    /// Decrypt with the first key that works, else read as plaintext.
    ///
    /// Wrong keys are expected and silent; only bytes that are neither
    /// decryptable nor JSON produce an error.
    pub fn decode(&self, bytes: &[u8]) -> Result<DecodedEnvelope, CodecError> {
        let keys = self.keys.read().decryption.clone();

        for (position, key) in keys.iter().enumerate() {
            let attempt = match key.kind {
                KeyKind::Asymmetric => self.cipher.decrypt_asymmetric(&key.bytes, bytes),
                KeyKind::Symmetric => self.cipher.decrypt_symmetric(bytes, &key.bytes),
            };
            match attempt {
                Ok(plaintext) => {
                    trace!(position, kind = ?key.kind, "Decrypted with registered key");
                    return Ok(DecodedEnvelope {
                        envelope: parse(&plaintext)?,
                        was_encrypted: true,
                    });
                }
                Err(e) => trace!(position, error = %e, "Key did not decrypt"),
            }
        }

        Ok(DecodedEnvelope {
            envelope: parse(bytes)?,
            was_encrypted: false,
        })
    }

    /// Whether the envelope is signed by the address it claims.
    pub fn verify(&self, envelope: &Envelope) -> bool {
        let (Some(signature), Some(signer)) = (&envelope.signature, &envelope.signer) else {
            return false;
        };

        let Ok(signature) = hex::decode(signature.trim_start_matches("0x")) else {
            debug!(message_type = %envelope.message_type, "Signature is not hex");
            return false;
        };
        let Ok(canonical) = envelope.canonical_bytes() else {
            return false;
        };

        match self.recovery.recover_signer(&canonical, &signature) {
            Ok(recovered) => recovered.eq_ignore_ascii_case(signer),
            Err(e) => {
                debug!(message_type = %envelope.message_type, error = %e, "Signer recovery failed");
                false
            }
        }
    }
}

fn parse(bytes: &[u8]) -> Result<Envelope, CodecError> {
    serde_json::from_slice(bytes).map_err(|e| CodecError::Malformed(e.to_string()))
}
