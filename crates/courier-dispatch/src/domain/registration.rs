//! Handler registrations.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Context passed to a handler alongside the payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchMetadata {
    /// Arrived encrypted and was decrypted with a registered key
    pub encrypted: bool,
    /// Delivered by local replay or network backfill
    pub from_replay: bool,
    /// Envelope timestamp, falling back to the transport timestamp
    pub timestamp: Option<u64>,
    /// Transport marked the message ephemeral
    pub ephemeral: bool,
    /// Content topic the message arrived on
    pub content_topic: String,
}

/// Receives decoded payloads for one message type.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one delivery. `signer` is the envelope's claimed signer
    /// (verified only when the registration asked for it).
    async fn handle(&self, payload: Value, signer: Option<String>, metadata: DispatchMetadata);
}

/// Shared handler; registration identity is the `Arc` allocation.
pub type SharedHandler = Arc<dyn MessageHandler>;

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Value, Option<String>, DispatchMetadata) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, payload: Value, signer: Option<String>, metadata: DispatchMetadata) {
        (self.0)(payload, signer, metadata).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> SharedHandler
where
    F: Fn(Value, Option<String>, DispatchMetadata) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Opaque handle returned by `register`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationId(pub(crate) u64);

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reg-{}", self.0)
    }
}

/// Per-registration delivery filters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistrationOptions {
    /// Require a valid signature from the claimed signer
    pub verify_sender: bool,
    /// Ignore messages that arrived in plaintext
    pub accept_only_encrypted: bool,
    /// Only accept this content topic; `None` means the primary topic
    pub content_topic: Option<String>,
    /// Persist accepted inbound messages
    pub store_locally: bool,
}

impl Default for RegistrationOptions {
    fn default() -> Self {
        Self {
            verify_sender: false,
            accept_only_encrypted: false,
            content_topic: None,
            store_locally: true,
        }
    }
}

impl RegistrationOptions {
    /// Require signature verification.
    pub fn verify_sender(mut self) -> Self {
        self.verify_sender = true;
        self
    }

    /// Drop plaintext deliveries.
    pub fn encrypted_only(mut self) -> Self {
        self.accept_only_encrypted = true;
        self
    }

    /// Listen on a specific content topic.
    pub fn on_topic(mut self, topic: impl Into<String>) -> Self {
        self.content_topic = Some(topic.into());
        self
    }

    /// Do not persist deliveries for this registration.
    pub fn without_storage(mut self) -> Self {
        self.store_locally = false;
        self
    }
}

/// A handler bound to a message type with resolved options.
#[derive(Clone)]
pub struct Registration {
    /// Handle
    pub id: RegistrationId,
    /// Envelope `type` this registration receives
    pub message_type: String,
    /// Callback
    pub handler: SharedHandler,
    /// Require a valid signature
    pub verify_sender: bool,
    /// Drop plaintext deliveries
    pub accept_only_encrypted: bool,
    /// Resolved content topic
    pub content_topic: String,
    /// Persist accepted inbound messages
    pub store_locally: bool,
}

impl Registration {
    /// Whether `handler` is the very allocation this registration holds.
    pub fn has_handler(&self, handler: &SharedHandler) -> bool {
        // Compare data pointers only; vtable addresses are not unique.
        std::ptr::eq(
            Arc::as_ptr(&self.handler) as *const (),
            Arc::as_ptr(handler) as *const (),
        )
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("message_type", &self.message_type)
            .field("verify_sender", &self.verify_sender)
            .field("accept_only_encrypted", &self.accept_only_encrypted)
            .field("content_topic", &self.content_topic)
            .field("store_locally", &self.store_locally)
            .finish_non_exhaustive()
    }
}
