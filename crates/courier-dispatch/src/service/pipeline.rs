//! # Dispatch Pipeline
//!
//! One inbound message: duplicate check, decode, route, filter per
//! registration, persist, invoke.

use crate::adapters::LocalStoreAdapter;
use crate::domain::{
    Direction, DispatchMetadata, DispatchOutcome, DuplicateFilter, Registration, RoutingTable,
    TransportMessage,
};
use crate::ports::{ContentDecoder, MessageIngress};
use crate::service::codec::{DecodedEnvelope, MessageCodec};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Shared state consulted for every delivery.
pub struct DispatchCore {
    pub(crate) pubsub_topic: String,
    pub(crate) dedup: DuplicateFilter,
    pub(crate) routing: RoutingTable,
    pub(crate) codec: MessageCodec,
    pub(crate) store: Arc<LocalStoreAdapter>,
}

impl DispatchCore {
    /// Assemble the pipeline.
    pub fn new(
        pubsub_topic: impl Into<String>,
        dedup: DuplicateFilter,
        routing: RoutingTable,
        codec: MessageCodec,
        store: Arc<LocalStoreAdapter>,
    ) -> Self {
        Self {
            pubsub_topic: pubsub_topic.into(),
            dedup,
            routing,
            codec,
            store,
        }
    }

    /// Run one message through the pipeline.
    pub async fn dispatch(&self, message: TransportMessage, from_replay: bool) -> DispatchOutcome {
        let hash = message.hash();
        if !self.dedup.admit(hash) {
            trace!(hash = %hash, from_replay, "Duplicate delivery dropped");
            return DispatchOutcome::Duplicate;
        }

        let decoded = match self.codec.decode(&message.payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!(
                    hash = %hash,
                    content_topic = %message.content_topic,
                    error = %e,
                    "Undecodable message dropped"
                );
                return DispatchOutcome::Undecodable;
            }
        };

        let message_type = decoded.envelope.message_type.clone();
        let registrations = self.routing.lookup(&message_type);
        if registrations.is_empty() {
            debug!(hash = %hash, message_type = %message_type, "No handler for message type");
            return DispatchOutcome::UnknownType;
        }

        // Verified lazily, at most once per message.
        let mut verified: Option<bool> = None;
        let mut persisted = false;
        let mut handlers = 0;

        for registration in registrations {
            if !self.accepts(&registration, &message, &decoded, &mut verified) {
                continue;
            }

            if registration.store_locally && !from_replay && !message.ephemeral && !persisted {
                // A store failure loses durability, not the delivery.
                if self
                    .store
                    .persist(message.clone(), Direction::In)
                    .await
                    .is_ok()
                {
                    persisted = true;
                }
            }

            let metadata = DispatchMetadata {
                encrypted: decoded.was_encrypted,
                from_replay,
                timestamp: decoded.envelope.timestamp.or(message.timestamp),
                ephemeral: message.ephemeral,
                content_topic: message.content_topic.clone(),
            };
            registration
                .handler
                .handle(
                    decoded.envelope.payload.clone(),
                    decoded.envelope.signer.clone(),
                    metadata,
                )
                .await;
            handlers += 1;
        }

        trace!(hash = %hash, message_type = %message_type, handlers, from_replay, "Message dispatched");
        DispatchOutcome::Delivered { handlers }
    }

    fn accepts(
        &self,
        registration: &Registration,
        message: &TransportMessage,
        decoded: &DecodedEnvelope,
        verified: &mut Option<bool>,
    ) -> bool {
        if registration.accept_only_encrypted && !decoded.was_encrypted {
            debug!(
                registration = %registration.id,
                message_type = %registration.message_type,
                "Plaintext message skipped for encrypted-only registration"
            );
            return false;
        }

        if registration.content_topic != message.content_topic {
            trace!(
                registration = %registration.id,
                expected = %registration.content_topic,
                content_topic = %message.content_topic,
                "Content topic mismatch"
            );
            return false;
        }

        if registration.verify_sender {
            let ok = *verified.get_or_insert_with(|| self.codec.verify(&decoded.envelope));
            if !ok {
                warn!(
                    registration = %registration.id,
                    message_type = %registration.message_type,
                    signer = ?decoded.envelope.signer,
                    "Sender verification failed"
                );
                return false;
            }
        }

        true
    }

    /// Decoders for every routed content topic on the pubsub topic.
    pub fn decoders(&self) -> Vec<ContentDecoder> {
        self.routing
            .content_topics()
            .into_iter()
            .map(|topic| ContentDecoder::new(topic, self.pubsub_topic.clone()))
            .collect()
    }
}

#[async_trait]
impl MessageIngress for DispatchCore {
    async fn dispatch(&self, message: TransportMessage, from_replay: bool) -> DispatchOutcome {
        DispatchCore::dispatch(self, message, from_replay).await
    }

    fn decoders(&self) -> Vec<ContentDecoder> {
        DispatchCore::decoders(self)
    }

    /// The envelope's own timestamp, as handlers see it in
    /// [`DispatchMetadata`]; the transport's when the bytes do not decode
    /// or carry none.
    fn replay_timestamp(&self, message: &TransportMessage) -> Option<u64> {
        self.codec
            .decode(&message.payload)
            .ok()
            .and_then(|decoded| decoded.envelope.timestamp)
            .or(message.timestamp)
    }
}
