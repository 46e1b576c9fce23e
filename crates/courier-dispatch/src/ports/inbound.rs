//! # Inbound Ports
//!
//! The entry point deliveries are pushed through. Implemented by the
//! dispatch pipeline; consumed by the subscription pump and the
//! reconciliation engine.

use crate::domain::{DispatchOutcome, TransportMessage};
use crate::ports::outbound::ContentDecoder;
use async_trait::async_trait;

/// Accepts transport messages for dispatch.
#[async_trait]
pub trait MessageIngress: Send + Sync {
    /// Run one message through the pipeline. Never fails; the outcome is
    /// informational.
    async fn dispatch(&self, message: TransportMessage, from_replay: bool) -> DispatchOutcome;

    /// Decoders covering every content topic currently routed.
    fn decoders(&self) -> Vec<ContentDecoder>;

    /// Timestamp that orders `message` during local replay.
    fn replay_timestamp(&self, message: &TransportMessage) -> Option<u64> {
        message.timestamp
    }
}
