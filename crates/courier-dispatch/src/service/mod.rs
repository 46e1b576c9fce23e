//! # Service Layer
//!
//! The dispatch pipeline and the machinery around it: envelope codec,
//! reconciliation, retry queue, subscription health and the
//! [`Dispatcher`] facade that ties them together.

pub mod codec;
pub mod dispatcher;
pub mod pipeline;
pub mod reconciliation;
pub mod retry;
pub mod subscription;

pub use codec::{DecodedEnvelope, EncodedEnvelope, MessageCodec};
pub use dispatcher::{Dispatcher, DispatcherDeps, EmitOptions};
pub use pipeline::DispatchCore;
pub use reconciliation::{sort_for_replay, LocalReplay, NetworkBackfill, ReconciliationEngine};
pub use retry::{DrainReport, RetryCache, RetryEntry};
pub use subscription::{SubscriptionManager, SubscriptionState};
