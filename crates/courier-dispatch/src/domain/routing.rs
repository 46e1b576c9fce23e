//! Message type to handler routing.

use crate::domain::{Registration, RegistrationId, RegistrationOptions, SharedHandler};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};

/// Registrations keyed by envelope type, one-to-many.
pub struct RoutingTable {
    default_content_topic: String,
    inner: RwLock<Routes>,
}

#[derive(Default)]
struct Routes {
    by_type: HashMap<String, Vec<Registration>>,
    next_id: u64,
}

impl RoutingTable {
    /// Registrations without an explicit topic listen on `default_content_topic`.
    pub fn new(default_content_topic: impl Into<String>) -> Self {
        Self {
            default_content_topic: default_content_topic.into(),
            inner: RwLock::new(Routes::default()),
        }
    }

    /// Bind `handler` to `message_type`.
    ///
    /// Registering the same handler allocation for the same type again is a
    /// no-op that returns the existing id.
    pub fn register(
        &self,
        message_type: &str,
        handler: SharedHandler,
        options: RegistrationOptions,
    ) -> RegistrationId {
        let mut routes = self.inner.write();

        if let Some(existing) = routes
            .by_type
            .get(message_type)
            .and_then(|regs| regs.iter().find(|r| r.has_handler(&handler)))
        {
            return existing.id;
        }

        routes.next_id += 1;
        let id = RegistrationId(routes.next_id);
        let registration = Registration {
            id,
            message_type: message_type.to_string(),
            handler,
            verify_sender: options.verify_sender,
            accept_only_encrypted: options.accept_only_encrypted,
            content_topic: options
                .content_topic
                .unwrap_or_else(|| self.default_content_topic.clone()),
            store_locally: options.store_locally,
        };

        tracing::debug!(
            message_type,
            registration = %id,
            content_topic = %registration.content_topic,
            "Handler registered"
        );
        routes
            .by_type
            .entry(message_type.to_string())
            .or_default()
            .push(registration);
        id
    }

    /// Remove a registration; `false` if the id is unknown.
    pub fn unregister(&self, id: RegistrationId) -> bool {
        let mut routes = self.inner.write();
        let mut removed = false;
        routes.by_type.retain(|_, regs| {
            let before = regs.len();
            regs.retain(|r| r.id != id);
            removed |= regs.len() != before;
            !regs.is_empty()
        });
        removed
    }

    /// Registrations for `message_type`, in registration order.
    pub fn lookup(&self, message_type: &str) -> Vec<Registration> {
        self.inner
            .read()
            .by_type
            .get(message_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether any handler receives `message_type`.
    pub fn is_registered(&self, message_type: &str) -> bool {
        self.inner.read().by_type.contains_key(message_type)
    }

    /// Every content topic some registration listens on, plus the default.
    pub fn content_topics(&self) -> BTreeSet<String> {
        let routes = self.inner.read();
        let mut topics: BTreeSet<String> = routes
            .by_type
            .values()
            .flatten()
            .map(|r| r.content_topic.clone())
            .collect();
        topics.insert(self.default_content_topic.clone());
        topics
    }

    /// Total registrations.
    pub fn len(&self) -> usize {
        self.inner.read().by_type.values().map(Vec::len).sum()
    }

    /// Whether there are no registrations.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every registration.
    pub fn clear(&self) {
        self.inner.write().by_type.clear();
    }
}
