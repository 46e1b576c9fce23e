//! # Subscription Manager
//!
//! Keeps one live filter subscription healthy.
//!
//! ```text
//! Disconnected --open--> Subscribing --ok--> Connected
//!                             |                  |
//!                           error        ping failure / peer lost
//!                             v                  v
//!                        Resubscribing <---------+
//!                             |
//!                             +--ok--> Connected (then reconcile the gap)
//! ```
//!
//! Each resubscription attempt `n` waits `min(n * base_backoff, max_backoff)`.
//! Once consecutive failures reach `max_attempts` the subscription object
//! is torn down and a new one is created before the next attempt.

use crate::config::SubscriptionConfig;
use crate::errors::TransportError;
use crate::ports::{FilterSubscription, MessageIngress, MessageSink, Transport};
use crate::service::reconciliation::ReconciliationEngine;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Health of the live subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Not subscribed
    Disconnected,
    /// Initial subscribe in flight
    Subscribing,
    /// Receiving live deliveries
    Connected,
    /// Recovering from a lost subscription
    Resubscribing,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Subscribing => "subscribing",
            Self::Connected => "connected",
            Self::Resubscribing => "resubscribing",
        };
        f.write_str(name)
    }
}

/// Owns the subscription object, its heartbeat and its recovery loop.
pub struct SubscriptionManager {
    transport: Arc<dyn Transport>,
    ingress: Arc<dyn MessageIngress>,
    reconciler: Arc<ReconciliationEngine>,
    config: SubscriptionConfig,
    pubsub_topic: String,
    sink: MessageSink,
    current: Mutex<Option<Arc<dyn FilterSubscription>>>,
    state: Arc<watch::Sender<SubscriptionState>>,
    resubscribing: AtomicBool,
    consecutive_failures: AtomicU32,
    subscriptions_created: AtomicUsize,
    resubscribe_task: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionManager {
    /// Create a manager delivering into `sink` and publishing its state on `state`.
    pub fn new(
        transport: Arc<dyn Transport>,
        ingress: Arc<dyn MessageIngress>,
        reconciler: Arc<ReconciliationEngine>,
        config: SubscriptionConfig,
        pubsub_topic: impl Into<String>,
        sink: MessageSink,
        state: Arc<watch::Sender<SubscriptionState>>,
    ) -> Self {
        Self {
            transport,
            ingress,
            reconciler,
            config,
            pubsub_topic: pubsub_topic.into(),
            sink,
            current: Mutex::new(None),
            state,
            resubscribing: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            subscriptions_created: AtomicUsize::new(0),
            resubscribe_task: Mutex::new(None),
        }
    }

    /// Current state.
    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Subscription objects created by this manager.
    pub fn subscriptions_created(&self) -> usize {
        self.subscriptions_created.load(Ordering::SeqCst)
    }

    /// Failures since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Whether a resubscription loop is running.
    pub fn is_resubscribing(&self) -> bool {
        self.resubscribing.load(Ordering::Acquire)
    }

    /// Create the subscription and subscribe. A failure is returned for
    /// logging, and the resubscription loop takes over.
    pub async fn open(self: &Arc<Self>) -> Result<(), TransportError> {
        self.set_state(SubscriptionState::Subscribing);

        match self.subscribe_current().await {
            Ok(()) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                self.set_state(SubscriptionState::Connected);
                Ok(())
            }
            Err(e) => {
                self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
                warn!(error = %e, "Initial subscribe failed");
                self.start_resubscription();
                Err(e)
            }
        }
    }

    /// Re-send the current decoder set on the live subscription, e.g. after
    /// a registration added a content topic.
    pub async fn refresh(&self) -> Result<(), TransportError> {
        if self.state() != SubscriptionState::Connected {
            return Ok(());
        }
        let current = self.current.lock().clone();
        match current {
            Some(subscription) => {
                subscription
                    .subscribe(&self.ingress.decoders(), self.sink.clone())
                    .await
            }
            None => Ok(()),
        }
    }

    /// Ping the live subscription. A failure counts towards recreation and
    /// starts resubscription.
    pub async fn heartbeat(self: &Arc<Self>) -> Result<(), TransportError> {
        if self.state() != SubscriptionState::Connected {
            return Ok(());
        }
        let current = self.current.lock().clone();
        let Some(subscription) = current else {
            return Ok(());
        };

        match subscription.ping().await {
            Ok(()) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Subscription heartbeat failed");
                self.connection_lost("heartbeat");
                Err(e)
            }
        }
    }

    /// Handle a lost connection. Only a `Connected` subscription reacts;
    /// anything else is already recovering or shut down.
    pub fn connection_lost(self: &Arc<Self>, reason: &str) -> bool {
        if self.state() != SubscriptionState::Connected || self.is_resubscribing() {
            debug!(reason, state = %self.state(), "Connection loss ignored");
            return false;
        }
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
        self.start_resubscription()
    }

    /// Spawn the resubscription loop unless one is already running.
    pub fn start_resubscription(self: &Arc<Self>) -> bool {
        if self
            .resubscribing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Resubscription already in progress");
            return false;
        }
        self.set_state(SubscriptionState::Resubscribing);

        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            manager.resubscribe_loop().await;
            // A loss during the backfill must start a fresh recovery.
            manager.resubscribing.store(false, Ordering::Release);
            manager.backfill_outage().await;
        });
        if let Some(stale) = self.resubscribe_task.lock().replace(handle) {
            stale.abort();
        }
        true
    }

    async fn resubscribe_loop(&self) {
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            let delay = self.config.backoff_for(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "Resubscribing after backoff");
            tokio::time::sleep(delay).await;

            let failures = self.consecutive_failures();
            if failures >= self.config.max_attempts {
                info!(failures, "Recreating subscription");
                self.teardown().await;
                self.consecutive_failures.store(0, Ordering::SeqCst);
            }

            match self.subscribe_current().await {
                Ok(()) => {
                    self.consecutive_failures.store(0, Ordering::SeqCst);
                    self.set_state(SubscriptionState::Connected);
                    info!(attempt, "Resubscribed");
                    break;
                }
                Err(e) => {
                    let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    warn!(attempt, failures, error = %e, "Resubscribe attempt failed");
                }
            }
        }
    }

    async fn backfill_outage(&self) {
        match self.reconciler.reconcile_since_last_query().await {
            Ok(backfill) => debug!(messages = backfill.messages, "Post-resubscribe backfill done"),
            Err(e) => warn!(error = %e, "Post-resubscribe backfill failed"),
        }
    }

    /// Subscribe on the current object, creating one if there is none.
    async fn subscribe_current(&self) -> Result<(), TransportError> {
        let existing = self.current.lock().clone();
        let subscription = match existing {
            Some(subscription) => subscription,
            None => {
                let created = self.transport.create_subscription(&self.pubsub_topic).await?;
                let count = self.subscriptions_created.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(count, pubsub_topic = %self.pubsub_topic, "Subscription object created");
                *self.current.lock() = Some(created.clone());
                created
            }
        };
        subscription
            .subscribe(&self.ingress.decoders(), self.sink.clone())
            .await
    }

    async fn teardown(&self) {
        let current = self.current.lock().take();
        if let Some(subscription) = current {
            if let Err(e) = subscription.unsubscribe_all().await {
                debug!(error = %e, "Unsubscribe during teardown failed");
            }
        }
    }

    /// Stop recovery, drop the subscription, and report `Disconnected`.
    pub async fn close(&self) {
        self.release().await;
        self.set_state(SubscriptionState::Disconnected);
    }

    /// [`close`](Self::close) without touching the shared state, for a
    /// manager that was superseded before it went live.
    pub async fn release(&self) {
        if let Some(task) = self.resubscribe_task.lock().take() {
            task.abort();
        }
        self.resubscribing.store(false, Ordering::Release);
        self.teardown().await;
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    /// Ping every `heartbeat_interval`.
    pub fn spawn_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let _ = manager.heartbeat().await;
            }
        })
    }

    /// Treat every transport peer-disconnect notification as a lost connection.
    pub fn spawn_disconnect_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut events = self.transport.peer_disconnects();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        info!(peer = %event.peer_id, "Peer disconnected");
                        manager.connection_lost("peer disconnected");
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Disconnect notifications lagged");
                        manager.connection_lost("peer disconnected");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn set_state(&self, next: SubscriptionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = %previous, state = %next, "Subscription state changed");
        }
    }
}
