//! # Dispatcher
//!
//! Public entry point. Owns the dispatch pipeline and drives its
//! lifecycle against a [`Transport`] and a [`LocalStore`].
//!
//! ## Startup
//!
//! 1. Wait for the transport (filter, light push, store) and the local store.
//! 2. Open the live subscription. Deliveries buffer until step 4.
//! 3. Replay the local store.
//! 4. Start pumping live deliveries into the pipeline.
//! 5. Backfill from the network since the newest locally stored timestamp.
//! 6. Start heartbeat, disconnect watcher, periodic reconciliation and,
//!    if enabled, the retry drain.

use crate::adapters::{LocalStoreAdapter, RecoverySigner, Secp256k1Cipher};
use crate::config::DispatcherConfig;
use crate::domain::{
    now_ms, DecryptionKey, Direction, DispatchOutcome, DuplicateFilter, EncryptionMode,
    RegistrationId, RegistrationOptions, RoutingTable, SharedHandler, StoredMessage,
    TransportMessage,
};
use crate::errors::DispatchError;
use crate::ports::{Cipher, Identity, LocalStore, Protocol, SignerRecovery, Transport};
use crate::service::codec::MessageCodec;
use crate::service::pipeline::DispatchCore;
use crate::service::reconciliation::{LocalReplay, NetworkBackfill, ReconciliationEngine};
use crate::service::retry::{DrainReport, RetryCache};
use crate::service::subscription::{SubscriptionManager, SubscriptionState};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Collaborators injected into a [`Dispatcher`].
pub struct DispatcherDeps {
    /// Network transport
    pub transport: Arc<dyn Transport>,
    /// Local message store
    pub store: Arc<dyn LocalStore>,
    /// Envelope encryption
    pub cipher: Arc<dyn Cipher>,
    /// Signature recovery
    pub recovery: Arc<dyn SignerRecovery>,
}

impl DispatcherDeps {
    /// Transport and store with the secp256k1 crypto providers.
    pub fn new(transport: Arc<dyn Transport>, store: Arc<dyn LocalStore>) -> Self {
        Self {
            transport,
            store,
            cipher: Arc::new(Secp256k1Cipher),
            recovery: Arc::new(RecoverySigner),
        }
    }

    /// Replace the cipher.
    pub fn with_cipher(mut self, cipher: Arc<dyn Cipher>) -> Self {
        self.cipher = cipher;
        self
    }

    /// Replace the signature recovery.
    pub fn with_recovery(mut self, recovery: Arc<dyn SignerRecovery>) -> Self {
        self.recovery = recovery;
        self
    }
}

/// Per-call options for [`Dispatcher::emit`].
///
/// The default encrypts with [`EncryptionMode::ImplicitDefault`]: the key
/// registered with `auto_encrypt` when there is one, plaintext otherwise.
#[derive(Clone)]
pub struct EmitOptions {
    /// Sign the envelope with this identity
    pub identity: Option<Arc<dyn Identity>>,
    /// Encryption to apply; use [`EncryptionMode::None`] to force plaintext
    pub encryption: EncryptionMode,
    /// Not kept by history nodes or the local store
    pub ephemeral: bool,
    /// Overrides the configured content topic
    pub content_topic: Option<String>,
}

impl Default for EmitOptions {
    fn default() -> Self {
        Self {
            identity: None,
            encryption: EncryptionMode::ImplicitDefault,
            ephemeral: false,
            content_topic: None,
        }
    }
}

impl EmitOptions {
    /// Sign with `identity`.
    pub fn signed_by(mut self, identity: Arc<dyn Identity>) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Encrypt per `mode`.
    pub fn encrypted(mut self, mode: EncryptionMode) -> Self {
        self.encryption = mode;
        self
    }

    /// Mark ephemeral.
    pub fn ephemeral(mut self) -> Self {
        self.ephemeral = true;
        self
    }

    /// Publish on `content_topic`.
    pub fn on_topic(mut self, content_topic: impl Into<String>) -> Self {
        self.content_topic = Some(content_topic.into());
        self
    }
}

struct Running {
    subscription: Arc<SubscriptionManager>,
    tasks: Vec<JoinHandle<()>>,
}

impl Running {
    async fn shutdown(self) {
        self.abort_tasks();
        self.subscription.close().await;
    }

    /// Tear down a start that lost to a stop. The shared state is left alone
    /// since a newer start may already own it.
    async fn discard(self) {
        self.abort_tasks();
        self.subscription.release().await;
    }

    fn abort_tasks(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Start/stop slot. `Starting` is claimed under the lock so that concurrent
/// starts collapse into one and a stop can cancel a start in flight.
enum Lifecycle {
    Stopped,
    Starting {
        generation: u64,
        subscription: Option<Arc<SubscriptionManager>>,
    },
    Running(Running),
}

/// Typed message dispatcher over a pub/sub transport.
pub struct Dispatcher {
    config: DispatcherConfig,
    transport: Arc<dyn Transport>,
    core: Arc<DispatchCore>,
    reconciler: Arc<ReconciliationEngine>,
    retry: Arc<RetryCache>,
    state: Arc<watch::Sender<SubscriptionState>>,
    lifecycle: Mutex<Lifecycle>,
    generation: AtomicU64,
}

impl Dispatcher {
    /// Validate `config` and assemble the dispatcher. Nothing touches the
    /// network until [`start`](Self::start).
    pub fn new(config: DispatcherConfig, deps: DispatcherDeps) -> Result<Self, DispatchError> {
        config.validate()?;

        let store = Arc::new(LocalStoreAdapter::new(deps.store));
        let core = Arc::new(DispatchCore::new(
            config.pubsub_topic.clone(),
            DuplicateFilter::from_config(&config.duplicate_cache),
            RoutingTable::new(config.content_topic.clone()),
            MessageCodec::new(deps.cipher, deps.recovery),
            store.clone(),
        ));
        let reconciler = Arc::new(ReconciliationEngine::new(
            deps.transport.clone(),
            store,
            core.clone(),
            config.reconciliation,
        ));
        let retry = Arc::new(RetryCache::new(config.retry.send_spacing));
        let (state, _) = watch::channel(SubscriptionState::Disconnected);

        Ok(Self {
            config,
            transport: deps.transport,
            core,
            reconciler,
            retry,
            state: Arc::new(state),
            lifecycle: Mutex::new(Lifecycle::Stopped),
            generation: AtomicU64::new(0),
        })
    }

    /// Bring the dispatcher online.
    ///
    /// Only readiness failures are returned. A failed subscribe falls into
    /// the resubscription loop and failed backfills are logged. A call made
    /// while another start is in flight, or after one completed, returns
    /// `Ok` without doing anything.
    pub async fn start(&self) -> Result<(), DispatchError> {
        let generation = {
            let mut lifecycle = self.lifecycle.lock();
            if !matches!(*lifecycle, Lifecycle::Stopped) {
                debug!("Dispatcher already started");
                return Ok(());
            }
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            *lifecycle = Lifecycle::Starting {
                generation,
                subscription: None,
            };
            generation
        };
        info!(
            content_topic = %self.config.content_topic,
            pubsub_topic = %self.config.pubsub_topic,
            generation,
            "Starting dispatcher"
        );

        match self.bring_up(generation).await {
            Ok(Some(running)) => {
                self.publish_running(generation, running).await;
                Ok(())
            }
            Ok(None) => {
                info!(generation, "Start superseded by stop");
                Ok(())
            }
            Err(e) => {
                self.abandon_start(generation);
                Err(e)
            }
        }
    }

    /// Runs the startup sequence for `generation`. Returns `None` once a
    /// [`stop`](Self::stop) superseded it; partial work is torn down then.
    async fn bring_up(&self, generation: u64) -> Result<Option<Running>, DispatchError> {
        self.transport
            .wait_ready(&[Protocol::Filter, Protocol::LightPush, Protocol::Store])
            .await?;
        self.core.store.ready().await?;
        if !self.is_current(generation) {
            return Ok(None);
        }

        let (sink, inbox) = mpsc::unbounded_channel();
        let subscription = Arc::new(SubscriptionManager::new(
            self.transport.clone(),
            self.core.clone(),
            self.reconciler.clone(),
            self.config.subscription,
            self.config.pubsub_topic.clone(),
            sink,
            self.state.clone(),
        ));
        if !self.attach_subscription(generation, &subscription) {
            return Ok(None);
        }
        if let Err(e) = subscription.open().await {
            warn!(error = %e, "Live subscription unavailable, retrying in background");
        }

        let replay = match self.reconciler.backfill_from_local().await {
            Ok(replay) => replay,
            Err(e) => {
                warn!(error = %e, "Local replay failed");
                LocalReplay::default()
            }
        };

        let mut running = Running {
            subscription,
            tasks: vec![spawn_pump(self.core.clone(), inbox)],
        };

        if let Err(e) = self.reconciler.backfill_from_network(replay.max_timestamp).await {
            warn!(error = %e, "Startup network backfill failed");
        }
        if !self.is_current(generation) {
            running.discard().await;
            return Ok(None);
        }

        running.tasks.push(running.subscription.spawn_heartbeat());
        running.tasks.push(running.subscription.spawn_disconnect_watcher());
        if let Some(period) = self.config.reconciliation.interval {
            running
                .tasks
                .push(spawn_periodic_reconcile(self.reconciler.clone(), period));
        }
        if self.config.retry.enabled {
            running.tasks.push(spawn_retry_drain(
                self.retry.clone(),
                self.transport.clone(),
                self.core.store.clone(),
                self.config.store_outbound,
                self.config.retry.drain_interval,
            ));
        }

        info!(
            replayed = replay.replayed,
            handlers = self.core.routing.len(),
            "Dispatcher started"
        );
        Ok(Some(running))
    }

    fn is_current(&self, generation: u64) -> bool {
        matches!(
            *self.lifecycle.lock(),
            Lifecycle::Starting { generation: g, .. } if g == generation
        )
    }

    /// Record the in-flight subscription so a concurrent stop can close it.
    fn attach_subscription(&self, generation: u64, subscription: &Arc<SubscriptionManager>) -> bool {
        match &mut *self.lifecycle.lock() {
            Lifecycle::Starting {
                generation: g,
                subscription: slot,
            } if *g == generation => {
                *slot = Some(subscription.clone());
                true
            }
            _ => false,
        }
    }

    async fn publish_running(&self, generation: u64, running: Running) {
        let superseded = {
            let mut lifecycle = self.lifecycle.lock();
            if matches!(*lifecycle, Lifecycle::Starting { generation: g, .. } if g == generation) {
                *lifecycle = Lifecycle::Running(running);
                None
            } else {
                Some(running)
            }
        };
        if let Some(running) = superseded {
            info!(generation, "Start superseded by stop, discarding");
            running.discard().await;
        }
    }

    fn abandon_start(&self, generation: u64) {
        let mut lifecycle = self.lifecycle.lock();
        if matches!(*lifecycle, Lifecycle::Starting { generation: g, .. } if g == generation) {
            *lifecycle = Lifecycle::Stopped;
        }
    }

    /// Stop background work, drop the subscription, and clear the duplicate
    /// cache, registrations and keys. Safe to call repeatedly, before
    /// [`start`](Self::start), or while a start is still in flight; the
    /// interrupted start then returns without going live.
    pub async fn stop(&self) {
        let previous = std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Stopped);
        match previous {
            Lifecycle::Running(running) => running.shutdown().await,
            Lifecycle::Starting {
                subscription: Some(subscription),
                ..
            } => subscription.close().await,
            Lifecycle::Starting { .. } | Lifecycle::Stopped => {}
        }
        self.state.send_replace(SubscriptionState::Disconnected);

        self.core.dedup.reset();
        self.core.routing.clear();
        self.core.codec.clear_keys();
        info!("Dispatcher stopped");
    }

    /// Whether [`start`](Self::start) completed and [`stop`](Self::stop) has not run since.
    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock(), Lifecycle::Running(_))
    }

    /// Bind `handler` to `message_type`.
    pub fn register(
        &self,
        message_type: &str,
        handler: SharedHandler,
        options: RegistrationOptions,
    ) -> RegistrationId {
        let topics_before = self.core.routing.content_topics().len();
        let id = self.core.routing.register(message_type, handler, options);
        if self.core.routing.content_topics().len() != topics_before {
            self.refresh_subscription();
        }
        id
    }

    /// Bind `handler` to `message_type` with default options.
    pub fn on(&self, message_type: &str, handler: SharedHandler) -> RegistrationId {
        self.register(message_type, handler, RegistrationOptions::default())
    }

    /// Remove a registration.
    pub fn unregister(&self, id: RegistrationId) -> bool {
        self.core.routing.unregister(id)
    }

    /// Whether any handler is bound to `message_type`.
    pub fn is_registered(&self, message_type: &str) -> bool {
        self.core.routing.is_registered(message_type)
    }

    /// Add a decryption key; see [`MessageCodec::register_key`].
    pub fn register_key(&self, key: DecryptionKey, auto_encrypt: bool) -> Result<(), DispatchError> {
        self.core.codec.register_key(key, auto_encrypt)?;
        Ok(())
    }

    /// Encode and publish one message.
    ///
    /// Returns whether the transport accepted it. A rejected publish is
    /// queued for retry when retry is enabled.
    pub async fn emit(
        &self,
        message_type: &str,
        payload: Value,
        options: EmitOptions,
    ) -> Result<bool, DispatchError> {
        let encoded = self.core.codec.encode(
            message_type,
            payload,
            options.identity.as_deref(),
            &options.encryption,
        )?;

        let message = TransportMessage {
            content_topic: options
                .content_topic
                .unwrap_or_else(|| self.config.content_topic.clone()),
            pubsub_topic: self.config.pubsub_topic.clone(),
            payload: encoded.bytes,
            timestamp: Some(encoded.envelope.timestamp.unwrap_or_else(now_ms)),
            ephemeral: options.ephemeral,
        };

        let delivered = match self.transport.publish(&message).await {
            Ok(outcome) => outcome.delivered,
            Err(e) => {
                warn!(message_type, error = %e, "Publish failed");
                false
            }
        };

        if delivered {
            debug!(message_type, hash = %message.hash(), encrypted = encoded.encrypted, "Message published");
            if self.config.store_outbound && !message.ephemeral {
                if let Err(e) = self.core.store.persist(message, Direction::Out).await {
                    warn!(message_type, error = %e, "Outbound message not stored");
                }
            }
        } else if self.config.retry.enabled {
            warn!(message_type, "Publish not delivered, queued for retry");
            self.retry.enqueue(message);
        } else {
            warn!(message_type, "Publish not delivered");
        }
        Ok(delivered)
    }

    /// Hand one transport message to the pipeline directly.
    pub async fn dispatch(&self, message: TransportMessage, from_replay: bool) -> DispatchOutcome {
        self.core.dispatch(message, from_replay).await
    }

    /// Current subscription state.
    pub fn subscription_state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Follow subscription state changes across restarts.
    pub fn watch_subscription_state(&self) -> watch::Receiver<SubscriptionState> {
        self.state.subscribe()
    }

    /// Subscription objects created since the last start.
    pub fn subscriptions_created(&self) -> usize {
        match &*self.lifecycle.lock() {
            Lifecycle::Running(running) => running.subscription.subscriptions_created(),
            _ => 0,
        }
    }

    /// Locally stored messages in one direction.
    pub async fn local_messages(&self, direction: Direction) -> Result<Vec<StoredMessage>, DispatchError> {
        Ok(self.core.store.by_direction(direction).await?)
    }

    /// Locally stored messages on one content topic.
    pub async fn local_messages_for_topic(
        &self,
        content_topic: &str,
    ) -> Result<Vec<StoredMessage>, DispatchError> {
        Ok(self.core.store.by_content_topic(content_topic).await?)
    }

    /// Delete stored messages in one direction.
    pub async fn delete_local_by_direction(&self, direction: Direction) -> Result<usize, DispatchError> {
        Ok(self.core.store.delete_by_direction(direction).await?)
    }

    /// Delete stored messages on one content topic.
    pub async fn delete_local_by_content_topic(&self, content_topic: &str) -> Result<usize, DispatchError> {
        Ok(self.core.store.delete_by_content_topic(content_topic).await?)
    }

    /// Forget every seen delivery hash.
    pub fn clear_duplicate_cache(&self) {
        self.core.dedup.reset();
    }

    /// Hashes currently held by the duplicate filter.
    pub fn duplicate_cache_len(&self) -> usize {
        self.core.dedup.len()
    }

    /// Publishes waiting for retry.
    pub fn retry_len(&self) -> usize {
        self.retry.len()
    }

    /// Drop every queued retry.
    pub fn clear_retry_cache(&self) {
        self.retry.clear();
    }

    /// Run one retry drain now.
    pub async fn drain_retry_cache(&self) -> DrainReport {
        drain_and_store(
            &self.retry,
            self.transport.as_ref(),
            &self.core.store,
            self.config.store_outbound,
        )
        .await
    }

    /// Backfill from the network since the last query.
    pub async fn reconcile_now(&self) -> Result<NetworkBackfill, DispatchError> {
        Ok(self.reconciler.reconcile_since_last_query().await?)
    }

    /// Configured default content topic.
    pub fn content_topic(&self) -> &str {
        &self.config.content_topic
    }

    /// Configured pubsub topic.
    pub fn pubsub_topic(&self) -> &str {
        &self.config.pubsub_topic
    }

    fn refresh_subscription(&self) {
        let subscription = match &*self.lifecycle.lock() {
            Lifecycle::Running(running) => Some(running.subscription.clone()),
            Lifecycle::Starting { subscription, .. } => subscription.clone(),
            Lifecycle::Stopped => None,
        };
        let (Some(subscription), Ok(runtime)) = (subscription, tokio::runtime::Handle::try_current())
        else {
            return;
        };
        runtime.spawn(async move {
            if let Err(e) = subscription.refresh().await {
                warn!(error = %e, "Subscription refresh failed");
            }
        });
    }
}

fn spawn_pump(
    core: Arc<DispatchCore>,
    mut inbox: mpsc::UnboundedReceiver<TransportMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = inbox.recv().await {
            core.dispatch(message, false).await;
        }
        debug!("Live delivery channel closed");
    })
}

fn spawn_periodic_reconcile(reconciler: Arc<ReconciliationEngine>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = reconciler.reconcile_since_last_query().await {
                warn!(error = %e, "Periodic reconciliation failed");
            }
        }
    })
}

fn spawn_retry_drain(
    retry: Arc<RetryCache>,
    transport: Arc<dyn Transport>,
    store: Arc<LocalStoreAdapter>,
    store_outbound: bool,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if !retry.is_empty() {
                drain_and_store(&retry, transport.as_ref(), &store, store_outbound).await;
            }
        }
    })
}

async fn drain_and_store(
    retry: &RetryCache,
    transport: &dyn Transport,
    store: &LocalStoreAdapter,
    store_outbound: bool,
) -> DrainReport {
    let report = retry.drain(transport).await;
    if store_outbound {
        for message in report.sent.iter().filter(|m| !m.ephemeral) {
            if let Err(e) = store.persist(message.clone(), Direction::Out).await {
                warn!(hash = %message.hash(), error = %e, "Resent message not stored");
            }
        }
    }
    report
}
