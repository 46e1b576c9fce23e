//! # Dispatcher Flow Tests
//!
//! End-to-end flows through the public API, with dispatchers sharing one
//! in-memory network:
//!
//! 1. Live delivery, dedup and local persistence
//! 2. Startup replay from the local store and the history service
//! 3. Encryption, signing and sender verification across nodes
//! 4. Subscription recovery thresholds
//! 5. Retry of undelivered publishes

use std::sync::Arc;
use std::time::Duration;

use courier_dispatch::{
    handler_fn, DecryptionKey, Direction, DispatchMetadata, DispatchOutcome, Dispatcher,
    DispatcherConfig, DispatcherDeps, EmitOptions, EncryptionKey, EncryptionMode, Envelope,
    InMemoryStore, InMemoryTransport, LocalIdentity, RegistrationOptions, SharedHandler,
    StoredMessage, SubscriptionState, TransportMessage, DEFAULT_CONTENT_TOPIC,
    DEFAULT_PUBSUB_TOPIC,
};
use courier_telemetry::{init_logging, TelemetryConfig};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

type Delivery = (Value, Option<String>, DispatchMetadata);

fn init() {
    let _ = init_logging(&TelemetryConfig::for_tests());
}

fn recorder() -> (SharedHandler, mpsc::UnboundedReceiver<Delivery>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = handler_fn(move |payload, signer, metadata| {
        let tx = tx.clone();
        async move {
            let _ = tx.send((payload, signer, metadata));
        }
    });
    (handler, rx)
}

fn node(
    transport: &InMemoryTransport,
    store: Arc<InMemoryStore>,
    config: DispatcherConfig,
) -> Dispatcher {
    Dispatcher::new(config, DispatcherDeps::new(Arc::new(transport.clone()), store))
        .expect("valid config")
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Delivery>) -> Delivery {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("delivery within timeout")
        .expect("handler alive")
}

async fn nothing_more(rx: &mut mpsc::UnboundedReceiver<Delivery>) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err(), "unexpected extra delivery");
}

fn raw_envelope(message_type: &str, payload: Value, timestamp: u64) -> TransportMessage {
    let envelope = Envelope {
        timestamp: Some(timestamp),
        ..Envelope::new(message_type, payload)
    };
    let bytes = serde_json::to_vec(&envelope).expect("serializable");
    TransportMessage::new(DEFAULT_CONTENT_TOPIC, DEFAULT_PUBSUB_TOPIC, bytes).with_timestamp(timestamp)
}

// =============================================================================
// Live delivery and dedup
// =============================================================================

#[tokio::test]
async fn test_same_bytes_dispatched_twice_invoke_handler_once() {
    init();
    let transport = InMemoryTransport::new();
    let store = Arc::new(InMemoryStore::new());
    let dispatcher = node(&transport, store.clone(), DispatcherConfig::default());
    let (handler, mut rx) = recorder();
    dispatcher.on("hello", handler);

    let message = raw_envelope("hello", json!({"text": "hi"}), 1_700_000_000_000);
    assert_eq!(
        dispatcher.dispatch(message.clone(), false).await,
        DispatchOutcome::Delivered { handlers: 1 }
    );
    assert_eq!(dispatcher.dispatch(message, false).await, DispatchOutcome::Duplicate);

    let (payload, _, metadata) = next(&mut rx).await;
    assert_eq!(payload, json!({"text": "hi"}));
    assert!(!metadata.encrypted);
    nothing_more(&mut rx).await;
    assert_eq!(store.put_calls(), 1);
}

#[tokio::test]
async fn test_hello_delivered_live_and_stored_inbound() {
    init();
    let transport = InMemoryTransport::new();
    let receiver_store = Arc::new(InMemoryStore::new());
    let receiver = node(&transport, receiver_store.clone(), DispatcherConfig::default());
    let sender = node(&transport, Arc::new(InMemoryStore::new()), DispatcherConfig::default());

    let (handler, mut rx) = recorder();
    receiver.on("hello", handler);
    receiver.start().await.expect("receiver starts");
    assert_eq!(receiver.subscription_state(), SubscriptionState::Connected);

    assert!(sender
        .emit("hello", json!("hi"), EmitOptions::default())
        .await
        .expect("emit"));

    let (payload, signer, metadata) = next(&mut rx).await;
    assert_eq!(payload, json!("hi"));
    assert_eq!(signer, None);
    assert!(!metadata.from_replay);
    assert_eq!(metadata.content_topic, DEFAULT_CONTENT_TOPIC);
    nothing_more(&mut rx).await;

    assert_eq!(receiver_store.put_calls(), 1);
    let inbound: Vec<StoredMessage> = receiver.local_messages(Direction::In).await.expect("store");
    assert_eq!(inbound.len(), 1);
    assert_eq!(inbound[0].direction, Direction::In);

    let outbound = sender.local_messages(Direction::Out).await.expect("store");
    assert_eq!(outbound.len(), 1);
    assert_eq!(outbound[0].content_hash, inbound[0].content_hash);

    receiver.stop().await;
}

#[tokio::test]
async fn test_registration_on_new_topic_while_running() {
    init();
    let transport = InMemoryTransport::new();
    let receiver = node(&transport, Arc::new(InMemoryStore::new()), DispatcherConfig::default());
    let sender = node(&transport, Arc::new(InMemoryStore::new()), DispatcherConfig::default());
    receiver.start().await.expect("start");

    let (handler, mut rx) = recorder();
    receiver.register("side", handler, RegistrationOptions::default().on_topic("/app/1/side/json"));
    tokio::time::sleep(Duration::from_millis(20)).await;

    sender
        .emit("side", json!(7), EmitOptions::default().on_topic("/app/1/side/json"))
        .await
        .expect("emit");
    let (payload, _, metadata) = next(&mut rx).await;
    assert_eq!(payload, json!(7));
    assert_eq!(metadata.content_topic, "/app/1/side/json");

    receiver.stop().await;
}

// =============================================================================
// Startup replay
// =============================================================================

#[tokio::test]
async fn test_local_replay_never_writes_back() {
    init();
    let transport = InMemoryTransport::new();
    let stored = vec![
        StoredMessage::new(raw_envelope("hello", json!(2), 2_000), Direction::In),
        StoredMessage::new(raw_envelope("hello", json!(1), 1_000), Direction::Out),
    ];
    let store = Arc::new(InMemoryStore::with_records(stored));
    let dispatcher = node(&transport, store.clone(), DispatcherConfig::default());
    let (handler, mut rx) = recorder();
    dispatcher.on("hello", handler);

    dispatcher.start().await.expect("start");

    // Oldest first, both flagged as replays.
    let (first, _, first_meta) = next(&mut rx).await;
    let (second, _, second_meta) = next(&mut rx).await;
    assert_eq!((first, second), (json!(1), json!(2)));
    assert!(first_meta.from_replay && second_meta.from_replay);
    assert_eq!(store.put_calls(), 0);

    dispatcher.stop().await;
}

#[tokio::test]
async fn test_history_backfilled_on_start_without_duplicates() {
    init();
    let transport = InMemoryTransport::new();
    let now = courier_dispatch::domain::now_ms();
    let message = raw_envelope("hello", json!("missed"), now - 1_000);
    transport.push_history(message.clone());

    let store = Arc::new(InMemoryStore::with_records(vec![StoredMessage::new(
        message,
        Direction::In,
    )]));
    let dispatcher = node(&transport, store, DispatcherConfig::default());
    let (handler, mut rx) = recorder();
    dispatcher.on("hello", handler);

    dispatcher.start().await.expect("start");

    // Present both locally and in history: delivered once.
    let (payload, _, metadata) = next(&mut rx).await;
    assert_eq!(payload, json!("missed"));
    assert!(metadata.from_replay);
    nothing_more(&mut rx).await;

    let queries = transport.queries();
    assert_eq!(queries.len(), 1);
    assert!(queries[0].start_ms <= now - 1_000);

    dispatcher.stop().await;
}

// =============================================================================
// Encryption and signing
// =============================================================================

#[tokio::test]
async fn test_emit_with_public_key_decrypts_out_of_band() {
    init();
    let transport = InMemoryTransport::new();
    let dispatcher = node(&transport, Arc::new(InMemoryStore::new()), DispatcherConfig::default());
    let keypair = courier_crypto::EciesKeyPair::generate();

    dispatcher
        .emit(
            "secret",
            json!({"n": 42}),
            EmitOptions::default()
                .encrypted(EncryptionMode::Explicit(EncryptionKey::asymmetric(keypair.public_key()))),
        )
        .await
        .expect("emit");

    let published = transport.published();
    assert_eq!(published.len(), 1);
    assert!(serde_json::from_slice::<Envelope>(&published[0].payload).is_err());

    let plaintext =
        courier_crypto::open_from(&keypair.private_key(), &published[0].payload).expect("decrypts");
    let envelope: Envelope = serde_json::from_slice(&plaintext).expect("envelope");
    assert_eq!(envelope.message_type, "secret");
    assert_eq!(envelope.payload, json!({"n": 42}));
}

#[tokio::test]
async fn test_encrypted_delivery_only_reaches_key_holder() {
    init();
    let transport = InMemoryTransport::new();
    let keypair = courier_crypto::EciesKeyPair::generate();

    let holder = node(&transport, Arc::new(InMemoryStore::new()), DispatcherConfig::default());
    holder
        .register_key(DecryptionKey::asymmetric(keypair.private_key()), false)
        .expect("key");
    let (holder_handler, mut holder_rx) = recorder();
    holder.register("secret", holder_handler, RegistrationOptions::default().encrypted_only());
    holder.start().await.expect("start");

    let outsider = node(&transport, Arc::new(InMemoryStore::new()), DispatcherConfig::default());
    outsider
        .register_key(
            DecryptionKey::asymmetric(courier_crypto::EciesKeyPair::generate().private_key()),
            false,
        )
        .expect("key");
    let (outsider_handler, mut outsider_rx) = recorder();
    outsider.on("secret", outsider_handler);
    outsider.start().await.expect("start");

    let sender = node(&transport, Arc::new(InMemoryStore::new()), DispatcherConfig::default());
    sender
        .emit(
            "secret",
            json!("for your eyes"),
            EmitOptions::default()
                .encrypted(EncryptionMode::Explicit(EncryptionKey::asymmetric(keypair.public_key()))),
        )
        .await
        .expect("emit");

    let (payload, _, metadata) = next(&mut holder_rx).await;
    assert_eq!(payload, json!("for your eyes"));
    assert!(metadata.encrypted);
    nothing_more(&mut outsider_rx).await;

    holder.stop().await;
    outsider.stop().await;
}

#[tokio::test]
async fn test_auto_encrypt_key_used_by_default_options() {
    init();
    let transport = InMemoryTransport::new();
    let key = vec![9u8; 32];

    let node_a = node(&transport, Arc::new(InMemoryStore::new()), DispatcherConfig::default());
    node_a
        .register_key(DecryptionKey::symmetric(key.clone()), true)
        .expect("key");
    let (handler, mut rx) = recorder();
    node_a.on("room", handler);
    node_a.start().await.expect("start");

    node_a
        .emit("room", json!("sealed"), EmitOptions::default())
        .await
        .expect("emit");

    let (payload, _, metadata) = next(&mut rx).await;
    assert_eq!(payload, json!("sealed"));
    assert!(metadata.encrypted);
    let sealed = courier_crypto::SecretKey::from_slice(&key).expect("key");
    assert!(courier_crypto::open(&sealed, &transport.published()[0].payload).is_ok());

    // Plaintext on request.
    node_a
        .emit(
            "room",
            json!("open"),
            EmitOptions::default().encrypted(EncryptionMode::None),
        )
        .await
        .expect("emit");
    let (payload, _, metadata) = next(&mut rx).await;
    assert_eq!(payload, json!("open"));
    assert!(!metadata.encrypted);
    assert!(serde_json::from_slice::<Value>(&transport.published()[1].payload).is_ok());

    node_a.stop().await;
}

#[tokio::test]
async fn test_verified_sender_receives_signer_address() {
    init();
    let transport = InMemoryTransport::new();
    let receiver = node(&transport, Arc::new(InMemoryStore::new()), DispatcherConfig::default());
    let (handler, mut rx) = recorder();
    receiver.register("signed", handler, RegistrationOptions::default().verify_sender());
    receiver.start().await.expect("start");

    let identity = Arc::new(LocalIdentity::generate());
    let address = courier_dispatch::ports::Identity::address(identity.as_ref());
    let sender = node(&transport, Arc::new(InMemoryStore::new()), DispatcherConfig::default());

    sender
        .emit("signed", json!("anonymous"), EmitOptions::default())
        .await
        .expect("emit");
    sender
        .emit("signed", json!("attested"), EmitOptions::default().signed_by(identity))
        .await
        .expect("emit");

    let (payload, signer, _) = next(&mut rx).await;
    assert_eq!(payload, json!("attested"));
    assert_eq!(signer, Some(address));
    nothing_more(&mut rx).await;

    receiver.stop().await;
}

// =============================================================================
// Subscription recovery
// =============================================================================

async fn wait_connected(dispatcher: &Dispatcher) {
    let mut state = dispatcher.watch_subscription_state();
    timeout(
        Duration::from_secs(600),
        state.wait_for(|s| *s == SubscriptionState::Connected),
    )
    .await
    .expect("reconnects")
    .expect("state channel open");
}

#[tokio::test(start_paused = true)]
async fn test_brief_outage_keeps_subscription_object() {
    init();
    let transport = InMemoryTransport::new();
    let dispatcher = node(&transport, Arc::new(InMemoryStore::new()), DispatcherConfig::default());
    dispatcher.start().await.expect("start");
    assert_eq!(dispatcher.subscriptions_created(), 1);

    transport.fail_next_pings(1);
    transport.fail_next_subscribes(1);
    tokio::time::sleep(Duration::from_millis(10_500)).await;
    assert_eq!(dispatcher.subscription_state(), SubscriptionState::Resubscribing);

    wait_connected(&dispatcher).await;
    assert_eq!(dispatcher.subscriptions_created(), 1);

    dispatcher.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_repeated_failures_recreate_subscription() {
    init();
    let transport = InMemoryTransport::new();
    let dispatcher = node(&transport, Arc::new(InMemoryStore::new()), DispatcherConfig::default());
    let (handler, mut rx) = recorder();
    dispatcher.on("hello", handler);
    dispatcher.start().await.expect("start");

    transport.fail_next_pings(1);
    transport.fail_next_subscribes(2);
    tokio::time::sleep(Duration::from_millis(10_500)).await;

    wait_connected(&dispatcher).await;
    assert_eq!(dispatcher.subscriptions_created(), 2);
    assert_eq!(transport.active_subscriptions(), 1);

    // The new subscription delivers.
    let sender = node(&transport, Arc::new(InMemoryStore::new()), DispatcherConfig::default());
    sender
        .emit("hello", json!("back"), EmitOptions::default())
        .await
        .expect("emit");
    let (payload, _, _) = next(&mut rx).await;
    assert_eq!(payload, json!("back"));

    dispatcher.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_peer_disconnect_backfills_gap() {
    init();
    let transport = InMemoryTransport::new();
    let dispatcher = node(&transport, Arc::new(InMemoryStore::new()), DispatcherConfig::default());
    let (handler, mut rx) = recorder();
    dispatcher.on("hello", handler);
    dispatcher.start().await.expect("start");
    assert_eq!(transport.queries().len(), 1);

    // Published while the subscription was down: only history has it.
    let missed = raw_envelope("hello", json!("gap"), courier_dispatch::domain::now_ms());
    transport.push_history(missed);
    transport.disconnect_peer("peer-1");

    let (payload, _, metadata) = next(&mut rx).await;
    assert_eq!(payload, json!("gap"));
    assert!(metadata.from_replay);
    assert_eq!(transport.queries().len(), 2);

    dispatcher.stop().await;
}

// =============================================================================
// Lifecycle and retry
// =============================================================================

#[tokio::test]
async fn test_stop_and_restart() {
    init();
    let transport = InMemoryTransport::new();
    let dispatcher = node(&transport, Arc::new(InMemoryStore::new()), DispatcherConfig::default());
    let (handler, _rx) = recorder();
    dispatcher.on("hello", handler);
    dispatcher.start().await.expect("start");

    dispatcher.stop().await;
    assert!(!dispatcher.is_registered("hello"));
    assert_eq!(dispatcher.subscription_state(), SubscriptionState::Disconnected);

    let (handler, mut rx) = recorder();
    dispatcher.on("hello", handler);
    dispatcher.start().await.expect("restart");
    assert_eq!(dispatcher.subscription_state(), SubscriptionState::Connected);

    dispatcher
        .emit("hello", json!("again"), EmitOptions::default())
        .await
        .expect("emit");
    let (payload, _, _) = next(&mut rx).await;
    assert_eq!(payload, json!("again"));

    dispatcher.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_start_wins() {
    init();
    let transport = InMemoryTransport::new();
    let dispatcher = Arc::new(node(
        &transport,
        Arc::new(InMemoryStore::new()),
        DispatcherConfig::default(),
    ));

    // Startup backfill hangs until the page timeout.
    transport.stall_queries(true);
    let starting = tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move { dispatcher.start().await }
    });
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!dispatcher.is_running());

    dispatcher.stop().await;
    starting.await.expect("start task").expect("start");

    assert!(!dispatcher.is_running());
    assert_eq!(dispatcher.subscription_state(), SubscriptionState::Disconnected);
    assert_eq!(transport.active_subscriptions(), 0);

    transport.stall_queries(false);
    dispatcher.start().await.expect("restart");
    assert!(dispatcher.is_running());
    assert_eq!(dispatcher.subscription_state(), SubscriptionState::Connected);
    assert_eq!(transport.active_subscriptions(), 1);

    dispatcher.stop().await;
}

#[tokio::test]
async fn test_concurrent_starts_share_one_subscription() {
    init();
    let transport = InMemoryTransport::new();
    let dispatcher = node(&transport, Arc::new(InMemoryStore::new()), DispatcherConfig::default());

    let (first, second) = tokio::join!(dispatcher.start(), dispatcher.start());
    first.expect("start");
    second.expect("start");
    assert_eq!(transport.subscriptions_created(), 1);
    assert_eq!(transport.active_subscriptions(), 1);

    dispatcher.stop().await;
    assert!(!dispatcher.is_running());
    assert_eq!(transport.active_subscriptions(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_background_retry_drain_resends() {
    init();
    let transport = InMemoryTransport::new();
    let mut config = DispatcherConfig::default();
    config.retry.enabled = true;
    let store = Arc::new(InMemoryStore::new());
    let dispatcher = node(&transport, store, config);
    dispatcher.start().await.expect("start");

    transport.fail_next_publishes(1);
    let delivered = dispatcher
        .emit("hello", json!("later"), EmitOptions::default())
        .await
        .expect("emit");
    assert!(!delivered);
    assert_eq!(dispatcher.retry_len(), 1);

    tokio::time::sleep(Duration::from_millis(10_500)).await;
    assert_eq!(dispatcher.retry_len(), 0);
    assert_eq!(transport.published().len(), 2);
    assert_eq!(
        dispatcher.local_messages(Direction::Out).await.expect("store").len(),
        1
    );

    dispatcher.stop().await;
}
