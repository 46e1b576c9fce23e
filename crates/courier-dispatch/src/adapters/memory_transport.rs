//! In-memory loopback transport.
//!
//! Every subscription created on one `InMemoryTransport` (or its clones)
//! shares a single simulated network: a publish is pushed to each matching
//! live subscription and, unless ephemeral, appended to the history that
//! `query_history` pages through. Counters and fault injection make the
//! dispatcher's recovery paths observable.

use crate::domain::TransportMessage;
use crate::errors::TransportError;
use crate::ports::{
    ContentDecoder, FilterSubscription, HistoryQuery, MessageSink, PageDirection, PageStream,
    PeerDisconnected, Protocol, PublishOutcome, Transport,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;

/// Pending injected failures, consumed one per call.
#[derive(Default)]
struct Faults {
    publishes: AtomicUsize,
    subscribes: AtomicUsize,
    pings: AtomicUsize,
    queries: AtomicUsize,
    stall_queries: AtomicBool,
    unready: AtomicBool,
}

impl Faults {
    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

struct Network {
    faults: Arc<Faults>,
    subscriptions: Mutex<Vec<Weak<MemorySubscription>>>,
    history: Mutex<Vec<TransportMessage>>,
    published: Mutex<Vec<TransportMessage>>,
    queries: Mutex<Vec<HistoryQuery>>,
    subscriptions_created: AtomicUsize,
    disconnects: broadcast::Sender<PeerDisconnected>,
}

/// Loopback transport for tests and demos.
#[derive(Clone)]
pub struct InMemoryTransport {
    network: Arc<Network>,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTransport {
    /// Ready transport with empty history.
    pub fn new() -> Self {
        let (disconnects, _) = broadcast::channel(16);
        Self {
            network: Arc::new(Network {
                faults: Arc::new(Faults::default()),
                subscriptions: Mutex::new(Vec::new()),
                history: Mutex::new(Vec::new()),
                published: Mutex::new(Vec::new()),
                queries: Mutex::new(Vec::new()),
                subscriptions_created: AtomicUsize::new(0),
                disconnects,
            }),
        }
    }

    /// Seed the history service.
    pub fn push_history(&self, message: TransportMessage) {
        self.network.history.lock().push(message);
    }

    /// Deliver `message` to matching live subscriptions without recording it.
    pub fn deliver(&self, message: &TransportMessage) -> usize {
        let live: Vec<Arc<MemorySubscription>> = {
            let mut subscriptions = self.network.subscriptions.lock();
            subscriptions.retain(|s| s.strong_count() > 0);
            subscriptions.iter().filter_map(Weak::upgrade).collect()
        };
        live.iter().filter(|s| s.push(message)).count()
    }

    /// Announce a lost peer.
    pub fn disconnect_peer(&self, peer_id: impl Into<String>) {
        let _ = self.network.disconnects.send(PeerDisconnected {
            peer_id: peer_id.into(),
        });
    }

    /// Report the next `n` publishes as undelivered.
    pub fn fail_next_publishes(&self, n: usize) {
        self.network.faults.publishes.store(n, Ordering::SeqCst);
    }

    /// Reject the next `n` subscribe calls.
    pub fn fail_next_subscribes(&self, n: usize) {
        self.network.faults.subscribes.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` pings.
    pub fn fail_next_pings(&self, n: usize) {
        self.network.faults.pings.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` history queries.
    pub fn fail_next_queries(&self, n: usize) {
        self.network.faults.queries.store(n, Ordering::SeqCst);
    }

    /// Make history queries return a stream that never yields.
    pub fn stall_queries(&self, stall: bool) {
        self.network.faults.stall_queries.store(stall, Ordering::SeqCst);
    }

    /// Make `wait_ready` fail.
    pub fn set_unready(&self, unready: bool) {
        self.network.faults.unready.store(unready, Ordering::SeqCst);
    }

    /// Every message handed to `publish`, including undelivered ones.
    pub fn published(&self) -> Vec<TransportMessage> {
        self.network.published.lock().clone()
    }

    /// Every history query issued.
    pub fn queries(&self) -> Vec<HistoryQuery> {
        self.network.queries.lock().clone()
    }

    /// Subscription objects created so far.
    pub fn subscriptions_created(&self) -> usize {
        self.network.subscriptions_created.load(Ordering::SeqCst)
    }

    /// Subscriptions currently receiving deliveries.
    pub fn active_subscriptions(&self) -> usize {
        self.network
            .subscriptions
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|s| s.is_active())
            .count()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn wait_ready(&self, protocols: &[Protocol]) -> Result<(), TransportError> {
        if self.network.faults.unready.load(Ordering::SeqCst) {
            return Err(TransportError::NotReady(format!("no peers for {protocols:?}")));
        }
        Ok(())
    }

    async fn publish(&self, message: &TransportMessage) -> Result<PublishOutcome, TransportError> {
        self.network.published.lock().push(message.clone());

        if Faults::take(&self.network.faults.publishes) {
            return Ok(PublishOutcome { delivered: false });
        }

        if !message.ephemeral {
            self.network.history.lock().push(message.clone());
        }
        self.deliver(message);
        Ok(PublishOutcome { delivered: true })
    }

    async fn create_subscription(
        &self,
        pubsub_topic: &str,
    ) -> Result<Arc<dyn FilterSubscription>, TransportError> {
        let id = self.network.subscriptions_created.fetch_add(1, Ordering::SeqCst) + 1;
        let subscription = Arc::new(MemorySubscription {
            id,
            pubsub_topic: pubsub_topic.to_string(),
            faults: self.network.faults.clone(),
            active: Mutex::new(None),
        });
        self.network
            .subscriptions
            .lock()
            .push(Arc::downgrade(&subscription));
        Ok(subscription as Arc<dyn FilterSubscription>)
    }

    async fn query_history(
        &self,
        decoders: &[ContentDecoder],
        query: HistoryQuery,
    ) -> Result<PageStream, TransportError> {
        self.network.queries.lock().push(query);

        if Faults::take(&self.network.faults.queries) {
            return Err(TransportError::QueryFailed("history peer refused".into()));
        }
        if self.network.faults.stall_queries.load(Ordering::SeqCst) {
            let stalled: PageStream = Box::pin(tokio_stream::pending::<
                Result<Vec<TransportMessage>, TransportError>,
            >());
            return Ok(stalled);
        }

        let mut matched: Vec<TransportMessage> = self
            .network
            .history
            .lock()
            .iter()
            .filter(|m| decoders.iter().any(|d| d.matches(m)))
            .filter(|m| {
                m.timestamp
                    .map_or(true, |t| t >= query.start_ms && t <= query.end_ms)
            })
            .cloned()
            .collect();
        if query.direction == PageDirection::Backward {
            matched.reverse();
        }

        let pages: Vec<Result<Vec<TransportMessage>, TransportError>> = matched
            .chunks(query.page_size.max(1))
            .map(|page| Ok(page.to_vec()))
            .collect();
        let stream: PageStream = Box::pin(tokio_stream::iter(pages));
        Ok(stream)
    }

    fn peer_disconnects(&self) -> broadcast::Receiver<PeerDisconnected> {
        self.network.disconnects.subscribe()
    }
}

/// Subscription object handed out by [`InMemoryTransport`].
pub struct MemorySubscription {
    id: usize,
    pubsub_topic: String,
    faults: Arc<Faults>,
    active: Mutex<Option<(Vec<ContentDecoder>, MessageSink)>>,
}

impl MemorySubscription {
    fn is_active(&self) -> bool {
        self.active.lock().is_some()
    }

    fn push(&self, message: &TransportMessage) -> bool {
        let active = self.active.lock();
        match active.as_ref() {
            Some((decoders, sink))
                if message.pubsub_topic == self.pubsub_topic
                    && decoders.iter().any(|d| d.matches(message)) =>
            {
                sink.send(message.clone()).is_ok()
            }
            _ => false,
        }
    }
}

#[async_trait]
impl FilterSubscription for MemorySubscription {
    async fn subscribe(
        &self,
        decoders: &[ContentDecoder],
        sink: MessageSink,
    ) -> Result<(), TransportError> {
        if Faults::take(&self.faults.subscribes) {
            return Err(TransportError::SubscribeFailed(format!(
                "subscription {} rejected",
                self.id
            )));
        }
        *self.active.lock() = Some((decoders.to_vec(), sink));
        Ok(())
    }

    async fn ping(&self) -> Result<(), TransportError> {
        if Faults::take(&self.faults.pings) {
            return Err(TransportError::PingFailed(format!(
                "subscription {} unreachable",
                self.id
            )));
        }
        if !self.is_active() {
            return Err(TransportError::PingFailed(format!(
                "subscription {} is not active",
                self.id
            )));
        }
        Ok(())
    }

    async fn unsubscribe_all(&self) -> Result<(), TransportError> {
        self.active.lock().take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio_stream::StreamExt;

    fn message(topic: &str, ts: u64) -> TransportMessage {
        TransportMessage::new(topic, "/ps", ts.to_be_bytes().to_vec()).with_timestamp(ts)
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_subscription() {
        let transport = InMemoryTransport::new();
        let subscription = transport.create_subscription("/ps").await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        subscription
            .subscribe(&[ContentDecoder::new("/a", "/ps")], tx)
            .await
            .unwrap();

        transport.publish(&message("/a", 1)).await.unwrap();
        transport.publish(&message("/b", 2)).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().timestamp, Some(1));
        assert!(rx.try_recv().is_err());
        assert_eq!(transport.published().len(), 2);
    }

    #[tokio::test]
    async fn test_fault_injection_is_consumed() {
        let transport = InMemoryTransport::new();
        transport.fail_next_publishes(1);

        let first = transport.publish(&message("/a", 1)).await.unwrap();
        let second = transport.publish(&message("/a", 2)).await.unwrap();
        assert!(!first.delivered);
        assert!(second.delivered);
    }

    #[tokio::test]
    async fn test_history_paging_and_window() {
        let transport = InMemoryTransport::new();
        for ts in 1..=5 {
            transport.push_history(message("/a", ts * 10));
        }
        transport.push_history(message("/other", 30));

        let query = HistoryQuery {
            start_ms: 20,
            end_ms: 50,
            direction: PageDirection::Forward,
            page_size: 2,
        };
        let mut pages = transport
            .query_history(&[ContentDecoder::new("/a", "/ps")], query)
            .await
            .unwrap();

        let mut sizes = Vec::new();
        while let Some(page) = pages.next().await {
            sizes.push(page.unwrap().len());
        }
        assert_eq!(sizes, vec![2, 2]);
        assert_eq!(transport.queries(), vec![query]);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery_and_ping() {
        let transport = InMemoryTransport::new();
        let subscription = transport.create_subscription("/ps").await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        subscription
            .subscribe(&[ContentDecoder::new("/a", "/ps")], tx)
            .await
            .unwrap();
        assert!(subscription.ping().await.is_ok());
        assert_eq!(transport.active_subscriptions(), 1);

        subscription.unsubscribe_all().await.unwrap();
        assert!(subscription.ping().await.is_err());
        assert_eq!(transport.deliver(&message("/a", 1)), 0);
    }

    #[tokio::test]
    async fn test_disconnect_broadcast() {
        let transport = InMemoryTransport::new();
        let mut events = transport.peer_disconnects();
        transport.disconnect_peer("peer-1");
        assert_eq!(events.recv().await.unwrap().peer_id, "peer-1");
    }
}
