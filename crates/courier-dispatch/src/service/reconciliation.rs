//! # Reconciliation Engine
//!
//! Merges three sources of the same message stream: what is stored
//! locally, what arrives live, and what the transport's history service
//! still holds. Every message from every source goes through the same
//! dispatch path, so the duplicate filter makes the merge idempotent no
//! matter how the windows overlap.

use crate::adapters::LocalStoreAdapter;
use crate::config::ReconciliationConfig;
use crate::domain::{now_ms, DispatchOutcome, StoredMessage};
use crate::errors::{StoreError, TransportError};
use crate::ports::{HistoryQuery, MessageIngress, PageDirection, Transport};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::sync::Arc;
use tokio::time::timeout;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

/// Result of replaying the local store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LocalReplay {
    /// Messages handed to the pipeline
    pub replayed: usize,
    /// Newest timestamp among them
    pub max_timestamp: Option<u64>,
}

/// Result of one network backfill cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetworkBackfill {
    /// Pages received
    pub pages: usize,
    /// Messages received
    pub messages: usize,
    /// Messages that reached at least one handler
    pub delivered: usize,
}

/// Local replay and network backfill.
pub struct ReconciliationEngine {
    transport: Arc<dyn Transport>,
    store: Arc<LocalStoreAdapter>,
    ingress: Arc<dyn MessageIngress>,
    config: ReconciliationConfig,
    last_query_at: Mutex<Option<u64>>,
    local_max_timestamp: Mutex<Option<u64>>,
}

impl ReconciliationEngine {
    /// Create an engine dispatching into `ingress`.
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<LocalStoreAdapter>,
        ingress: Arc<dyn MessageIngress>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            transport,
            store,
            ingress,
            config,
            last_query_at: Mutex::new(None),
            local_max_timestamp: Mutex::new(None),
        }
    }

    /// Replay every stored message, oldest first, as a replay. Age comes
    /// from [`MessageIngress::replay_timestamp`].
    pub async fn backfill_from_local(&self) -> Result<LocalReplay, StoreError> {
        let mut stored: Vec<(Option<u64>, StoredMessage)> = self
            .store
            .load_all()
            .await?
            .into_iter()
            .map(|record| (self.ingress.replay_timestamp(&record.message), record))
            .collect();
        sort_for_replay(&mut stored);

        let mut replay = LocalReplay::default();
        for (timestamp, record) in stored {
            if let Some(ts) = timestamp {
                replay.max_timestamp = Some(replay.max_timestamp.map_or(ts, |m| m.max(ts)));
            }
            self.ingress.dispatch(record.message, true).await;
            replay.replayed += 1;
        }

        if replay.max_timestamp.is_some() {
            *self.local_max_timestamp.lock() = replay.max_timestamp;
        }
        info!(
            replayed = replay.replayed,
            max_timestamp = ?replay.max_timestamp,
            "Local history replayed"
        );
        Ok(replay)
    }

    /// Query the history service and dispatch every message as a replay.
    ///
    /// With `since`, the window is `[since - overlap, now + skew]`;
    /// without, `[now - default_lookback, now + skew]`.
    pub async fn backfill_from_network(
        &self,
        since: Option<u64>,
    ) -> Result<NetworkBackfill, TransportError> {
        let now = now_ms();
        let query = self.window(since, now);
        let decoders = self.ingress.decoders();

        debug!(
            start_ms = query.start_ms,
            end_ms = query.end_ms,
            topics = decoders.len(),
            "Querying history"
        );

        let page_timeout = self.config.page_timeout;
        let mut pages = timeout(page_timeout, self.transport.query_history(&decoders, query))
            .await
            .map_err(|_| TransportError::Timeout(page_timeout))??;

        let mut backfill = NetworkBackfill::default();
        loop {
            let page = match timeout(page_timeout, pages.next()).await {
                Err(_) => {
                    warn!(pages = backfill.pages, "History page timed out");
                    return Err(TransportError::Timeout(page_timeout));
                }
                Ok(None) => break,
                Ok(Some(page)) => page?,
            };

            backfill.pages += 1;
            for message in page {
                backfill.messages += 1;
                if matches!(
                    self.ingress.dispatch(message, true).await,
                    DispatchOutcome::Delivered { handlers } if handlers > 0
                ) {
                    backfill.delivered += 1;
                }
            }
        }

        *self.last_query_at.lock() = Some(now);
        info!(
            pages = backfill.pages,
            messages = backfill.messages,
            delivered = backfill.delivered,
            "History backfill complete"
        );
        Ok(backfill)
    }

    /// Backfill from the last successful query, or the newest local
    /// message if no query has succeeded yet.
    pub async fn reconcile_since_last_query(&self) -> Result<NetworkBackfill, TransportError> {
        let since = self.last_query_at().or(*self.local_max_timestamp.lock());
        self.backfill_from_network(since).await
    }

    /// When the last successful history query started.
    pub fn last_query_at(&self) -> Option<u64> {
        *self.last_query_at.lock()
    }

    fn window(&self, since: Option<u64>, now: u64) -> HistoryQuery {
        let start_ms = match since {
            Some(since) => since.saturating_sub(millis(self.config.overlap_margin)),
            None => now.saturating_sub(millis(self.config.default_lookback)),
        };
        HistoryQuery {
            start_ms,
            end_ms: now.saturating_add(millis(self.config.future_skew_margin)),
            direction: PageDirection::Forward,
            page_size: self.config.page_size,
        }
    }
}

fn millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Ascending by the paired timestamp; entries without one go last. The
/// sort is stable, so equal keys keep their stored order.
pub fn sort_for_replay<T>(entries: &mut [(Option<u64>, T)]) {
    entries.sort_by(|(a, _), (b, _)| match (a, b) {
        (Some(x), Some(y)) => x.cmp(y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryStore, InMemoryTransport};
    use crate::domain::{Direction, TransportMessage};
    use crate::ports::ContentDecoder;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::Duration;

    const TOPIC: &str = "/t";
    const PUBSUB: &str = "/ps";

    /// Records what it is asked to dispatch. `clock` overrides the replay
    /// timestamp by payload.
    #[derive(Default)]
    struct RecordingIngress {
        seen: Mutex<Vec<(TransportMessage, bool)>>,
        clock: Mutex<HashMap<&'static str, u64>>,
    }

    #[async_trait]
    impl MessageIngress for RecordingIngress {
        async fn dispatch(&self, message: TransportMessage, from_replay: bool) -> DispatchOutcome {
            self.seen.lock().push((message, from_replay));
            DispatchOutcome::Delivered { handlers: 1 }
        }

        fn decoders(&self) -> Vec<ContentDecoder> {
            vec![ContentDecoder::new(TOPIC, PUBSUB)]
        }

        fn replay_timestamp(&self, message: &TransportMessage) -> Option<u64> {
            std::str::from_utf8(&message.payload)
                .ok()
                .and_then(|body| self.clock.lock().get(body).copied())
                .or(message.timestamp)
        }
    }

    fn stored(body: &str, ts: Option<u64>) -> StoredMessage {
        let mut message = TransportMessage::new(TOPIC, PUBSUB, body.as_bytes().to_vec());
        message.timestamp = ts;
        StoredMessage::new(message, Direction::In)
    }

    fn engine(
        transport: &InMemoryTransport,
        store: Arc<InMemoryStore>,
    ) -> (ReconciliationEngine, Arc<RecordingIngress>) {
        let ingress = Arc::new(RecordingIngress::default());
        let engine = ReconciliationEngine::new(
            Arc::new(transport.clone()),
            Arc::new(LocalStoreAdapter::new(store)),
            ingress.clone(),
            ReconciliationConfig::default(),
        );
        (engine, ingress)
    }

    fn bodies(ingress: &RecordingIngress) -> Vec<String> {
        ingress
            .seen
            .lock()
            .iter()
            .map(|(m, _)| String::from_utf8(m.payload.clone()).unwrap())
            .collect()
    }

    #[test]
    fn test_sort_missing_timestamps_last_and_stable() {
        let mut entries = vec![
            (None, "none-a"),
            (Some(30), "late"),
            (Some(10), "tie-1"),
            (None, "none-b"),
            (Some(10), "tie-2"),
        ];
        sort_for_replay(&mut entries);

        let order: Vec<_> = entries.iter().map(|(_, body)| *body).collect();
        assert_eq!(order, vec!["tie-1", "tie-2", "late", "none-a", "none-b"]);
    }

    #[tokio::test]
    async fn test_local_replay_marks_replay_and_tracks_max() {
        let transport = InMemoryTransport::new();
        let store = Arc::new(InMemoryStore::with_records([
            stored("b", Some(20)),
            stored("a", Some(10)),
            stored("c", None),
        ]));
        let (engine, ingress) = engine(&transport, store.clone());

        let replay = engine.backfill_from_local().await.unwrap();
        assert_eq!(replay.replayed, 3);
        assert_eq!(replay.max_timestamp, Some(20));
        assert_eq!(bodies(&ingress), vec!["a", "b", "c"]);
        assert!(ingress.seen.lock().iter().all(|(_, replay)| *replay));
        assert_eq!(store.put_calls(), 0);
    }

    #[tokio::test]
    async fn test_local_replay_orders_by_ingress_timestamp() {
        let transport = InMemoryTransport::new();
        let store = Arc::new(InMemoryStore::with_records([
            stored("sealed-late", None),
            stored("wire-early", Some(40)),
            stored("skewed", Some(90)),
        ]));
        let (engine, ingress) = engine(&transport, store);
        ingress.clock.lock().extend([("sealed-late", 70), ("skewed", 30)]);

        let replay = engine.backfill_from_local().await.unwrap();
        assert_eq!(bodies(&ingress), vec!["skewed", "wire-early", "sealed-late"]);
        assert_eq!(replay.max_timestamp, Some(70));
    }

    #[tokio::test]
    async fn test_network_window_with_history() {
        let transport = InMemoryTransport::new();
        let (engine, _) = engine(&transport, Arc::new(InMemoryStore::new()));

        let since = now_ms() - 10_000;
        engine.backfill_from_network(Some(since)).await.unwrap();

        let query = transport.queries()[0];
        assert_eq!(query.start_ms, since - 60_000);
        assert!(query.end_ms >= now_ms() + 59_000);
        assert_eq!(query.page_size, 100);
        assert_eq!(query.direction, PageDirection::Forward);
        assert!(engine.last_query_at().is_some());
    }

    #[tokio::test]
    async fn test_network_window_without_history() {
        let transport = InMemoryTransport::new();
        let (engine, _) = engine(&transport, Arc::new(InMemoryStore::new()));

        let before = now_ms();
        engine.backfill_from_network(None).await.unwrap();

        let query = transport.queries()[0];
        let six_hours = 6 * 60 * 60 * 1000;
        assert!(query.start_ms <= before.saturating_sub(six_hours) + 1_000);
        assert!(query.start_ms + six_hours >= before);
    }

    #[tokio::test]
    async fn test_network_pages_dispatched_as_replay() {
        let transport = InMemoryTransport::new();
        let now = now_ms();
        for i in 0..250u64 {
            transport.push_history(
                TransportMessage::new(TOPIC, PUBSUB, i.to_be_bytes().to_vec()).with_timestamp(now - i),
            );
        }
        let (engine, ingress) = engine(&transport, Arc::new(InMemoryStore::new()));

        let backfill = engine.backfill_from_network(None).await.unwrap();
        assert_eq!(backfill.pages, 3);
        assert_eq!(backfill.messages, 250);
        assert_eq!(backfill.delivered, 250);
        assert!(ingress.seen.lock().iter().all(|(_, replay)| *replay));
    }

    #[tokio::test]
    async fn test_query_failure_keeps_last_query_time() {
        let transport = InMemoryTransport::new();
        let (engine, _) = engine(&transport, Arc::new(InMemoryStore::new()));
        transport.fail_next_queries(1);

        assert!(matches!(
            engine.backfill_from_network(None).await,
            Err(TransportError::QueryFailed(_))
        ));
        assert!(engine.last_query_at().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_page_times_out() {
        let transport = InMemoryTransport::new();
        transport.stall_queries(true);
        let (engine, _) = engine(&transport, Arc::new(InMemoryStore::new()));

        let result = engine.backfill_from_network(None).await;
        assert_eq!(result, Err(TransportError::Timeout(Duration::from_secs(30))));
        assert!(engine.last_query_at().is_none());
    }

    #[tokio::test]
    async fn test_reconcile_uses_last_query_then_local_max() {
        let transport = InMemoryTransport::new();
        let store = Arc::new(InMemoryStore::with_records([stored("a", Some(5_000_000))]));
        let (engine, _) = engine(&transport, store);

        engine.backfill_from_local().await.unwrap();
        engine.reconcile_since_last_query().await.unwrap();
        assert_eq!(transport.queries()[0].start_ms, 5_000_000 - 60_000);

        let last = engine.last_query_at().unwrap();
        engine.reconcile_since_last_query().await.unwrap();
        assert_eq!(transport.queries()[1].start_ms, last - 60_000);
    }
}
