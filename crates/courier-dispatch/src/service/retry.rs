//! # Retry Cache
//!
//! FIFO of publishes the transport reported as undelivered. A drain walks
//! the queue oldest-first and stops at the first failure, leaving the rest
//! for the next cycle.

use crate::domain::TransportMessage;
use crate::ports::Transport;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// A queued publish.
#[derive(Clone, Debug)]
pub struct RetryEntry {
    /// Message to resend
    pub message: TransportMessage,
    /// When it was queued
    pub enqueued_at: Instant,
}

/// Result of one drain cycle.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Messages the transport accepted this cycle, oldest first
    pub sent: Vec<TransportMessage>,
    /// Entries still queued
    pub remaining: usize,
    /// Another drain was already running; nothing was attempted
    pub skipped: bool,
}

/// Failed-publish queue with a single-flight drain.
pub struct RetryCache {
    queue: Mutex<VecDeque<RetryEntry>>,
    draining: AtomicBool,
    send_spacing: Duration,
}

/// Releases the drain latch on every exit path.
struct DrainLatch<'a>(&'a AtomicBool);

impl Drop for DrainLatch<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RetryCache {
    /// Empty cache; consecutive resends are `send_spacing` apart.
    pub fn new(send_spacing: Duration) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            send_spacing,
        }
    }

    /// Queue a message for resending.
    pub fn enqueue(&self, message: TransportMessage) {
        let mut queue = self.queue.lock();
        queue.push_back(RetryEntry {
            message,
            enqueued_at: Instant::now(),
        });
        debug!(queued = queue.len(), "Publish queued for retry");
    }

    /// Queued entries.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every queued entry.
    pub fn clear(&self) {
        self.queue.lock().clear();
    }

    /// Whether a drain is in progress.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Resend queued messages oldest-first until one fails.
    pub async fn drain(&self, transport: &dyn Transport) -> DrainReport {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Retry drain already running");
            return DrainReport {
                skipped: true,
                remaining: self.len(),
                ..DrainReport::default()
            };
        }
        let _latch = DrainLatch(&self.draining);

        let mut report = DrainReport::default();
        loop {
            let next = self.queue.lock().front().cloned();
            let Some(entry) = next else {
                break;
            };

            let delivered = match transport.publish(&entry.message).await {
                Ok(outcome) => outcome.delivered,
                Err(e) => {
                    debug!(error = %e, "Retry publish failed");
                    false
                }
            };
            if !delivered {
                break;
            }

            {
                let mut queue = self.queue.lock();
                // The queue may have been cleared while publishing.
                if queue
                    .front()
                    .is_some_and(|e| e.enqueued_at == entry.enqueued_at && e.message == entry.message)
                {
                    queue.pop_front();
                }
            }
            report.sent.push(entry.message);

            if self.is_empty() {
                break;
            }
            tokio::time::sleep(self.send_spacing).await;
        }

        report.remaining = self.len();
        if !report.sent.is_empty() || report.remaining > 0 {
            info!(
                sent = report.sent.len(),
                remaining = report.remaining,
                "Retry drain finished"
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryTransport;
    use std::sync::Arc;

    fn message(n: u8) -> TransportMessage {
        TransportMessage::new("/t", "/ps", vec![n])
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_oldest_first() {
        let transport = InMemoryTransport::new();
        let cache = RetryCache::new(Duration::from_millis(500));
        for n in 1..=3 {
            cache.enqueue(message(n));
        }

        let started = Instant::now();
        let report = cache.drain(&transport).await;

        assert_eq!(report.sent, vec![message(1), message(2), message(3)]);
        assert_eq!(report.remaining, 0);
        assert_eq!(transport.published(), vec![message(1), message(2), message(3)]);
        // Spacing between sends, none after the last.
        assert_eq!(started.elapsed(), Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_stops_at_first_failure() {
        let transport = InMemoryTransport::new();
        let cache = RetryCache::new(Duration::from_millis(10));
        for n in 1..=3 {
            cache.enqueue(message(n));
        }
        transport.fail_next_publishes(1);

        let report = cache.drain(&transport).await;
        assert!(report.sent.is_empty());
        assert_eq!(report.remaining, 3);
        assert_eq!(transport.published().len(), 1);

        let report = cache.drain(&transport).await;
        assert_eq!(report.sent.len(), 3);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_drain_skipped() {
        let transport = Arc::new(InMemoryTransport::new());
        let cache = Arc::new(RetryCache::new(Duration::from_secs(1)));
        cache.enqueue(message(1));
        cache.enqueue(message(2));

        let first = {
            let cache = cache.clone();
            let transport = transport.clone();
            tokio::spawn(async move { cache.drain(transport.as_ref()).await })
        };
        // Let the first drain send and start sleeping.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(cache.is_draining());

        let second = cache.drain(transport.as_ref()).await;
        assert!(second.skipped);

        let first = first.await.unwrap();
        assert_eq!(first.sent.len(), 2);
        assert!(!cache.is_draining());
    }

    #[tokio::test]
    async fn test_clear() {
        let cache = RetryCache::new(Duration::ZERO);
        cache.enqueue(message(1));
        cache.clear();
        assert!(cache.is_empty());
    }
}
