//! Tick ingress: the seam between the feed adapter's socket task and the
//! pipeline task. A bounded batch queue with drop-oldest overflow: the
//! adapter must never block, and a slow pipeline sheds the stalest data
//! first.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::warn;

use crate::metrics::Metrics;
use crate::types::Tick;

pub struct TickQueue {
    inner: Mutex<VecDeque<Vec<Tick>>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
    metrics: Arc<Metrics>,
}

impl TickQueue {
    pub fn new(capacity: usize, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
            closed: AtomicBool::new(false),
            metrics,
        })
    }

    /// Hand a batch to the pipeline. Never blocks: validation happens inline,
    /// and a full queue evicts its oldest batch with a counter bump.
    pub fn enqueue(&self, batch: Vec<Tick>) {
        let mut kept = Vec::with_capacity(batch.len());
        for tick in batch {
            if tick.last_price.is_finite() && tick.last_price > 0.0 {
                kept.push(tick);
            } else {
                self.metrics.malformed_ticks.fetch_add(1, Ordering::Relaxed);
            }
        }
        if kept.is_empty() || self.closed.load(Ordering::Acquire) {
            return;
        }
        self.metrics.total_ticks.fetch_add(kept.len() as u64, Ordering::Relaxed);

        {
            let mut queue = self.inner.lock().expect("tick queue poisoned");
            queue.push_back(kept);
            while queue.len() > self.capacity {
                if let Some(evicted) = queue.pop_front() {
                    self.metrics
                        .dropped_ticks
                        .fetch_add(evicted.len() as u64, Ordering::Relaxed);
                    warn!(dropped = evicted.len(), "tick queue full, dropped oldest batch");
                }
            }
        }
        self.notify.notify_one();
    }

    /// Await the next batch. Returns `None` once the queue is closed and
    /// drained.
    pub async fn recv(&self) -> Option<Vec<Tick>> {
        loop {
            if let Some(batch) = self.inner.lock().expect("tick queue poisoned").pop_front() {
                return Some(batch);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking pop, used by the shutdown drain.
    pub fn try_recv(&self) -> Option<Vec<Tick>> {
        self.inner.lock().expect("tick queue poisoned").pop_front()
    }

    /// Stop accepting batches; pending ones remain for draining.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn depth(&self) -> usize {
        self.inner.lock().expect("tick queue poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(token: u32, price: f64) -> Tick {
        Tick { instrument_token: token, last_price: price, exchange_timestamp: None }
    }

    fn queue(capacity: usize) -> (Arc<TickQueue>, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new());
        (TickQueue::new(capacity, Arc::clone(&metrics)), metrics)
    }

    #[tokio::test]
    async fn delivers_batches_in_fifo_order() {
        let (q, metrics) = queue(8);
        q.enqueue(vec![tick(1, 100.0)]);
        q.enqueue(vec![tick(2, 200.0)]);

        assert_eq!(q.recv().await.unwrap()[0].instrument_token, 1);
        assert_eq!(q.recv().await.unwrap()[0].instrument_token, 2);
        assert_eq!(metrics.total_ticks.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_batch() {
        let (q, metrics) = queue(2);
        q.enqueue(vec![tick(1, 1.0), tick(1, 2.0)]);
        q.enqueue(vec![tick(2, 1.0)]);
        q.enqueue(vec![tick(3, 1.0)]);

        assert_eq!(metrics.dropped_ticks.load(Ordering::Relaxed), 2);
        assert_eq!(q.recv().await.unwrap()[0].instrument_token, 2);
        assert_eq!(q.recv().await.unwrap()[0].instrument_token, 3);
    }

    #[tokio::test]
    async fn malformed_ticks_are_skipped_with_counter() {
        let (q, metrics) = queue(8);
        q.enqueue(vec![tick(1, 0.0), tick(1, -5.0), tick(1, f64::NAN), tick(1, 101.5)]);

        let batch = q.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].last_price, 101.5);
        assert_eq!(metrics.malformed_ticks.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.total_ticks.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let (q, metrics) = queue(8);
        q.enqueue(vec![]);
        assert_eq!(q.depth(), 0);
        assert_eq!(metrics.total_ticks.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn close_wakes_receiver_after_drain() {
        let (q, _metrics) = queue(8);
        q.enqueue(vec![tick(1, 100.0)]);
        q.close();
        assert!(q.recv().await.is_some());
        assert!(q.recv().await.is_none());
    }
}
