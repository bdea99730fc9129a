//! Persistence lane of the alert sink. Receives records from the pipeline,
//! buffers them, and bulk-inserts on a one-second cadence or a high-water
//! mark, whichever comes first. Runs as a dedicated background task so a
//! slow store never blocks the detection path.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::{FLUSH_HIGH_WATER, FLUSH_INTERVAL_SECS, PERSIST_BUFFER_CAP, STORE_TIMEOUT_SECS};
use crate::db::store::Store;
use crate::metrics::Metrics;
use crate::types::AlertRecord;

pub struct AlertWriter {
    store: Store,
    alert_rx: mpsc::Receiver<AlertRecord>,
    metrics: Arc<Metrics>,
    buffer: Vec<AlertRecord>,
}

impl AlertWriter {
    pub fn new(store: Store, alert_rx: mpsc::Receiver<AlertRecord>, metrics: Arc<Metrics>) -> Self {
        Self { store, alert_rx, metrics, buffer: Vec::new() }
    }

    /// Runs until the pipeline drops its sender, then flushes once more;
    /// that ordering makes the shutdown drain's last records durable.
    pub async fn run(mut self) {
        let mut ticker = interval(Duration::from_secs(FLUSH_INTERVAL_SECS));
        ticker.tick().await; // consume immediate first tick

        loop {
            tokio::select! {
                maybe = self.alert_rx.recv() => match maybe {
                    Some(record) => {
                        self.buffer.push(record);
                        if self.buffer.len() >= FLUSH_HIGH_WATER {
                            self.flush().await;
                        }
                        self.publish_depth();
                    }
                    None => break,
                },
                _ = ticker.tick() => self.flush().await,
            }
        }

        self.flush().await;
        info!("alert writer stopped");
    }

    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.buffer);
        let insert = self.store.bulk_insert_alerts(&batch);
        match tokio::time::timeout(Duration::from_secs(STORE_TIMEOUT_SECS), insert).await {
            Ok(Ok(())) => debug!("flushed {} alerts to store", batch.len()),
            Ok(Err(e)) => {
                warn!("alert flush failed, re-queueing {} records: {e}", batch.len());
                self.requeue(batch);
            }
            Err(_) => {
                warn!("alert flush timed out, re-queueing {} records", batch.len());
                self.requeue(batch);
            }
        }
        self.publish_depth();
    }

    /// Failed batch goes back ahead of anything buffered since, preserving
    /// emit order; overflow beyond the cap sheds the oldest records.
    fn requeue(&mut self, mut batch: Vec<AlertRecord>) {
        batch.append(&mut self.buffer);
        self.buffer = batch;

        if self.buffer.len() > PERSIST_BUFFER_CAP {
            let shed = self.buffer.len() - PERSIST_BUFFER_CAP;
            self.buffer.drain(..shed);
            self.metrics.alerts_lost.fetch_add(shed as u64, Ordering::Relaxed);
            warn!(shed, "persistence buffer over cap, shed oldest records");
        }
    }

    fn publish_depth(&self) {
        self.metrics
            .persistence_buffer_depth
            .store(self.buffer.len() as u64, Ordering::Relaxed);
    }
}
