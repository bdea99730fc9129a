//! Broadcast lane: fan-out of serialized alert events to every connected
//! push client. Backed by a tokio broadcast channel; the /ws handler in the
//! API layer attaches one receiver per socket. Slow or closed subscribers
//! lag out and are dropped by their own handler; a send never fails the
//! pipeline.

use tokio::sync::broadcast;
use tracing::debug;

use crate::types::{AlertRecord, PushEvent};

#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<String>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Serialize and publish an `ALERT_NEW` event. No subscribers is fine.
    pub fn broadcast_alert(&self, record: &AlertRecord) {
        let event = PushEvent::alert_new(record);
        match serde_json::to_string(&event) {
            Ok(json) => {
                let _ = self.tx.send(json);
            }
            Err(e) => debug!("alert event serialization failed: {e}"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
