//! Session-token watchdog. Checks the persisted token every minute; on
//! expiry it flips the system OFFLINE and tells the feed adapter to drop into
//! the degraded no-tick state.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tracing::{error, warn};

use crate::config::{STORE_TIMEOUT_SECS, WATCHDOG_INTERVAL_SECS};
use crate::db::store::Store;
use crate::error::{AppError, Result};
use crate::types::{ControlMsg, TokenStatus};

pub struct TokenWatchdog {
    store: Store,
    control_tx: mpsc::Sender<ControlMsg>,
}

impl TokenWatchdog {
    pub fn new(store: Store, control_tx: mpsc::Sender<ControlMsg>) -> Self {
        Self { store, control_tx }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(Duration::from_secs(WATCHDOG_INTERVAL_SECS));
        ticker.tick().await; // consume immediate first tick

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.check().await {
                        error!("token watchdog check failed: {e}");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn check(&self) -> Result<()> {
        let token = tokio::time::timeout(
            Duration::from_secs(STORE_TIMEOUT_SECS),
            self.store.latest_token(),
        )
        .await
        .map_err(|_| AppError::StoreTimeout("latest_token".to_string()))??;

        let Some(token) = token else {
            return Ok(());
        };

        if token.status == TokenStatus::Online && token.expires_at < Utc::now() {
            warn!("session token expired, switching system OFFLINE");
            self.store.mark_tokens_offline().await?;
            self.control_tx
                .send(ControlMsg::Restart(None))
                .await
                .map_err(|e| AppError::ChannelSend(e.to_string()))?;
        }
        Ok(())
    }
}
