//! Periodic jobs: the cache refresher rebuilds the subscription table and
//! settings map from the store every minute and publishes them atomically;
//! the retention job prunes the alert log daily. Both log and continue on any
//! single-iteration failure and never abort the engine.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tracing::{error, info};

use crate::config::{
    ALERT_RETENTION_DAYS, CACHE_REFRESH_INTERVAL_SECS, RETENTION_INTERVAL_SECS, STORE_TIMEOUT_SECS,
};
use crate::db::store::Store;
use crate::engine::caches::{EngineCaches, SettingsMap, SubscriptionTable};
use crate::error::{AppError, Result};
use crate::metrics::Metrics;
use crate::types::{ControlMsg, UserSettings, WatchedStock};

/// Build both snapshots from freshly loaded rows.
pub fn build_snapshots(
    settings: Vec<UserSettings>,
    stocks: &[WatchedStock],
) -> (SubscriptionTable, SettingsMap) {
    (SubscriptionTable::from_rows(stocks), SettingsMap::from_rows(settings))
}

pub struct CacheRefresher {
    store: Store,
    caches: Arc<EngineCaches>,
    control_tx: mpsc::Sender<ControlMsg>,
    metrics: Arc<Metrics>,
}

impl CacheRefresher {
    pub fn new(
        store: Store,
        caches: Arc<EngineCaches>,
        control_tx: mpsc::Sender<ControlMsg>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { store, caches, control_tx, metrics }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(Duration::from_secs(CACHE_REFRESH_INTERVAL_SECS));
        ticker.tick().await; // skip immediate first tick — bootstrap already ran

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh().await {
                        error!("cache refresh failed: {e}");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    /// One refresh cycle: load, build, publish, diff subscriptions. Also used
    /// directly at startup to bootstrap the caches before the pipeline runs.
    pub async fn refresh(&self) -> Result<()> {
        let before: HashSet<u32> = self.caches.subscribed_tokens().into_iter().collect();

        let settings = with_timeout("load_all_settings", self.store.load_all_settings()).await?;
        let stocks = with_timeout("load_active_stocks", self.store.load_active_stocks()).await?;

        let (table, settings_map) = build_snapshots(settings, &stocks);
        let user_count = settings_map.user_count();
        let instrument_count = table.instrument_count();

        self.caches.publish(table, settings_map);
        self.metrics.monitored_users.store(user_count as u64, Ordering::Relaxed);
        self.metrics
            .monitored_instruments
            .store(instrument_count as u64, Ordering::Relaxed);

        // The adapter applies the difference between the old and new unions.
        let after: HashSet<u32> = self.caches.subscribed_tokens().into_iter().collect();
        let mut added: Vec<u32> = after.difference(&before).copied().collect();
        let mut removed: Vec<u32> = before.difference(&after).copied().collect();
        added.sort_unstable();
        removed.sort_unstable();

        if !removed.is_empty() {
            self.control_tx
                .send(ControlMsg::Unsubscribe(removed.clone()))
                .await
                .map_err(|e| AppError::ChannelSend(e.to_string()))?;
        }
        if !added.is_empty() {
            self.control_tx
                .send(ControlMsg::Subscribe(added.clone()))
                .await
                .map_err(|e| AppError::ChannelSend(e.to_string()))?;
        }

        info!(
            users = user_count,
            instruments = instrument_count,
            added = added.len(),
            removed = removed.len(),
            "cache refreshed: {user_count} users, {instrument_count} instruments monitored",
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Retention
// ---------------------------------------------------------------------------

pub struct RetentionJob {
    store: Store,
}

impl RetentionJob {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(Duration::from_secs(RETENTION_INTERVAL_SECS));
        ticker.tick().await; // consume immediate first tick

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!("retention sweep failed: {e}");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn sweep(&self) -> Result<()> {
        let cutoff = Utc::now() - chrono::Duration::days(ALERT_RETENTION_DAYS);
        let deleted =
            with_timeout("delete_alerts_older_than", self.store.delete_alerts_older_than(cutoff))
                .await?;
        if deleted > 0 {
            info!(deleted, "retention: deleted {deleted} old alerts");
        }
        Ok(())
    }
}

async fn with_timeout<T>(
    label: &str,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(Duration::from_secs(STORE_TIMEOUT_SECS), fut)
        .await
        .map_err(|_| AppError::StoreTimeout(label.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CHANNEL_CAPACITY;
    use crate::types::AlgoMode;

    async fn seeded_store() -> Store {
        let store = Store::connect(":memory:").await.unwrap();
        for (user_id, mode) in [(1i64, "trailing"), (2, "both")] {
            sqlx::query(
                "INSERT INTO settings (user_id, algo_mode, updated_at) VALUES (?, ?, 0)",
            )
            .bind(user_id)
            .bind(mode)
            .execute(store.pool())
            .await
            .unwrap();
        }
        for (user_id, symbol, token, active) in
            [(1i64, "INFY", 408065i64, 1i64), (2, "INFY", 408065, 1), (2, "TCS", 2953217, 1), (2, "OLD", 111, 0)]
        {
            sqlx::query(
                "INSERT INTO stocks (user_id, symbol, instrument_token, active, created_at) VALUES (?, ?, ?, ?, 0)",
            )
            .bind(user_id)
            .bind(symbol)
            .bind(token)
            .bind(active)
            .execute(store.pool())
            .await
            .unwrap();
        }
        store
    }

    fn refresher(store: Store) -> (CacheRefresher, Arc<EngineCaches>, mpsc::Receiver<ControlMsg>, Arc<Metrics>) {
        let caches = EngineCaches::new();
        let metrics = Arc::new(Metrics::new());
        let (control_tx, control_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let job = CacheRefresher::new(store, Arc::clone(&caches), control_tx, Arc::clone(&metrics));
        (job, caches, control_rx, metrics)
    }

    #[tokio::test]
    async fn refresh_publishes_snapshots_and_subscribes_union() {
        let store = seeded_store().await;
        let (job, caches, mut control_rx, metrics) = refresher(store);

        job.refresh().await.unwrap();

        // Inactive rows are excluded from the union.
        assert_eq!(caches.subscribed_tokens(), vec![408065, 2953217]);
        assert_eq!(caches.settings().user_count(), 2);
        assert_eq!(metrics.monitored_users.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.monitored_instruments.load(Ordering::Relaxed), 2);

        match control_rx.try_recv().unwrap() {
            ControlMsg::Subscribe(tokens) => assert_eq!(tokens, vec![408065, 2953217]),
            other => panic!("expected Subscribe, got {other:?}"),
        }
        assert!(control_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unchanged_data_refreshes_to_identical_snapshots_without_diffs() {
        let store = seeded_store().await;
        let (job, caches, mut control_rx, _metrics) = refresher(store);

        job.refresh().await.unwrap();
        let _ = control_rx.try_recv();
        let subs_before = caches.subscriptions();
        let settings_before = caches.settings();

        job.refresh().await.unwrap();
        assert!(control_rx.try_recv().is_err(), "no diff expected");
        assert_eq!(*subs_before, *caches.subscriptions());
        assert_eq!(*settings_before, *caches.settings());
    }

    #[tokio::test]
    async fn deactivated_stock_triggers_unsubscribe() {
        let store = seeded_store().await;
        let (job, caches, mut control_rx, _metrics) = refresher(store.clone());

        job.refresh().await.unwrap();
        let _ = control_rx.try_recv();

        sqlx::query("UPDATE stocks SET active = 0 WHERE symbol = 'TCS'")
            .execute(store.pool())
            .await
            .unwrap();
        job.refresh().await.unwrap();

        match control_rx.try_recv().unwrap() {
            ControlMsg::Unsubscribe(tokens) => assert_eq!(tokens, vec![2953217]),
            other => panic!("expected Unsubscribe, got {other:?}"),
        }
        assert_eq!(caches.subscribed_tokens(), vec![408065]);
    }

    #[tokio::test]
    async fn build_snapshots_is_pure_over_row_order() {
        let settings = |ids: &[i64]| {
            ids.iter()
                .map(|&user_id| UserSettings {
                    user_id,
                    timeframe_minutes: 10,
                    dip_threshold: 1.0,
                    rise_threshold: 1.0,
                    cooldown_minutes: 15,
                    algo_mode: AlgoMode::Both,
                    email_enabled: false,
                    whatsapp_enabled: false,
                    telegram_enabled: false,
                    email_address: None,
                    whatsapp_number: None,
                    telegram_chat_id: None,
                })
                .collect::<Vec<_>>()
        };
        let stock = |user_id: i64, token: u32| WatchedStock {
            user_id,
            symbol: "X".to_string(),
            instrument_token: token,
        };

        let (table_a, map_a) =
            build_snapshots(settings(&[1, 2]), &[stock(1, 5), stock(2, 5), stock(2, 9)]);
        let (table_b, map_b) =
            build_snapshots(settings(&[2, 1]), &[stock(2, 9), stock(2, 5), stock(1, 5)]);
        assert_eq!(table_a, table_b);
        assert_eq!(map_a, map_b);
    }
}
