//! The pipeline task: drains tick batches from ingress, fans each tick out
//! through the subscription snapshot, runs the windowing algorithms under the
//! user's mode, applies thresholds and cooldown dedup, and hands finished
//! alert records to the three sink lanes.
//!
//! Single-threaded on purpose: it is the only owner of the trailing,
//! rolling and cooldown maps, so no locks are needed and identical inputs
//! yield identical alert sets. No store or network I/O happens here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::config::SHUTDOWN_DRAIN_SECS;
use crate::engine::caches::EngineCaches;
use crate::engine::ingress::TickQueue;
use crate::engine::windows::{RollingWindow, TrailingTracker};
use crate::metrics::{LatencyStats, Metrics};
use crate::notify::NotificationHandle;
use crate::push::Broadcaster;
use crate::state::LiveState;
use crate::types::{render_message, AlertKind, AlertRecord, Tick, UserSettings};

pub struct AlertEvaluator {
    caches: Arc<EngineCaches>,
    live: Arc<LiveState>,
    metrics: Arc<Metrics>,
    latency: Arc<LatencyStats>,
    broadcaster: Broadcaster,
    notify: NotificationHandle,
    alert_tx: mpsc::Sender<AlertRecord>,
    trailing: TrailingTracker,
    /// (user_id, instrument_token) → window state. Keyed per user because the
    /// window length is user-configurable.
    rolling: HashMap<(i64, u32), RollingWindow>,
    /// (user_id, symbol, kind) → last emit, ms epoch.
    cooldowns: HashMap<(i64, String, AlertKind), u64>,
    /// Cache generation at the last per-user state sweep.
    seen_generation: u64,
    /// Monotone clamp over the wall clock.
    last_now_ms: u64,
}

impl AlertEvaluator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        caches: Arc<EngineCaches>,
        live: Arc<LiveState>,
        metrics: Arc<Metrics>,
        latency: Arc<LatencyStats>,
        broadcaster: Broadcaster,
        notify: NotificationHandle,
        alert_tx: mpsc::Sender<AlertRecord>,
    ) -> Self {
        Self {
            caches,
            live,
            metrics,
            latency,
            broadcaster,
            notify,
            alert_tx,
            trailing: TrailingTracker::new(),
            rolling: HashMap::new(),
            cooldowns: HashMap::new(),
            seen_generation: 0,
            last_now_ms: 0,
        }
    }

    pub async fn run(mut self, queue: Arc<TickQueue>, mut shutdown: watch::Receiver<bool>) {
        info!("alert pipeline started");
        loop {
            tokio::select! {
                batch = queue.recv() => match batch {
                    Some(batch) => self.process_batch(batch),
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }

        // Ingress is closed by now; drain what is already queued, bounded by
        // the shutdown deadline.
        let deadline = Instant::now() + Duration::from_secs(SHUTDOWN_DRAIN_SECS);
        while Instant::now() < deadline {
            match queue.try_recv() {
                Some(batch) => self.process_batch(batch),
                None => break,
            }
        }
        info!("alert pipeline stopped");
    }

    pub fn process_batch(&mut self, batch: Vec<Tick>) {
        self.maybe_sweep_state();
        for tick in &batch {
            let started = Instant::now();
            let now_ms = self.monotonic_now_ms();
            self.process_tick(tick, now_ms, started);
        }
    }

    /// Evaluate one tick at logical time `now_ms`. Infallible by contract: a
    /// bad input skips one user's evaluation with a counter, never the loop.
    fn process_tick(&mut self, tick: &Tick, now_ms: u64, started: Instant) {
        let token = tick.instrument_token;
        let price = tick.last_price;

        let subscriptions = self.caches.subscriptions();
        let Some(subscribers) = subscriptions.subscribers(token) else {
            // The vast majority of upstream ticks match no watchlist.
            return;
        };
        let settings_map = self.caches.settings();

        self.live.record(
            token,
            price,
            tick.exchange_timestamp.unwrap_or_else(|| ms_to_datetime(now_ms)),
        );

        // Trailing state is per instrument and advances exactly once per tick,
        // whatever the subscribers' modes are.
        let trailing = self.trailing.observe(token, price);

        for (user_id, symbol) in subscribers {
            let Some(settings) = settings_map.get(*user_id) else {
                continue;
            };
            let settings = Arc::clone(settings);

            let (dip, spike) = self.compose(*user_id, token, price, now_ms, &settings, trailing);
            if !dip.is_finite() || !spike.is_finite() {
                self.metrics.tick_faults.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                continue;
            }

            // Both kinds may fire on the same tick.
            if dip >= settings.dip_threshold {
                self.emit(*user_id, symbol, &settings, AlertKind::Dip, dip, price, now_ms, started);
            }
            if spike >= settings.rise_threshold {
                self.emit(*user_id, symbol, &settings, AlertKind::Spike, spike, price, now_ms, started);
            }
        }
    }

    /// `(dip%, spike%)` for one user under their mode. `Both` is a
    /// disjunction: element-wise max, either algorithm may fire.
    fn compose(
        &mut self,
        user_id: i64,
        token: u32,
        price: f64,
        now_ms: u64,
        settings: &UserSettings,
        trailing: (f64, f64),
    ) -> (f64, f64) {
        let mut dip = 0.0f64;
        let mut spike = 0.0f64;

        if settings.algo_mode.runs_trailing() {
            dip = dip.max(trailing.0);
            spike = spike.max(trailing.1);
        }

        if settings.algo_mode.runs_rolling() {
            let window_secs = settings.window_secs();
            let state = self
                .rolling
                .entry((user_id, token))
                .or_insert_with(|| RollingWindow::new(window_secs));
            // A changed timeframe invalidates the state; it rebuilds from
            // this tick onward.
            if state.window_secs() != window_secs {
                *state = RollingWindow::new(window_secs);
            }
            let (r_dip, r_spike) = state.observe(now_ms, price);
            dip = dip.max(r_dip);
            spike = spike.max(r_spike);
        }

        (dip, spike)
    }

    #[allow(clippy::too_many_arguments)]
    fn emit(
        &mut self,
        user_id: i64,
        symbol: &str,
        settings: &Arc<UserSettings>,
        kind: AlertKind,
        change_percent: f64,
        price: f64,
        now_ms: u64,
        started: Instant,
    ) {
        let key = (user_id, symbol.to_string(), kind);
        if let Some(&last) = self.cooldowns.get(&key) {
            if now_ms.saturating_sub(last) < settings.cooldown_ms() {
                self.metrics
                    .alerts_suppressed_by_cooldown
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return;
            }
        }

        let message = render_message(kind, symbol, change_percent, price);
        let record = AlertRecord {
            user_id,
            stock_symbol: symbol.to_string(),
            price,
            change_percent,
            alert_type: kind,
            timestamp: ms_to_datetime(now_ms),
            message,
        };

        self.cooldowns.insert(key, now_ms);
        self.metrics.alerts_emitted.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        info!(
            user_id,
            symbol,
            kind = %kind,
            "alert emitted: {kind} {symbol} {change_percent:.2}% @ {price:.2}"
        );

        if self.alert_tx.try_send(record.clone()).is_err() {
            self.metrics.alerts_lost.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            warn!("alert sink channel full, dropping record");
        }
        self.broadcaster.broadcast_alert(&record);
        self.notify.enqueue(Arc::clone(settings), record.message);
        self.latency.record(started.elapsed());
    }

    /// On a new cache generation, drop rolling states whose user vanished or
    /// whose window length changed, and cooldowns of vanished users.
    fn maybe_sweep_state(&mut self) {
        let generation = self.caches.generation();
        if generation == self.seen_generation {
            return;
        }
        self.seen_generation = generation;

        let settings_map = self.caches.settings();
        self.rolling.retain(|&(user_id, _), window| {
            settings_map
                .get(user_id)
                .is_some_and(|s| s.window_secs() == window.window_secs())
        });
        self.cooldowns.retain(|key, _| settings_map.contains(key.0));
    }

    fn monotonic_now_ms(&mut self) -> u64 {
        let raw = Utc::now().timestamp_millis().max(0) as u64;
        self.last_now_ms = self.last_now_ms.max(raw);
        self.last_now_ms
    }
}

fn ms_to_datetime(ms: u64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms as i64).unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::caches::{SettingsMap, SubscriptionTable};
    use crate::notify::NotificationEgress;
    use crate::types::{AlgoMode, WatchedStock};

    const MIN: u64 = 60_000;

    struct Rig {
        evaluator: AlertEvaluator,
        alerts: mpsc::Receiver<AlertRecord>,
        metrics: Arc<Metrics>,
        _egress: NotificationEgress,
    }

    impl Rig {
        fn tick(&mut self, token: u32, price: f64, now_ms: u64) {
            self.evaluator.maybe_sweep_state();
            let tick = Tick { instrument_token: token, last_price: price, exchange_timestamp: None };
            self.evaluator.process_tick(&tick, now_ms, Instant::now());
        }

        fn drain(&mut self) -> Vec<AlertRecord> {
            let mut out = Vec::new();
            while let Ok(record) = self.alerts.try_recv() {
                out.push(record);
            }
            out
        }
    }

    fn settings(user_id: i64, mode: AlgoMode) -> UserSettings {
        UserSettings {
            user_id,
            timeframe_minutes: 10,
            dip_threshold: 1.0,
            rise_threshold: 1.0,
            cooldown_minutes: 0,
            algo_mode: mode,
            email_enabled: false,
            whatsapp_enabled: false,
            telegram_enabled: false,
            email_address: None,
            whatsapp_number: None,
            telegram_chat_id: None,
        }
    }

    fn rig(settings_rows: Vec<UserSettings>, stocks: Vec<WatchedStock>) -> Rig {
        let metrics = Arc::new(Metrics::new());
        let caches = EngineCaches::new();
        caches.publish(
            SubscriptionTable::from_rows(&stocks),
            SettingsMap::from_rows(settings_rows),
        );
        let (alert_tx, alerts) = mpsc::channel(64);
        let (notify, egress) =
            NotificationEgress::new(Config::test_default(), 64, Arc::clone(&metrics));
        let evaluator = AlertEvaluator::new(
            caches,
            Arc::new(LiveState::new()),
            Arc::clone(&metrics),
            Arc::new(LatencyStats::new()),
            Broadcaster::new(16),
            notify,
            alert_tx,
        );
        Rig { evaluator, alerts, metrics, _egress: egress }
    }

    fn watch(user_id: i64, symbol: &str, token: u32) -> WatchedStock {
        WatchedStock { user_id, symbol: symbol.to_string(), instrument_token: token }
    }

    #[tokio::test]
    async fn trailing_dip_fires_one_alert() {
        let mut rig = rig(
            vec![settings(1, AlgoMode::Trailing)],
            vec![watch(1, "INFY", 123)],
        );
        rig.tick(123, 100.0, 0);
        rig.tick(123, 98.5, 1_000);

        let alerts = rig.drain();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertKind::Dip);
        assert!((alerts[0].change_percent - 1.5).abs() < 1e-9);
        assert_eq!(alerts[0].price, 98.5);
        assert!(alerts[0].message.contains("StormAlert: INFY"));
    }

    #[tokio::test]
    async fn trailing_spike_fires_one_alert() {
        let mut rig = rig(
            vec![settings(1, AlgoMode::Trailing)],
            vec![watch(1, "INFY", 123)],
        );
        rig.tick(123, 100.0, 0);
        rig.tick(123, 101.5, 1_000);

        let alerts = rig.drain();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertKind::Spike);
        assert!((alerts[0].change_percent - 1.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn rolling_dip_against_window_max() {
        let mut user = settings(1, AlgoMode::Rolling);
        user.rise_threshold = 50.0;
        let mut rig = rig(vec![user], vec![watch(1, "INFY", 123)]);

        rig.tick(123, 100.0, 0);
        rig.tick(123, 105.0, 60_000);
        rig.tick(123, 95.0, 120_000);

        let alerts = rig.drain();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertKind::Dip);
        let expected = (105.0 - 95.0) / 105.0 * 100.0;
        assert!((alerts[0].change_percent - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn rolling_expiry_suppresses_stale_extremes() {
        let mut user = settings(1, AlgoMode::Rolling);
        user.timeframe_minutes = 1;
        user.rise_threshold = 50.0;
        let mut rig = rig(vec![user], vec![watch(1, "INFY", 123)]);

        rig.tick(123, 100.0, 0);
        rig.tick(123, 120.0, 30_000);
        rig.tick(123, 105.0, 70_000);
        rig.drain();

        // The 100 and 120 points are out of the window by now; even though
        // the price sits below the historical high, nothing fires.
        rig.tick(123, 105.0, 100_000);
        assert!(rig.drain().is_empty());
    }

    #[tokio::test]
    async fn cooldown_suppresses_within_interval() {
        let mut user = settings(1, AlgoMode::Trailing);
        user.cooldown_minutes = 15;
        let mut rig = rig(vec![user], vec![watch(1, "INFY", 123)]);

        rig.tick(123, 100.0, 0);
        rig.tick(123, 98.0, 0); // 2% dip, fires
        rig.tick(123, 97.0, 5 * MIN); // still cooling down, suppressed
        rig.tick(123, 96.0, 16 * MIN); // cooldown elapsed, fires again

        let alerts = rig.drain();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].price, 98.0);
        assert_eq!(alerts[1].price, 96.0);
        assert_eq!(
            rig.metrics
                .alerts_suppressed_by_cooldown
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn cooldown_keys_are_per_kind() {
        let mut user = settings(1, AlgoMode::Trailing);
        user.cooldown_minutes = 60;
        user.dip_threshold = 5.0;
        user.rise_threshold = 5.0;
        let mut rig = rig(vec![user], vec![watch(1, "INFY", 123)]);

        rig.tick(123, 100.0, 0);
        rig.tick(123, 110.0, 1_000); // spike 10%
        rig.tick(123, 90.0, 2_000); // dip 18%; different kind, not suppressed

        let kinds: Vec<AlertKind> = rig.drain().iter().map(|a| a.alert_type).collect();
        assert_eq!(kinds, vec![AlertKind::Spike, AlertKind::Dip]);
    }

    #[tokio::test]
    async fn both_kinds_may_fire_on_one_tick() {
        let mut user = settings(1, AlgoMode::Trailing);
        user.dip_threshold = 5.0;
        user.rise_threshold = 5.0;
        let mut rig = rig(vec![user], vec![watch(1, "INFY", 123)]);

        rig.tick(123, 100.0, 0);
        rig.tick(123, 110.0, 1_000);
        rig.tick(123, 90.0, 2_000);
        rig.drain();

        // high=110, low=90: 100 is both a 9.09% dip and an 11.1% spike.
        rig.tick(123, 100.0, 3_000);
        let kinds: Vec<AlertKind> = rig.drain().iter().map(|a| a.alert_type).collect();
        assert_eq!(kinds, vec![AlertKind::Dip, AlertKind::Spike]);
    }

    #[tokio::test]
    async fn both_mode_takes_element_wise_max() {
        let mut user = settings(1, AlgoMode::Both);
        user.dip_threshold = 5.0;
        user.rise_threshold = 50.0;
        let mut rig = rig(vec![user], vec![watch(1, "INFY", 123)]);

        // Trailing high settles at 100.
        rig.tick(123, 100.0, 0);
        // Seed the user's rolling window with a 112 print the trailing state
        // never saw (e.g. it predates a mid-session state reset).
        rig.evaluator
            .rolling
            .get_mut(&(1, 123))
            .unwrap()
            .observe(60_000, 112.0);

        // At 97 trailing says 3% (under threshold) while rolling says 13.4%.
        rig.tick(123, 97.0, 120_000);
        let alerts = rig.drain();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertKind::Dip);
        let expected = (112.0 - 97.0) / 112.0 * 100.0;
        assert!((alerts[0].change_percent - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn both_mode_does_not_fire_when_both_below_threshold() {
        let mut user = settings(1, AlgoMode::Both);
        user.dip_threshold = 5.0;
        user.rise_threshold = 50.0;
        let mut rig = rig(vec![user], vec![watch(1, "INFY", 123)]);

        rig.tick(123, 100.0, 0);
        rig.tick(123, 97.0, 60_000); // 3% on both algorithms
        assert!(rig.drain().is_empty());
    }

    #[tokio::test]
    async fn unmatched_token_is_discarded() {
        let mut rig = rig(
            vec![settings(1, AlgoMode::Trailing)],
            vec![watch(1, "INFY", 123)],
        );
        rig.tick(999, 100.0, 0);
        rig.tick(999, 50.0, 1_000);
        assert!(rig.drain().is_empty());
        assert_eq!(rig.evaluator.trailing.instrument_count(), 0);
    }

    #[tokio::test]
    async fn missing_settings_skips_user() {
        // Watchlist row without a settings row.
        let mut rig = rig(vec![], vec![watch(1, "INFY", 123)]);
        rig.tick(123, 100.0, 0);
        rig.tick(123, 90.0, 1_000);
        assert!(rig.drain().is_empty());
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let mut rig = rig(
            vec![settings(1, AlgoMode::Trailing)],
            vec![watch(1, "INFY", 123)],
        );
        rig.evaluator.process_batch(vec![]);
        assert!(rig.drain().is_empty());
        assert_eq!(rig.evaluator.trailing.instrument_count(), 0);
    }

    #[tokio::test]
    async fn identical_inputs_yield_identical_alert_sets() {
        let run = |stock_order: Vec<WatchedStock>| {
            let mut rig = rig(
                vec![settings(1, AlgoMode::Trailing), settings(2, AlgoMode::Trailing)],
                stock_order,
            );
            rig.tick(123, 100.0, 0);
            rig.tick(123, 98.0, 1_000);
            rig.drain()
                .iter()
                .map(|a| (a.user_id, a.alert_type, a.change_percent.to_bits()))
                .collect::<Vec<_>>()
        };

        let a = run(vec![watch(1, "INFY", 123), watch(2, "INFY", 123)]);
        let b = run(vec![watch(2, "INFY", 123), watch(1, "INFY", 123)]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
    }

    #[tokio::test]
    async fn timeframe_change_invalidates_rolling_state() {
        let mut user = settings(1, AlgoMode::Rolling);
        user.rise_threshold = 50.0;
        let caches_user = user.clone();
        let mut rig = rig(vec![user], vec![watch(1, "INFY", 123)]);

        rig.tick(123, 100.0, 0);
        rig.tick(123, 120.0, 30_000);
        rig.drain();

        // Republish with a different timeframe; the sweep drops the state and
        // the next tick starts a fresh window, so no dip fires against 120.
        let mut changed = caches_user;
        changed.timeframe_minutes = 5;
        rig.evaluator.caches.publish(
            SubscriptionTable::from_rows(&[watch(1, "INFY", 123)]),
            SettingsMap::from_rows(vec![changed]),
        );
        rig.tick(123, 100.0, 60_000);
        assert!(rig.drain().is_empty());
        assert_eq!(
            rig.evaluator.rolling.get(&(1, 123)).unwrap().window_secs(),
            300
        );
    }

    #[tokio::test]
    async fn removed_user_state_is_swept() {
        let mut rig = rig(
            vec![settings(1, AlgoMode::Rolling)],
            vec![watch(1, "INFY", 123)],
        );
        rig.tick(123, 100.0, 0);
        assert!(rig.evaluator.rolling.contains_key(&(1, 123)));

        rig.evaluator
            .caches
            .publish(SubscriptionTable::from_rows(&[]), SettingsMap::from_rows(vec![]));
        rig.evaluator.process_batch(vec![]);
        assert!(rig.evaluator.rolling.is_empty());
        assert!(rig.evaluator.cooldowns.is_empty());
    }
}
