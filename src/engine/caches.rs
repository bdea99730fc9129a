//! Read-mostly caches fanned out to by the pipeline: instrument → subscribers
//! and user → settings. The refresher builds replacements off-line and
//! publishes them with an atomic pointer swap; readers hold one snapshot for
//! the duration of a tick.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::types::{UserSettings, WatchedStock};

// ---------------------------------------------------------------------------
// SubscriptionTable
// ---------------------------------------------------------------------------

/// instrument_token → ordered `(user_id, symbol)` subscribers, built from the
/// active watchlist rows. Entries are sorted so fan-out order (and therefore
/// the emitted alert set) is independent of store iteration order.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SubscriptionTable {
    map: HashMap<u32, Vec<(i64, String)>>,
}

impl SubscriptionTable {
    pub fn from_rows(rows: &[WatchedStock]) -> Self {
        let mut map: HashMap<u32, Vec<(i64, String)>> = HashMap::new();
        for row in rows {
            map.entry(row.instrument_token)
                .or_default()
                .push((row.user_id, row.symbol.clone()));
        }
        for subscribers in map.values_mut() {
            subscribers.sort();
            subscribers.dedup();
        }
        Self { map }
    }

    pub fn subscribers(&self, token: u32) -> Option<&[(i64, String)]> {
        self.map.get(&token).map(|v| v.as_slice())
    }

    /// Union of watched instrument tokens, sorted ascending.
    pub fn tokens(&self) -> Vec<u32> {
        let mut tokens: Vec<u32> = self.map.keys().copied().collect();
        tokens.sort_unstable();
        tokens
    }

    pub fn instrument_count(&self) -> usize {
        self.map.len()
    }
}

// ---------------------------------------------------------------------------
// SettingsMap
// ---------------------------------------------------------------------------

#[derive(Debug, Default, PartialEq)]
pub struct SettingsMap {
    map: HashMap<i64, Arc<UserSettings>>,
}

impl SettingsMap {
    pub fn from_rows(rows: Vec<UserSettings>) -> Self {
        let map = rows.into_iter().map(|s| (s.user_id, Arc::new(s))).collect();
        Self { map }
    }

    pub fn get(&self, user_id: i64) -> Option<&Arc<UserSettings>> {
        self.map.get(&user_id)
    }

    pub fn contains(&self, user_id: i64) -> bool {
        self.map.contains_key(&user_id)
    }

    pub fn user_count(&self) -> usize {
        self.map.len()
    }
}

// ---------------------------------------------------------------------------
// EngineCaches
// ---------------------------------------------------------------------------

/// The published snapshots plus a generation counter. The pipeline compares
/// generations to notice a republication and garbage-collect per-user state
/// for users that disappeared.
pub struct EngineCaches {
    subscriptions: ArcSwap<SubscriptionTable>,
    settings: ArcSwap<SettingsMap>,
    generation: AtomicU64,
}

impl EngineCaches {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscriptions: ArcSwap::from_pointee(SubscriptionTable::default()),
            settings: ArcSwap::from_pointee(SettingsMap::default()),
            generation: AtomicU64::new(0),
        })
    }

    /// Atomically expose a freshly built pair of snapshots.
    pub fn publish(&self, subscriptions: SubscriptionTable, settings: SettingsMap) {
        self.subscriptions.store(Arc::new(subscriptions));
        self.settings.store(Arc::new(settings));
        self.generation.fetch_add(1, Ordering::Release);
    }

    pub fn subscriptions(&self) -> Arc<SubscriptionTable> {
        self.subscriptions.load_full()
    }

    pub fn settings(&self) -> Arc<SettingsMap> {
        self.settings.load_full()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Current union of watched instrument tokens; the feed adapter diffs
    /// this against its live subscription set.
    pub fn subscribed_tokens(&self) -> Vec<u32> {
        self.subscriptions.load().tokens()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AlgoMode;

    fn stock(user_id: i64, symbol: &str, token: u32) -> WatchedStock {
        WatchedStock { user_id, symbol: symbol.to_string(), instrument_token: token }
    }

    fn settings(user_id: i64) -> UserSettings {
        UserSettings {
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
        }
    }

    #[test]
    fn table_fans_out_in_sorted_order_regardless_of_row_order() {
        let a = SubscriptionTable::from_rows(&[
            stock(2, "INFY", 123),
            stock(1, "INFY", 123),
            stock(1, "TCS", 456),
        ]);
        let b = SubscriptionTable::from_rows(&[
            stock(1, "TCS", 456),
            stock(1, "INFY", 123),
            stock(2, "INFY", 123),
        ]);
        assert_eq!(a, b);
        assert_eq!(
            a.subscribers(123).unwrap(),
            &[(1, "INFY".to_string()), (2, "INFY".to_string())]
        );
    }

    #[test]
    fn tokens_is_union_of_active_rows() {
        let table = SubscriptionTable::from_rows(&[
            stock(1, "INFY", 408065),
            stock(2, "INFY", 408065),
            stock(1, "TCS", 2953217),
        ]);
        assert_eq!(table.tokens(), vec![408065, 2953217]);
        assert_eq!(table.instrument_count(), 2);
    }

    #[test]
    fn miss_yields_no_subscribers() {
        let table = SubscriptionTable::from_rows(&[stock(1, "INFY", 123)]);
        assert!(table.subscribers(999).is_none());
    }

    #[test]
    fn publish_swaps_snapshots_and_bumps_generation() {
        let caches = EngineCaches::new();
        assert_eq!(caches.generation(), 0);
        assert!(caches.subscribed_tokens().is_empty());

        caches.publish(
            SubscriptionTable::from_rows(&[stock(1, "INFY", 123)]),
            SettingsMap::from_rows(vec![settings(1)]),
        );

        assert_eq!(caches.generation(), 1);
        assert_eq!(caches.subscribed_tokens(), vec![123]);
        assert!(caches.settings().contains(1));
    }

    #[test]
    fn rebuild_from_unchanged_rows_is_identical() {
        let rows = vec![stock(1, "INFY", 123), stock(2, "SBIN", 779521)];
        assert_eq!(SubscriptionTable::from_rows(&rows), SubscriptionTable::from_rows(&rows));
        assert_eq!(
            SettingsMap::from_rows(vec![settings(1), settings(2)]),
            SettingsMap::from_rows(vec![settings(2), settings(1)]),
        );
    }
}
