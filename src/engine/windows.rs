//! The two sliding-window algorithms. Both are pure state machines driven by
//! `(time, price)` updates; all I/O lives in the surrounding pipeline.

use std::collections::{HashMap, VecDeque};

// ---------------------------------------------------------------------------
// Trailing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Extremes {
    high: f64,
    low: f64,
}

/// Running high/low per instrument since first sight, for process lifetime.
/// Shared across users; the algorithm has no user-dependent parameter.
#[derive(Debug, Default)]
pub struct TrailingTracker {
    state: HashMap<u32, Extremes>,
}

impl TrailingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one price; returns `(dip%, spike%)` against the updated extremes.
    /// First sight of an instrument yields `(0, 0)`.
    ///
    /// Prices are strictly positive by the time they reach the windowing core
    /// (ingress rejects the rest), so the divisions are safe.
    pub fn observe(&mut self, token: u32, price: f64) -> (f64, f64) {
        debug_assert!(price > 0.0);
        let Some(ext) = self.state.get_mut(&token) else {
            self.state.insert(token, Extremes { high: price, low: price });
            return (0.0, 0.0);
        };

        if price > ext.high {
            ext.high = price;
        }
        if price < ext.low {
            ext.low = price;
        }

        let dip = (ext.high - price) / ext.high * 100.0;
        let spike = (price - ext.low) / ext.low * 100.0;
        (dip, spike)
    }

    pub fn instrument_count(&self) -> usize {
        self.state.len()
    }
}

// ---------------------------------------------------------------------------
// Rolling window
// ---------------------------------------------------------------------------

/// Sliding min/max over a fixed wall-clock window, via monotone deques.
///
/// `min_mono` is strictly increasing by price (head = window minimum),
/// `max_mono` strictly decreasing (head = window maximum). Each point enters
/// and leaves each deque at most once, so updates are amortized O(1).
#[derive(Debug)]
pub struct RollingWindow {
    window_ms: u64,
    /// Every in-window point, oldest first. Kept for invariant checks and the
    /// occasional debug dump; the monotone deques alone answer min/max.
    data: VecDeque<(u64, f64)>,
    min_mono: VecDeque<(u64, f64)>,
    max_mono: VecDeque<(u64, f64)>,
}

impl RollingWindow {
    pub fn new(window_secs: u64) -> Self {
        Self {
            window_ms: window_secs * 1_000,
            data: VecDeque::new(),
            min_mono: VecDeque::new(),
            max_mono: VecDeque::new(),
        }
    }

    pub fn window_secs(&self) -> u64 {
        self.window_ms / 1_000
    }

    /// Feed one `(t, price)` point; returns `(dip%, spike%)` against the
    /// window extremes after expiry and insertion. Points strictly older than
    /// the window (`t − t' > W`) are evicted; a point exactly `W` old stays.
    pub fn observe(&mut self, t_ms: u64, price: f64) -> (f64, f64) {
        debug_assert!(price > 0.0);
        let (min, max) = self.update(t_ms, price);
        if max == 0.0 {
            return (0.0, 0.0);
        }
        let dip = (max - price) / max * 100.0;
        let spike = (price - min) / min * 100.0;
        (dip, spike)
    }

    /// Returns `(window_min, window_max)` after applying the point.
    fn update(&mut self, t_ms: u64, price: f64) -> (f64, f64) {
        let window_ms = self.window_ms;
        let expired = move |t0: u64| t_ms.saturating_sub(t0) > window_ms;

        while self.data.front().is_some_and(|&(t0, _)| expired(t0)) {
            self.data.pop_front();
        }
        while self.min_mono.front().is_some_and(|&(t0, _)| expired(t0)) {
            self.min_mono.pop_front();
        }
        while self.max_mono.front().is_some_and(|&(t0, _)| expired(t0)) {
            self.max_mono.pop_front();
        }

        while self.min_mono.back().is_some_and(|&(_, p)| p >= price) {
            self.min_mono.pop_back();
        }
        self.min_mono.push_back((t_ms, price));

        while self.max_mono.back().is_some_and(|&(_, p)| p <= price) {
            self.max_mono.pop_back();
        }
        self.max_mono.push_back((t_ms, price));

        self.data.push_back((t_ms, price));

        // Both deques are non-empty: the new point was just appended.
        (self.min_mono[0].1, self.max_mono[0].1)
    }
}
