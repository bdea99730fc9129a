use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::config::PRICE_HISTORY_POINTS;

#[derive(Debug, Clone, Serialize)]
pub struct PricePoint {
    pub price: f64,
    pub time: DateTime<Utc>,
}

/// Last price and a short tail of history per subscribed instrument.
/// Written by the pipeline task, read concurrently by the status API.
pub struct LiveState {
    last_prices: DashMap<u32, f64>,
    history: DashMap<u32, VecDeque<PricePoint>>,
}

impl LiveState {
    pub fn new() -> Self {
        Self { last_prices: DashMap::new(), history: DashMap::new() }
    }

    pub fn record(&self, token: u32, price: f64, time: DateTime<Utc>) {
        self.last_prices.insert(token, price);
        let mut points = self.history.entry(token).or_default();
        points.push_back(PricePoint { price, time });
        while points.len() > PRICE_HISTORY_POINTS {
            points.pop_front();
        }
    }

    pub fn last_price(&self, token: u32) -> Option<f64> {
        self.last_prices.get(&token).map(|p| *p)
    }

    pub fn history(&self, token: u32) -> Vec<PricePoint> {
        self.history
            .get(&token)
            .map(|points| points.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn instrument_count(&self) -> usize {
        self.last_prices.len()
    }
}

impl Default for LiveState {
    fn default() -> Self {
        Self::new()
    }
}
