use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::warn;

use crate::types::Tick;

static PARSE_FAILURES: AtomicU64 = AtomicU64::new(0);

/// One tick as it appears on the wire. Fields are optional so a partial or
/// foreign object degrades to a skipped tick, not a dropped frame.
#[derive(Debug, Deserialize, Clone)]
pub struct RawTick {
    pub instrument_token: Option<i64>,
    pub last_price: Option<f64>,
    /// RFC 3339 when present.
    pub exchange_timestamp: Option<String>,
}

/// Raw deserializable shape covering the feed's text frames. Tick batches
/// carry `type = "ticks"`; everything else (order updates, acks) is noise to
/// this engine.
#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    frame_type: Option<String>,
    data: Option<Vec<RawTick>>,
}

/// Parse a raw WebSocket text frame into zero or more ticks.
///
/// Frames arrive as a single JSON object or an array of objects. Unknown
/// frame types yield nothing; unparseable frames bump a counter and log a
/// sample so a wire-format change is visible without flooding.
pub fn parse_feed_frame(raw: &str) -> Vec<Tick> {
    let frames: Vec<RawFrame> = if raw.trim_start().starts_with('[') {
        serde_json::from_str(raw).unwrap_or_default()
    } else {
        match serde_json::from_str::<RawFrame>(raw) {
            Ok(f) => vec![f],
            Err(_) => vec![],
        }
    };

    if frames.is_empty() {
        let count = PARSE_FAILURES.fetch_add(1, Ordering::Relaxed) + 1;
        if count <= 10 || count % 1000 == 0 {
            let sample = &raw[..500.min(raw.len())];
            warn!(count, "[FEED PARSE] unrecognized frame: {sample}");
        }
        return vec![];
    }

    let mut ticks = Vec::new();
    for frame in frames {
        if frame.frame_type.as_deref() != Some("ticks") {
            continue;
        }
        for raw_tick in frame.data.unwrap_or_default() {
            if let Some(tick) = shape_tick(raw_tick) {
                ticks.push(tick);
            }
        }
    }
    ticks
}

/// Rejects ticks missing a token or price, or whose token does not fit the
/// instrument id space. Price-range validation belongs to ingress.
fn shape_tick(raw: RawTick) -> Option<Tick> {
    let token = raw.instrument_token?;
    let token = u32::try_from(token).ok()?;
    let last_price = raw.last_price?;
    let exchange_timestamp = raw
        .exchange_timestamp
        .as_deref()
        .and_then(|s| s.parse::<DateTime<Utc>>().ok());
    Some(Tick { instrument_token: token, last_price, exchange_timestamp })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tick_batch() {
        let raw = r#"{"type":"ticks","data":[
            {"instrument_token":408065,"last_price":1520.5},
            {"instrument_token":2953217,"last_price":3999.0,"exchange_timestamp":"2024-03-01T10:15:00Z"}
        ]}"#;
        let ticks = parse_feed_frame(raw);
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[0].instrument_token, 408065);
        assert!((ticks[0].last_price - 1520.5).abs() < 1e-9);
        assert!(ticks[0].exchange_timestamp.is_none());
        assert!(ticks[1].exchange_timestamp.is_some());
    }

    #[test]
    fn parses_array_of_frames() {
        let raw = r#"[
            {"type":"ticks","data":[{"instrument_token":1,"last_price":10.0}]},
            {"type":"ticks","data":[{"instrument_token":2,"last_price":20.0}]}
        ]"#;
        let ticks = parse_feed_frame(raw);
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[1].instrument_token, 2);
    }

    #[test]
    fn skips_malformed_entries_within_a_batch() {
        let raw = r#"{"type":"ticks","data":[
            {"instrument_token":1,"last_price":10.0},
            {"last_price":11.0},
            {"instrument_token":2},
            {"instrument_token":-5,"last_price":12.0}
        ]}"#;
        let ticks = parse_feed_frame(raw);
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].instrument_token, 1);
    }

    #[test]
    fn non_tick_frames_are_ignored() {
        let raw = r#"{"type":"order_update","data":[]}"#;
        assert!(parse_feed_frame(raw).is_empty());
    }

    #[test]
    fn garbage_returns_empty() {
        assert!(parse_feed_frame("not json at all").is_empty());
        assert!(parse_feed_frame(r#"{"totally":"unrelated"}"#).is_empty());
    }

    #[test]
    fn bad_timestamp_degrades_to_none() {
        let raw = r#"{"type":"ticks","data":[{"instrument_token":1,"last_price":10.0,"exchange_timestamp":"yesterday"}]}"#;
        let ticks = parse_feed_frame(raw);
        assert_eq!(ticks.len(), 1);
        assert!(ticks[0].exchange_timestamp.is_none());
    }
}
