use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Tick
// ---------------------------------------------------------------------------

/// One price observation for one instrument. Batches of these are the unit of
/// throughput through the whole pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub instrument_token: u32,
    pub last_price: f64,
    /// Exchange-side timestamp when the feed provides one.
    pub exchange_timestamp: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Settings / watchlist
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlgoMode {
    Trailing,
    Rolling,
    Both,
}

impl AlgoMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "trailing" => Some(AlgoMode::Trailing),
            "rolling" => Some(AlgoMode::Rolling),
            "both" => Some(AlgoMode::Both),
            _ => None,
        }
    }

    pub fn runs_trailing(self) -> bool {
        matches!(self, AlgoMode::Trailing | AlgoMode::Both)
    }

    pub fn runs_rolling(self) -> bool {
        matches!(self, AlgoMode::Rolling | AlgoMode::Both)
    }
}

impl std::fmt::Display for AlgoMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AlgoMode::Trailing => "trailing",
            AlgoMode::Rolling => "rolling",
            AlgoMode::Both => "both",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSettings {
    pub user_id: i64,
    pub timeframe_minutes: u32,
    pub dip_threshold: f64,
    pub rise_threshold: f64,
    pub cooldown_minutes: u32,
    pub algo_mode: AlgoMode,
    pub email_enabled: bool,
    pub whatsapp_enabled: bool,
    pub telegram_enabled: bool,
    pub email_address: Option<String>,
    pub whatsapp_number: Option<String>,
    pub telegram_chat_id: Option<String>,
}

impl UserSettings {
    pub fn window_secs(&self) -> u64 {
        u64::from(self.timeframe_minutes) * 60
    }

    pub fn cooldown_ms(&self) -> u64 {
        u64::from(self.cooldown_minutes) * 60_000
    }
}

/// One active watchlist row: a user watching one instrument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedStock {
    pub user_id: i64,
    pub symbol: String,
    pub instrument_token: u32,
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertKind {
    Dip,
    Spike,
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertKind::Dip => write!(f, "DIP"),
            AlertKind::Spike => write!(f, "SPIKE"),
        }
    }
}

impl AlertKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DIP" => Some(AlertKind::Dip),
            "SPIKE" => Some(AlertKind::Spike),
            _ => None,
        }
    }
}

/// Append-only record of one emitted alert. `change_percent` is a
/// non-negative magnitude for both kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    pub user_id: i64,
    pub stock_symbol: String,
    pub price: f64,
    pub change_percent: f64,
    pub alert_type: AlertKind,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Serialized to every connected push client when an alert fires.
#[derive(Debug, Clone, Serialize)]
pub struct PushEvent<'a> {
    #[serde(rename = "type")]
    pub event_type: &'static str,
    pub data: &'a AlertRecord,
}

impl<'a> PushEvent<'a> {
    pub fn alert_new(record: &'a AlertRecord) -> Self {
        Self { event_type: "ALERT_NEW", data: record }
    }
}

/// Rendering constant: alert prices are always shown in rupees.
const CURRENCY: &str = "₹";

/// Fixed alert message template: header, direction glyph and phrase by kind,
/// percent and price to two decimals.
pub fn render_message(kind: AlertKind, symbol: &str, change_percent: f64, price: f64) -> String {
    let (emoji, action, phrase) = match kind {
        AlertKind::Dip => (
            "📉",
            "Price Dropped",
            "This stock has dropped significantly! Act accordingly.",
        ),
        AlertKind::Spike => ("📈", "Price Spiked", "Momentum is building up! Fast."),
    };
    format!(
        "🚨 *StormAlert: {symbol}*\n{emoji} *{action}:* {change_percent:.2}%\n💰 *Current Price:* {CURRENCY}{price:.2}\n_{phrase}_"
    )
}

// ---------------------------------------------------------------------------
// System token state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SystemToken {
    pub access_token: Option<String>,
    pub date_received: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: TokenStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TokenStatus {
    Online,
    Offline,
}

impl std::fmt::Display for TokenStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenStatus::Online => write!(f, "ONLINE"),
            TokenStatus::Offline => write!(f, "OFFLINE"),
        }
    }
}

// ---------------------------------------------------------------------------
// Channel message types
// ---------------------------------------------------------------------------

/// Control messages for the feed adapter's subscription management.
#[derive(Debug)]
pub enum ControlMsg {
    Subscribe(Vec<u32>),
    Unsubscribe(Vec<u32>),
    /// Swap credentials and re-establish the upstream session. `None` drops
    /// into the degraded no-tick state.
    Restart(Option<String>),
}
