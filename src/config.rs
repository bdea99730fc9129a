use crate::error::{AppError, Result};

pub const FEED_WS_URL: &str = "wss://ws.kite.trade";

/// Capacity of the ingress tick queue, in batches. Overflow drops the oldest
/// batch; the upstream socket task must never block.
pub const TICK_QUEUE_CAPACITY: usize = 1024;

/// Channel capacity for internal message routing.
pub const CHANNEL_CAPACITY: usize = 1024;

/// Alert writer flush interval (seconds).
pub const FLUSH_INTERVAL_SECS: u64 = 1;

/// Flush immediately once this many records are buffered.
pub const FLUSH_HIGH_WATER: usize = 1_000;

/// Hard cap on the persistence buffer; oldest records are shed beyond this.
pub const PERSIST_BUFFER_CAP: usize = 10_000;

/// Cache refresh interval (seconds) for settings and watchlists.
pub const CACHE_REFRESH_INTERVAL_SECS: u64 = 60;

/// Retention sweep interval (seconds).
pub const RETENTION_INTERVAL_SECS: u64 = 86_400;

/// Alerts older than this many days are deleted by the retention sweep.
pub const ALERT_RETENTION_DAYS: i64 = 30;

/// Token-expiry watchdog interval (seconds).
pub const WATCHDOG_INTERVAL_SECS: u64 = 60;

/// Heartbeat ping interval (seconds).
pub const WS_PING_INTERVAL_SECS: u64 = 30;

/// Reconnect backoff values in milliseconds.
pub const RECONNECT_BACKOFF_MS: &[u64] = &[100, 200, 400, 800, 1600, 3200];

/// Maximum instrument tokens per WS subscribe frame.
pub const WS_SUBSCRIBE_CHUNK_SIZE: usize = 500;

/// Every store call is bounded by this timeout (seconds).
pub const STORE_TIMEOUT_SECS: u64 = 5;

/// Deadline for draining the tick queue on shutdown (seconds).
pub const SHUTDOWN_DRAIN_SECS: u64 = 5;

/// Points of per-token price history kept for the status API.
pub const PRICE_HISTORY_POINTS: usize = 30;

/// Delivery attempts per notification channel (doubling backoff between).
pub const NOTIFY_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct Config {
    pub feed_ws_url: String,
    pub feed_api_key: String,
    pub feed_api_secret: String,
    pub log_level: String,
    pub db_path: String,
    pub api_port: u16,
    /// Hardened mode: missing feed credentials become a startup error.
    pub production_mode: bool,
    pub telegram_bot_token: Option<String>,
    pub twilio_sid: Option<String>,
    pub twilio_auth_token: Option<String>,
    pub twilio_from_number: Option<String>,
    /// Optional HTTP relay that accepts email delivery jobs.
    pub email_relay_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let production_mode = std::env::var("PRODUCTION_MODE")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let feed_api_key = std::env::var("KITE_API_KEY").unwrap_or_default();
        let feed_api_secret = std::env::var("KITE_API_SECRET").unwrap_or_default();

        if production_mode && (feed_api_key.is_empty() || feed_api_secret.is_empty()) {
            return Err(AppError::Config(
                "PRODUCTION_MODE requires KITE_API_KEY and KITE_API_SECRET".to_string(),
            ));
        }

        Ok(Self {
            feed_ws_url: std::env::var("FEED_WS_URL").unwrap_or_else(|_| FEED_WS_URL.to_string()),
            feed_api_key,
            feed_api_secret,
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "stormalert.db".to_string()),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "8002".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            production_mode,
            telegram_bot_token: env_opt("TELEGRAM_BOT_TOKEN"),
            twilio_sid: env_opt("TWILIO_SID"),
            twilio_auth_token: env_opt("TWILIO_AUTH_TOKEN"),
            twilio_from_number: env_opt("TWILIO_FROM_NUMBER"),
            email_relay_url: env_opt("EMAIL_RELAY_URL"),
        })
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
impl Config {
    pub fn test_default() -> Self {
        Self {
            feed_ws_url: FEED_WS_URL.to_string(),
            feed_api_key: String::new(),
            feed_api_secret: String::new(),
            log_level: "info".to_string(),
            db_path: ":memory:".to_string(),
            api_port: 0,
            production_mode: false,
            telegram_bot_token: None,
            twilio_sid: None,
            twilio_auth_token: None,
            twilio_from_number: None,
            email_relay_url: None,
        }
    }
}
