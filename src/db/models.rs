//! Database row types. Used by sqlx for typed fetches; conversions into the
//! in-memory domain types live here too.

use tracing::warn;

use crate::types::{AlgoMode, UserSettings, WatchedStock};

#[derive(Debug, sqlx::FromRow)]
pub struct SettingsRow {
    pub user_id: i64,
    pub timeframe_minutes: i64,
    pub dip_threshold: f64,
    pub rise_threshold: f64,
    pub cooldown_minutes: i64,
    pub algo_mode: String,
    pub email_enabled: i64,
    pub whatsapp_enabled: i64,
    pub telegram_enabled: i64,
    pub email_address: Option<String>,
    pub whatsapp_number: Option<String>,
    pub telegram_chat_id: Option<String>,
}

impl From<SettingsRow> for UserSettings {
    fn from(row: SettingsRow) -> Self {
        let algo_mode = AlgoMode::parse(&row.algo_mode).unwrap_or_else(|| {
            warn!(user_id = row.user_id, mode = %row.algo_mode, "unknown algo_mode, defaulting to both");
            AlgoMode::Both
        });
        UserSettings {
            user_id: row.user_id,
            timeframe_minutes: row.timeframe_minutes.max(1) as u32,
            dip_threshold: row.dip_threshold,
            rise_threshold: row.rise_threshold,
            cooldown_minutes: row.cooldown_minutes.max(0) as u32,
            algo_mode,
            email_enabled: row.email_enabled != 0,
            whatsapp_enabled: row.whatsapp_enabled != 0,
            telegram_enabled: row.telegram_enabled != 0,
            email_address: row.email_address,
            whatsapp_number: row.whatsapp_number,
            telegram_chat_id: row.telegram_chat_id,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct StockRow {
    pub user_id: i64,
    pub symbol: String,
    pub instrument_token: i64,
}

impl From<StockRow> for WatchedStock {
    fn from(row: StockRow) -> Self {
        WatchedStock {
            user_id: row.user_id,
            symbol: row.symbol,
            instrument_token: row.instrument_token as u32,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct AlertRow {
    pub id: i64,
    pub user_id: i64,
    pub stock_symbol: String,
    pub price: f64,
    pub change_percent: f64,
    pub alert_type: String,
    /// Millisecond UTC epoch.
    pub timestamp: i64,
    pub message: String,
}

#[derive(Debug, sqlx::FromRow)]
pub struct SystemStateRow {
    pub access_token: Option<String>,
    pub date_received: i64,
    pub expires_at: i64,
    pub status: String,
}
