//! SQLite-backed store. All engine persistence flows through these few
//! operations; callers wrap each one in the store timeout.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tracing::info;

use crate::db::models::{AlertRow, SettingsRow, StockRow, SystemStateRow};
use crate::error::Result;
use crate::types::{AlertKind, AlertRecord, SystemToken, TokenStatus, UserSettings, WatchedStock};

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(db_path: &str) -> Result<Self> {
        // An in-memory database exists per connection, so the pool must be
        // pinned to a single connection that never retires.
        let pool = if db_path == ":memory:" {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect("sqlite::memory:")
                .await?
        } else {
            SqlitePool::connect(&format!("sqlite://{db_path}?mode=rwc")).await?
        };
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("database ready at {db_path}");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn load_all_settings(&self) -> Result<Vec<UserSettings>> {
        let rows: Vec<SettingsRow> = sqlx::query_as(
            r#"
            SELECT user_id, timeframe_minutes, dip_threshold, rise_threshold,
                   cooldown_minutes, algo_mode, email_enabled, whatsapp_enabled,
                   telegram_enabled, email_address, whatsapp_number, telegram_chat_id
            FROM settings
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(UserSettings::from).collect())
    }

    pub async fn load_active_stocks(&self) -> Result<Vec<WatchedStock>> {
        let rows: Vec<StockRow> = sqlx::query_as(
            "SELECT user_id, symbol, instrument_token FROM stocks WHERE active = 1",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(WatchedStock::from).collect())
    }

    /// Single-transaction bulk insert; batch order is preserved.
    pub async fn bulk_insert_alerts(&self, records: &[AlertRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(
                r#"
                INSERT INTO alerts (user_id, stock_symbol, price, change_percent, alert_type, timestamp, message)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(record.user_id)
            .bind(&record.stock_symbol)
            .bind(record.price)
            .bind(record.change_percent)
            .bind(record.alert_type.to_string())
            .bind(record.timestamp.timestamp_millis())
            .bind(&record.message)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Returns the number of deleted rows.
    pub async fn delete_alerts_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM alerts WHERE timestamp < ?")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Activity log query, newest first. `min_change` compares against the
    /// stored non-negative magnitude.
    pub async fn recent_alerts(
        &self,
        limit: i64,
        min_change: f64,
        kind: Option<AlertKind>,
    ) -> Result<Vec<AlertRow>> {
        let kind = kind.map(|k| k.to_string());
        let rows: Vec<AlertRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, stock_symbol, price, change_percent, alert_type, timestamp, message
            FROM alerts
            WHERE change_percent >= ?1 AND (?2 IS NULL OR alert_type = ?2)
            ORDER BY timestamp DESC
            LIMIT ?3
            "#,
        )
        .bind(min_change)
        .bind(kind)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // -- system token state --------------------------------------------------

    pub async fn latest_token(&self) -> Result<Option<SystemToken>> {
        let row: Option<SystemStateRow> = sqlx::query_as(
            r#"
            SELECT access_token, date_received, expires_at, status
            FROM system_state
            ORDER BY date_received DESC, id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| SystemToken {
            access_token: r.access_token,
            date_received: ms_to_datetime(r.date_received),
            expires_at: ms_to_datetime(r.expires_at),
            status: if r.status == "ONLINE" { TokenStatus::Online } else { TokenStatus::Offline },
        }))
    }

    /// Persist a freshly received session token; every earlier row is flipped
    /// OFFLINE first.
    pub async fn save_token(&self, access_token: &str, expires_at: DateTime<Utc>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE system_state SET status = 'OFFLINE'")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO system_state (access_token, date_received, expires_at, status)
            VALUES (?, ?, ?, 'ONLINE')
            "#,
        )
        .bind(access_token)
        .bind(Utc::now().timestamp_millis())
        .bind(expires_at.timestamp_millis())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn mark_tokens_offline(&self) -> Result<()> {
        sqlx::query("UPDATE system_state SET status = 'OFFLINE'")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AlertKind;
    use chrono::Duration;

    async fn store() -> Store {
        Store::connect(":memory:").await.unwrap()
    }

    fn record(symbol: &str, change: f64, kind: AlertKind, at: DateTime<Utc>) -> AlertRecord {
        AlertRecord {
            user_id: 1,
            stock_symbol: symbol.to_string(),
            price: 100.0,
            change_percent: change,
            alert_type: kind,
            timestamp: at,
            message: format!("alert {symbol}"),
        }
    }

    #[tokio::test]
    async fn bulk_insert_and_query_recent() {
        let store = store().await;
        let now = Utc::now();
        store
            .bulk_insert_alerts(&[
                record("INFY", 1.5, AlertKind::Dip, now - Duration::seconds(2)),
                record("TCS", 4.0, AlertKind::Spike, now - Duration::seconds(1)),
                record("SBIN", 0.5, AlertKind::Dip, now),
            ])
            .await
            .unwrap();

        let all = store.recent_alerts(10, 0.0, None).await.unwrap();
        assert_eq!(all.len(), 3);
        // Newest first.
        assert_eq!(all[0].stock_symbol, "SBIN");

        let big = store.recent_alerts(10, 1.0, None).await.unwrap();
        assert_eq!(big.len(), 2);

        let spikes = store.recent_alerts(10, 0.0, Some(AlertKind::Spike)).await.unwrap();
        assert_eq!(spikes.len(), 1);
        assert_eq!(spikes[0].stock_symbol, "TCS");
    }

    #[tokio::test]
    async fn retention_deletes_only_old_rows() {
        let store = store().await;
        let now = Utc::now();
        store
            .bulk_insert_alerts(&[
                record("OLD", 2.0, AlertKind::Dip, now - Duration::days(40)),
                record("NEW", 2.0, AlertKind::Dip, now),
            ])
            .await
            .unwrap();

        let deleted = store
            .delete_alerts_older_than(now - Duration::days(30))
            .await
            .unwrap();
        assert_eq!(deleted, 1);

        let remaining = store.recent_alerts(10, 0.0, None).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].stock_symbol, "NEW");
    }

    #[tokio::test]
    async fn token_save_and_latest_round_trip() {
        let store = store().await;
        assert!(store.latest_token().await.unwrap().is_none());

        let expires = Utc::now() + Duration::hours(8);
        store.save_token("tok-abc", expires).await.unwrap();

        let token = store.latest_token().await.unwrap().unwrap();
        assert_eq!(token.access_token.as_deref(), Some("tok-abc"));
        assert_eq!(token.status, TokenStatus::Online);

        store.mark_tokens_offline().await.unwrap();
        let token = store.latest_token().await.unwrap().unwrap();
        assert_eq!(token.status, TokenStatus::Offline);
    }

    #[tokio::test]
    async fn empty_stores_load_empty() {
        let store = store().await;
        assert!(store.load_all_settings().await.unwrap().is_empty());
        assert!(store.load_active_stocks().await.unwrap().is_empty());
    }
}
