//! Notification lane: the pipeline enqueues rendered messages fire-and-forget;
//! a dedicated egress task drains the queue and delivers over HTTP to the
//! channels each user enabled. Back-pressure is a dropped job with a counter,
//! never a blocked pipeline.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{Config, NOTIFY_RETRIES};
use crate::error::Result;
use crate::metrics::Metrics;
use crate::types::UserSettings;

pub struct NotificationJob {
    pub settings: Arc<UserSettings>,
    pub message: String,
}

/// Engine-side handle. Cheap to clone; `enqueue` never blocks.
#[derive(Clone)]
pub struct NotificationHandle {
    tx: mpsc::Sender<NotificationJob>,
    metrics: Arc<Metrics>,
}

impl NotificationHandle {
    pub fn enqueue(&self, settings: Arc<UserSettings>, message: String) {
        if self.tx.try_send(NotificationJob { settings, message }).is_err() {
            self.metrics.notifications_dropped.fetch_add(1, Ordering::Relaxed);
            warn!("notification queue full, dropping job");
        }
    }
}

enum Delivery<'a> {
    Telegram { chat_id: &'a str },
    Whatsapp { to: &'a str },
    Email { to: &'a str },
}

impl std::fmt::Display for Delivery<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Delivery::Telegram { .. } => write!(f, "telegram"),
            Delivery::Whatsapp { .. } => write!(f, "whatsapp"),
            Delivery::Email { .. } => write!(f, "email"),
        }
    }
}

/// Drains notification jobs and delivers them. Per-channel failures are
/// retried with doubling backoff, then logged and forgotten; delivery is
/// best-effort by contract.
pub struct NotificationEgress {
    cfg: Config,
    rx: mpsc::Receiver<NotificationJob>,
    client: reqwest::Client,
}

impl NotificationEgress {
    pub fn new(cfg: Config, capacity: usize, metrics: Arc<Metrics>) -> (NotificationHandle, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        let client = reqwest::Client::new();
        (NotificationHandle { tx, metrics }, Self { cfg, rx, client })
    }

    pub async fn run(mut self) {
        info!("notification egress started");
        while let Some(job) = self.rx.recv().await {
            self.deliver(&job).await;
        }
    }

    async fn deliver(&self, job: &NotificationJob) {
        let s = &job.settings;
        let mut lanes = Vec::new();
        if s.telegram_enabled {
            if let Some(chat_id) = s.telegram_chat_id.as_deref() {
                lanes.push(Delivery::Telegram { chat_id });
            }
        }
        if s.whatsapp_enabled {
            if let Some(to) = s.whatsapp_number.as_deref() {
                lanes.push(Delivery::Whatsapp { to });
            }
        }
        if s.email_enabled {
            if let Some(to) = s.email_address.as_deref() {
                lanes.push(Delivery::Email { to });
            }
        }

        for lane in lanes {
            let mut delay = Duration::from_secs(1);
            for attempt in 1..=NOTIFY_RETRIES {
                match self.send(&lane, &job.message).await {
                    Ok(()) => {
                        debug!(user_id = s.user_id, channel = %lane, "notification delivered");
                        break;
                    }
                    Err(e) if attempt == NOTIFY_RETRIES => {
                        warn!(
                            user_id = s.user_id,
                            channel = %lane,
                            "notification failed after {NOTIFY_RETRIES} attempts: {e}"
                        );
                    }
                    Err(e) => {
                        debug!(channel = %lane, "notification attempt {attempt} failed, retrying: {e}");
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }
    }

    async fn send(&self, lane: &Delivery<'_>, message: &str) -> Result<()> {
        match lane {
            Delivery::Telegram { chat_id } => self.send_telegram(chat_id, message).await,
            Delivery::Whatsapp { to } => self.send_whatsapp(to, message).await,
            Delivery::Email { to } => self.send_email(to, message).await,
        }
    }

    async fn send_telegram(&self, chat_id: &str, message: &str) -> Result<()> {
        let Some(token) = self.cfg.telegram_bot_token.as_deref() else {
            debug!("telegram not configured, skipping");
            return Ok(());
        };
        let url = format!("https://api.telegram.org/bot{token}/sendMessage");
        self.client
            .post(&url)
            .json(&serde_json::json!({
                "chat_id": chat_id,
                "text": message,
                "parse_mode": "Markdown",
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn send_whatsapp(&self, to: &str, message: &str) -> Result<()> {
        let (Some(sid), Some(auth), Some(from)) = (
            self.cfg.twilio_sid.as_deref(),
            self.cfg.twilio_auth_token.as_deref(),
            self.cfg.twilio_from_number.as_deref(),
        ) else {
            debug!("twilio not configured, skipping");
            return Ok(());
        };
        let dest = if to.starts_with("whatsapp:") {
            to.to_string()
        } else {
            format!("whatsapp:{to}")
        };
        let url = format!("https://api.twilio.com/2010-04-01/Accounts/{sid}/Messages.json");
        self.client
            .post(&url)
            .basic_auth(sid, Some(auth))
            .form(&[("To", dest.as_str()), ("From", from), ("Body", message)])
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Email rides an external relay; the engine posts a delivery job and the
    /// relay owns SMTP.
    async fn send_email(&self, to: &str, message: &str) -> Result<()> {
        let Some(relay) = self.cfg.email_relay_url.as_deref() else {
            debug!("email relay not configured, skipping");
            return Ok(());
        };
        self.client
            .post(relay)
            .json(&serde_json::json!({
                "to": to,
                "subject": "StormAlert Notification",
                "body": message,
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AlgoMode;

    fn settings() -> Arc<UserSettings> {
        Arc::new(UserSettings {
            user_id: 1,
            timeframe_minutes: 10,
            dip_threshold: 1.0,
            rise_threshold: 1.0,
            cooldown_minutes: 15,
            algo_mode: AlgoMode::Both,
            email_enabled: false,
            whatsapp_enabled: false,
            telegram_enabled: true,
            email_address: None,
            whatsapp_number: None,
            telegram_chat_id: Some("42".to_string()),
        })
    }

    #[tokio::test]
    async fn full_queue_drops_with_counter() {
        let metrics = Arc::new(Metrics::new());
        let (handle, _egress) =
            NotificationEgress::new(Config::test_default(), 1, Arc::clone(&metrics));

        handle.enqueue(settings(), "one".to_string());
        handle.enqueue(settings(), "two".to_string());

        assert_eq!(metrics.notifications_dropped.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn unconfigured_channels_are_skipped_without_error() {
        let metrics = Arc::new(Metrics::new());
        let (_handle, egress) = NotificationEgress::new(Config::test_default(), 4, metrics);
        // No bot token configured: delivery resolves without HTTP traffic.
        let job = NotificationJob { settings: settings(), message: "msg".to_string() };
        egress.deliver(&job).await;
    }
}
