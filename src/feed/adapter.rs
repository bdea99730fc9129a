//! Manages the single persistent WebSocket session to the upstream tick
//! source. Owns credential state: without a session token the adapter sits in
//! a degraded no-tick state until a `Restart` arrives with fresh credentials.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::config::{Config, RECONNECT_BACKOFF_MS, WS_PING_INTERVAL_SECS, WS_SUBSCRIBE_CHUNK_SIZE};
use crate::engine::caches::EngineCaches;
use crate::engine::ingress::TickQueue;
use crate::error::Result;
use crate::feed::messages::parse_feed_frame;
use crate::metrics::Metrics;
use crate::types::ControlMsg;

/// Why a live session ended.
enum SessionEnd {
    Disconnected,
    Restart(Option<String>),
    Shutdown,
}

pub struct FeedAdapter {
    ws_url: String,
    api_key: String,
    access_token: Option<String>,
    queue: Arc<TickQueue>,
    caches: Arc<EngineCaches>,
    control_rx: mpsc::Receiver<ControlMsg>,
    metrics: Arc<Metrics>,
}

impl FeedAdapter {
    pub fn new(
        cfg: &Config,
        access_token: Option<String>,
        queue: Arc<TickQueue>,
        caches: Arc<EngineCaches>,
        control_rx: mpsc::Receiver<ControlMsg>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            ws_url: cfg.feed_ws_url.clone(),
            api_key: cfg.feed_api_key.clone(),
            access_token,
            queue,
            caches,
            control_rx,
            metrics,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff_idx = 0usize;

        loop {
            if *shutdown.borrow() {
                return;
            }

            if self.access_token.is_none() {
                self.metrics.set_feed_connected(false);
                warn!("no session token: feed degraded, waiting for restart");
                tokio::select! {
                    ctrl = self.control_rx.recv() => match ctrl {
                        Some(ControlMsg::Restart(token)) => {
                            self.access_token = token;
                            backoff_idx = 0;
                        }
                        // Subscription changes while degraded are moot: the
                        // next connect reads the full union from the caches.
                        Some(_) => {}
                        None => return,
                    },
                    _ = shutdown.changed() => return,
                }
                continue;
            }

            info!("feed connecting to {}", self.ws_url);
            match self.connect_once(&mut shutdown).await {
                Ok(SessionEnd::Shutdown) => return,
                Ok(SessionEnd::Restart(token)) => {
                    info!("feed restart requested (token {})", if token.is_some() { "set" } else { "cleared" });
                    self.access_token = token;
                    backoff_idx = 0;
                    self.metrics.set_feed_connected(false);
                    continue;
                }
                Ok(SessionEnd::Disconnected) => {
                    info!("feed connection closed");
                    backoff_idx = 0;
                }
                Err(e) => {
                    error!("feed connection error: {e}");
                }
            }
            self.metrics.set_feed_connected(false);

            let delay_ms = RECONNECT_BACKOFF_MS
                .get(backoff_idx)
                .copied()
                .unwrap_or(*RECONNECT_BACKOFF_MS.last().unwrap());
            backoff_idx = (backoff_idx + 1).min(RECONNECT_BACKOFF_MS.len() - 1);

            warn!("feed reconnecting in {delay_ms}ms");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    async fn connect_once(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<SessionEnd> {
        let token = self.access_token.as_deref().unwrap_or_default();
        let url = format!(
            "{}?api_key={}&access_token={}",
            self.ws_url, self.api_key, token
        );
        let (ws_stream, _) = connect_async(&url).await?;
        let (mut write, mut read) = ws_stream.split();
        self.metrics.set_feed_connected(true);

        // Subscribe to the current watchlist union in chunks to stay under
        // server-side frame limits.
        let tokens = self.caches.subscribed_tokens();
        if !tokens.is_empty() {
            let chunk_count = tokens.len().div_ceil(WS_SUBSCRIBE_CHUNK_SIZE);
            for chunk in tokens.chunks(WS_SUBSCRIBE_CHUNK_SIZE) {
                write.send(Message::Text(build_subscribe_msg(chunk))).await?;
                write.send(Message::Text(build_mode_msg(chunk))).await?;
            }
            info!("feed subscribed to {} instruments in {chunk_count} chunk(s)", tokens.len());
        }

        let mut ping_interval = interval(Duration::from_secs(WS_PING_INTERVAL_SECS));
        ping_interval.tick().await; // consume immediate first tick

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            let batch = parse_feed_frame(&text);
                            if !batch.is_empty() {
                                self.queue.enqueue(batch);
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Ok(SessionEnd::Disconnected);
                        }
                        Some(Err(e)) => return Err(e.into()),
                        Some(Ok(_)) => {}
                    }
                }

                _ = ping_interval.tick() => {
                    debug!("feed ping");
                    write.send(Message::Ping(vec![])).await?;
                }

                ctrl = self.control_rx.recv() => {
                    match ctrl {
                        Some(ControlMsg::Subscribe(tokens)) => {
                            for chunk in tokens.chunks(WS_SUBSCRIBE_CHUNK_SIZE) {
                                write.send(Message::Text(build_subscribe_msg(chunk))).await?;
                                write.send(Message::Text(build_mode_msg(chunk))).await?;
                            }
                            info!("feed dynamically subscribed to {} instruments", tokens.len());
                        }
                        Some(ControlMsg::Unsubscribe(tokens)) => {
                            write.send(Message::Text(build_unsubscribe_msg(&tokens))).await?;
                            info!("feed unsubscribed {} instruments", tokens.len());
                        }
                        Some(ControlMsg::Restart(token)) => {
                            return Ok(SessionEnd::Restart(token));
                        }
                        None => {
                            // Control channel dropped, shut down.
                            return Ok(SessionEnd::Disconnected);
                        }
                    }
                }

                _ = shutdown.changed() => {
                    return Ok(SessionEnd::Shutdown);
                }
            }
        }
    }
}

fn build_subscribe_msg(tokens: &[u32]) -> String {
    serde_json::json!({ "a": "subscribe", "v": tokens }).to_string()
}

/// Full mode: the feed includes exchange timestamps with each tick.
fn build_mode_msg(tokens: &[u32]) -> String {
    serde_json::json!({ "a": "mode", "v": ["full", tokens] }).to_string()
}

fn build_unsubscribe_msg(tokens: &[u32]) -> String {
    serde_json::json!({ "a": "unsubscribe", "v": tokens }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_frames_carry_token_lists() {
        let msg = build_subscribe_msg(&[408065, 2953217]);
        let v: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(v["a"], "subscribe");
        assert_eq!(v["v"][1], 2953217);

        let msg = build_mode_msg(&[408065]);
        let v: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(v["v"][0], "full");

        let msg = build_unsubscribe_msg(&[408065]);
        let v: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(v["a"], "unsubscribe");
    }
}
