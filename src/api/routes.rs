use std::sync::Arc;

use axum::{
    extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use crate::db::store::Store;
use crate::engine::caches::EngineCaches;
use crate::error::AppError;
use crate::metrics::{LatencyStats, Metrics, Uptime};
use crate::push::Broadcaster;
use crate::state::LiveState;
use crate::types::{AlertKind, ControlMsg, TokenStatus};

#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    pub metrics: Arc<Metrics>,
    pub latency: Arc<LatencyStats>,
    pub live: Arc<LiveState>,
    pub caches: Arc<EngineCaches>,
    pub broadcaster: Broadcaster,
    pub control_tx: mpsc::Sender<ControlMsg>,
    pub uptime: Arc<Uptime>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .route("/metrics", get(get_metrics))
        .route("/api/status/live", get(get_status_live))
        .route("/api/alerts/recent", get(get_recent_alerts))
        .route("/api/instruments/:token/history", get(get_instrument_history))
        .route("/api/admin/token", post(submit_token))
        .route("/api/admin/status", get(get_admin_status))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query / payload structs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct RecentAlertsQuery {
    pub limit: Option<i64>,
    pub min_change: Option<f64>,
    pub kind: Option<String>,
}

#[derive(Deserialize)]
pub struct TokenSubmission {
    pub access_token: String,
    /// Expiry from the upstream session payload; falls back to end of today
    /// UTC when the control surface doesn't know it.
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
pub struct AlertResponse {
    pub id: i64,
    pub user_id: i64,
    pub stock_symbol: String,
    pub price: f64,
    pub change_percent: f64,
    pub alert_type: String,
    pub timestamp: String,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "message": "StormAlert System is Running",
        "status": "active",
    }))
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn get_metrics(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let snap = state.metrics.snapshot();
    let (p50, p95, p99) = state.latency.percentiles();
    Json(serde_json::json!({
        "ticker": {
            "connected": snap.feed_connected,
            "total_ticks": snap.total_ticks,
            "dropped_ticks": snap.dropped_ticks,
            "malformed_ticks": snap.malformed_ticks,
            "uptime": state.uptime.started_at().to_rfc3339(),
        },
        "alert_engine": {
            "monitored_users": snap.monitored_users,
            "monitored_instruments": snap.monitored_instruments,
            "alerts_emitted": snap.alerts_emitted,
            "alerts_suppressed_by_cooldown": snap.alerts_suppressed_by_cooldown,
            "alerts_lost": snap.alerts_lost,
            "tick_faults": snap.tick_faults,
            "persistence_buffer_depth": snap.persistence_buffer_depth,
            "notifications_dropped": snap.notifications_dropped,
        },
        "latency_us": { "p50": p50, "p95": p95, "p99": p99 },
        "push_subscribers": state.broadcaster.subscriber_count(),
    }))
}

async fn get_status_live(
    State(state): State<ApiState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let token = state.store.latest_token().await?;
    let status = match token {
        Some(t) if t.status == TokenStatus::Online && t.expires_at > Utc::now() => {
            TokenStatus::Online
        }
        _ => TokenStatus::Offline,
    };
    let snap = state.metrics.snapshot();
    Ok(Json(serde_json::json!({
        "status": status.to_string(),
        "feed_connected": snap.feed_connected,
        "active_instruments": state.caches.subscribed_tokens().len(),
        "ticking_instruments": state.live.instrument_count(),
        "monitored_users": snap.monitored_users,
        "total_ticks": snap.total_ticks,
        "alerts_emitted": snap.alerts_emitted,
    })))
}

async fn get_recent_alerts(
    State(state): State<ApiState>,
    Query(params): Query<RecentAlertsQuery>,
) -> Result<Json<Vec<AlertResponse>>, AppError> {
    let limit = params.limit.unwrap_or(50).clamp(1, 500);
    let min_change = params.min_change.unwrap_or(0.0);
    let kind = match params.kind.as_deref() {
        None => None,
        Some(s) => Some(
            AlertKind::parse(s)
                .ok_or_else(|| AppError::BadRequest(format!("unknown alert kind: {s}")))?,
        ),
    };

    let rows = state.store.recent_alerts(limit, min_change, kind).await?;
    let alerts = rows
        .into_iter()
        .map(|r| AlertResponse {
            id: r.id,
            user_id: r.user_id,
            stock_symbol: r.stock_symbol,
            price: r.price,
            change_percent: r.change_percent,
            alert_type: r.alert_type,
            timestamp: DateTime::<Utc>::from_timestamp_millis(r.timestamp)
                .unwrap_or_else(Utc::now)
                .to_rfc3339(),
            message: r.message,
        })
        .collect();
    Ok(Json(alerts))
}

/// Sparkline feed for the dashboard: last price plus the short history tail
/// the pipeline keeps per instrument.
async fn get_instrument_history(
    State(state): State<ApiState>,
    Path(token): Path<u32>,
) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "instrument_token": token,
        "last_price": state.live.last_price(token),
        "points": state.live.history(token),
    }))
}

async fn submit_token(
    State(state): State<ApiState>,
    Json(payload): Json<TokenSubmission>,
) -> Result<Json<serde_json::Value>, AppError> {
    let token = payload.access_token.trim();
    if token.is_empty() {
        return Err(AppError::BadRequest("access_token must not be empty".to_string()));
    }

    let expires_at = payload.expires_at.unwrap_or_else(end_of_today_utc);
    state.store.save_token(token, expires_at).await?;
    state
        .control_tx
        .send(ControlMsg::Restart(Some(token.to_string())))
        .await
        .map_err(|e| AppError::ChannelSend(e.to_string()))?;

    info!(expires_at = %expires_at, "new session token accepted");
    Ok(Json(serde_json::json!({
        "success": true,
        "message": "System is now ONLINE",
        "expires_at": expires_at.to_rfc3339(),
    })))
}

async fn get_admin_status(
    State(state): State<ApiState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let Some(token) = state.store.latest_token().await? else {
        return Ok(Json(serde_json::json!({
            "status": "OFFLINE",
            "reason": "No token found",
        })));
    };
    if token.expires_at < Utc::now() {
        return Ok(Json(serde_json::json!({
            "status": "OFFLINE",
            "reason": "Token expired",
            "expires_at": token.expires_at.to_rfc3339(),
        })));
    }
    Ok(Json(serde_json::json!({
        "status": token.status.to_string(),
        "date_received": token.date_received.to_rfc3339(),
        "expires_at": token.expires_at.to_rfc3339(),
    })))
}

/// Sessions whose payload carries no expiry die at the end of the trading
/// day.
fn end_of_today_utc() -> DateTime<Utc> {
    Utc::now()
        .date_naive()
        .and_hms_opt(23, 59, 59)
        .expect("valid wall-clock time")
        .and_utc()
}

// ---------------------------------------------------------------------------
// Push fan-out
// ---------------------------------------------------------------------------

async fn ws_handler(State(state): State<ApiState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let rx = state.broadcaster.subscribe();
    ws.on_upgrade(move |socket| push_session(socket, rx))
}

/// One connected push client. Failures here are isolated to this socket; a
/// lagging client skips missed events rather than stalling the channel.
async fn push_session(mut socket: WebSocket, mut rx: broadcast::Receiver<String>) {
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(json) => {
                    if socket.send(WsMessage::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "push client lagged, events skipped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            msg = socket.recv() => match msg {
                // Clients only listen; drain pings and ignore the rest.
                Some(Ok(_)) => {}
                _ => break,
            },
        }
    }
}
