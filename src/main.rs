mod api;
mod config;
mod db;
mod engine;
mod error;
mod feed;
mod metrics;
mod notify;
mod push;
mod refresh;
mod state;
mod types;
mod watchdog;

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::api::routes::{router, ApiState};
use crate::config::{Config, CHANNEL_CAPACITY, TICK_QUEUE_CAPACITY};
use crate::db::{AlertWriter, Store};
use crate::engine::{AlertEvaluator, EngineCaches, TickQueue};
use crate::error::Result;
use crate::feed::FeedAdapter;
use crate::metrics::{LatencyStats, Metrics, Uptime};
use crate::notify::NotificationEgress;
use crate::push::Broadcaster;
use crate::refresh::{CacheRefresher, RetentionJob};
use crate::state::LiveState;
use crate::types::TokenStatus;
use crate::watchdog::TokenWatchdog;

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    info!(
        "StormAlert engine starting ({} mode)",
        if cfg.production_mode { "production" } else { "dev" }
    );

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Store + shared state ---
    let store = Store::connect(&cfg.db_path).await?;
    let metrics = Arc::new(Metrics::new());
    let latency = Arc::new(LatencyStats::new());
    let live = Arc::new(LiveState::new());
    let caches = EngineCaches::new();
    let uptime = Arc::new(Uptime::new());
    let broadcaster = Broadcaster::new(CHANNEL_CAPACITY);

    // --- Channels ---
    let (control_tx, control_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (alert_tx, alert_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // --- Bootstrap caches before any tick can arrive ---
    let refresher = CacheRefresher::new(
        store.clone(),
        Arc::clone(&caches),
        control_tx.clone(),
        Arc::clone(&metrics),
    );
    refresher.refresh().await?;
    info!(
        "bootstrap complete: {} instruments watched",
        caches.subscribed_tokens().len()
    );

    // --- Recover the last persisted session token ---
    let initial_token = match store.latest_token().await? {
        Some(t) if t.status == TokenStatus::Online && t.expires_at > Utc::now() => {
            info!("found valid session token, starting ONLINE");
            t.access_token
        }
        Some(t) if t.status == TokenStatus::Online => {
            store.mark_tokens_offline().await?;
            info!("persisted session token expired, starting OFFLINE");
            None
        }
        _ => {
            info!("no valid session token, starting OFFLINE");
            None
        }
    };

    // --- Spawn tasks ---

    // Tick ingress queue + feed adapter
    let queue = TickQueue::new(TICK_QUEUE_CAPACITY, Arc::clone(&metrics));
    let adapter = FeedAdapter::new(
        &cfg,
        initial_token,
        Arc::clone(&queue),
        Arc::clone(&caches),
        control_rx,
        Arc::clone(&metrics),
    );
    tokio::spawn(adapter.run(shutdown_rx.clone()));

    // Notification egress
    let (notify_handle, egress) =
        NotificationEgress::new(cfg.clone(), CHANNEL_CAPACITY, Arc::clone(&metrics));
    tokio::spawn(egress.run());

    // Pipeline task (hot path)
    let evaluator = AlertEvaluator::new(
        Arc::clone(&caches),
        Arc::clone(&live),
        Arc::clone(&metrics),
        Arc::clone(&latency),
        broadcaster.clone(),
        notify_handle,
        alert_tx,
    );
    let pipeline = tokio::spawn(evaluator.run(Arc::clone(&queue), shutdown_rx.clone()));

    // Alert persistence
    let writer = AlertWriter::new(store.clone(), alert_rx, Arc::clone(&metrics));
    let writer_task = tokio::spawn(writer.run());

    // Periodic jobs
    tokio::spawn(refresher.run(shutdown_rx.clone()));
    tokio::spawn(RetentionJob::new(store.clone()).run(shutdown_rx.clone()));
    tokio::spawn(TokenWatchdog::new(store.clone(), control_tx.clone()).run(shutdown_rx.clone()));

    // --- HTTP API server ---
    let api_state = ApiState {
        store: store.clone(),
        metrics: Arc::clone(&metrics),
        latency: Arc::clone(&latency),
        live: Arc::clone(&live),
        caches: Arc::clone(&caches),
        broadcaster: broadcaster.clone(),
        control_tx: control_tx.clone(),
        uptime,
    };
    let app = router(api_state);
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    let mut server_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let serve = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.changed().await;
            });
        if let Err(e) = serve.await {
            error!("HTTP server error: {e}");
        }
    });

    // --- Graceful shutdown: stop ingress, drain, flush, cancel timers ---
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    queue.close();
    let _ = shutdown_tx.send(true);
    let _ = pipeline.await;
    let _ = writer_task.await;

    info!("StormAlert engine stopped");
    Ok(())
}
