// Meshcover ingestion server: MQTT envelopes in, per-packet gateway
// coverage out. Wiring lives here; every component gets its collaborators
// at construction and a shared shutdown signal.
//
// Exit codes: 0 clean shutdown, 1 configuration or init failure before the
// HTTP server binds, 2 forced exit after a flush timeout.

mod bot;
mod codec;
mod config;
mod grouper;
mod http;
mod metrics;
mod mqtt;
mod proto;
mod scheduler;
mod stats;
mod store;
mod subscriptions;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

use crate::bot::{CommandBot, OutboundQueue, OUTBOUND_CAPACITY};
use crate::codec::{Codec, KeyRing};
use crate::config::{Config, RadioEndpoint};
use crate::grouper::PacketGrouper;
use crate::http::{build_router, AppState};
use crate::metrics::{Metrics, RuntimeHealth};
use crate::mqtt::MqttIngest;
use crate::scheduler::Scheduler;
use crate::stats::StatsEngine;
use crate::store::Store;
use crate::subscriptions::SubscriptionSvc;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const INGEST_CHANNEL_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return 1;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or(format!(
            "meshcover_ingest={},tower_http=info",
            config.log_level
        )))
        .json()
        .init();
    info!(version = env!("CARGO_PKG_VERSION"), "meshcover ingest starting");

    let key_ring = match KeyRing::new(&config.decryption_keys, config.include_default_key) {
        Ok(ring) => ring,
        Err(e) => {
            error!(error = %e, "key ring rejected");
            return 1;
        }
    };
    if config.radio.commands_enabled
        && matches!(config.radio.endpoint, Some(RadioEndpoint::Serial { .. }))
    {
        error!("serial radio endpoints are not supported by this build, use tcp://");
        return 1;
    }

    let metrics = Arc::new(Metrics::new());
    let health = Arc::new(RuntimeHealth::new());
    let store = match Store::open(&config.database_url, metrics.clone()) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(url = %config.database_url, error = %e, "store open failed");
            return 1;
        }
    };
    let stats = Arc::new(StatsEngine::new(store.clone(), metrics.clone()));
    let subs = Arc::new(SubscriptionSvc::new(store.clone()));
    let queue = Arc::new(OutboundQueue::new(OUTBOUND_CAPACITY));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Packet grouper: single writer behind a bounded channel.
    let (observation_tx, observation_rx) = mpsc::channel(INGEST_CHANNEL_CAPACITY);
    let grouper = PacketGrouper::new(config.grouper.clone(), store.clone(), metrics.clone());
    let grouper_task = tokio::spawn(grouper::run(grouper, observation_rx, shutdown_rx.clone()));

    // MQTT ingest feeds the grouper.
    let ingest = MqttIngest::new(
        config.mqtt.clone(),
        Codec::new(key_ring),
        store.clone(),
        metrics.clone(),
        health.clone(),
        observation_tx,
    );
    let mqtt_task = tokio::spawn(ingest.run(shutdown_rx.clone()));

    // Scheduler jobs fan into the outbound queue.
    let sched = Scheduler::new(
        config.schedule.clone(),
        stats.clone(),
        subs.clone(),
        queue.clone(),
        metrics.clone(),
    );
    let job_registry = sched.registry();
    let scheduler_tasks = sched.spawn(shutdown_rx.clone());

    // Command bot, when a radio is configured.
    let bot_task = if config.radio.commands_enabled {
        let bot = Arc::new(CommandBot::new(
            config.radio.clone(),
            store.clone(),
            stats.clone(),
            subs.clone(),
            metrics.clone(),
            health.clone(),
            queue.clone(),
        ));
        Some(tokio::spawn(bot.run(shutdown_rx.clone())))
    } else {
        info!("command bot disabled");
        None
    };

    // HTTP read model.
    let app = build_router(AppState {
        store: store.clone(),
        stats,
        subs,
        metrics,
        health: health.clone(),
        jobs: job_registry,
        queue,
    });
    let bind = format!("{}:{}", config.api_host, config.api_port);
    let listener = match tokio::net::TcpListener::bind(&bind).await {
        Ok(l) => l,
        Err(e) => {
            error!(%bind, error = %e, "http bind failed");
            return 1;
        }
    };
    info!(%bind, "http listening");

    // Ctrl-C starts the drain: new HTTP requests get 503, open groups
    // flush, links close.
    {
        let health = health.clone();
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                health.shutting_down.store(true, Ordering::Relaxed);
                let _ = shutdown_tx.send(true);
            }
        });
    }

    let mut http_shutdown = shutdown_rx.clone();
    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = http_shutdown.changed().await;
        })
        .await;
    if let Err(e) = serve_result {
        error!(error = %e, "http server failed");
        health.shutting_down.store(true, Ordering::Relaxed);
        let _ = shutdown_tx.send(true);
    }

    // The server has stopped; drain the pipeline within the grace period.
    let mut exit_code = 0;
    match tokio::time::timeout(SHUTDOWN_GRACE, grouper_task).await {
        Ok(Ok(Ok(()))) => info!("grouper flushed"),
        Ok(Ok(Err(e))) => {
            error!(error = %e, "grouper flush failed");
            exit_code = 2;
        }
        Ok(Err(e)) => {
            error!(error = %e, "grouper task panicked");
            exit_code = 2;
        }
        Err(_) => {
            error!("grouper flush timed out");
            exit_code = 2;
        }
    }

    if tokio::time::timeout(SHUTDOWN_GRACE, mqtt_task).await.is_err() {
        error!("mqtt client did not stop in time");
    }
    if let Some(task) = bot_task {
        let grace = config.radio.inter_chunk_delay + Duration::from_secs(1);
        if tokio::time::timeout(grace, task).await.is_err() {
            error!("command bot did not drain in time");
        }
    }
    for task in scheduler_tasks {
        task.abort();
    }

    info!(exit_code, "meshcover ingest stopped");
    exit_code
}
