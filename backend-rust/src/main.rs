use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

use pelorus_backend::adapters::adsb_queue::AdsbQueueWorker;
use pelorus_backend::adapters::adsb_stream::AdsbStreamAdapter;
use pelorus_backend::adapters::ais_hub::AisHubAdapter;
use pelorus_backend::adapters::{AdapterHealth, IngestQueue};
use pelorus_backend::cache::RedisCache;
use pelorus_backend::config::Config;
use pelorus_backend::history::PgHistoryStore;
use pelorus_backend::metrics::Metrics;
use pelorus_backend::orchestrator::{Orchestrator, Pipeline};
use pelorus_backend::publish::Publisher;
use pelorus_backend::smoother::Smoother;
use pelorus_backend::validate::Validator;
use pelorus_backend::window::WindowStore;

// ─── Global startup time (for uptime reporting) ──────────────────────────────
static STARTUP_MS: AtomicU64 = AtomicU64::new(0);

// ─── Health Endpoint ──────────────────────────────────────────────────────────
// GET /health → { status, version, uptimeSecs }

async fn health_check() -> axum::Json<serde_json::Value> {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let startup = STARTUP_MS.load(Ordering::Relaxed);
    let uptime_secs = if startup > 0 { (now_ms - startup) / 1000 } else { 0 };
    axum::Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": uptime_secs,
    }))
}

// ─── Status Endpoint (consumed by the admin surface) ──────────────────────────

async fn status(State(orch): State<Arc<Orchestrator>>) -> axum::Json<serde_json::Value> {
    axum::Json(orch.status())
}

// ─── Main ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let startup_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    STARTUP_MS.store(startup_ms, Ordering::Relaxed);

    // Logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pelorus_backend=info".into()),
        )
        .init();

    if let Err(e) = run().await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cfg = Config::from_env().context("configuration")?;
    info!(
        "Pelorus ingest core v{} starting — window {} ms, pool {}",
        env!("CARGO_PKG_VERSION"),
        cfg.window.window_ms,
        cfg.resources.worker_pool_size
    );

    // External stores. Unreachable infrastructure at startup is fatal.
    let history = Arc::new(
        PgHistoryStore::connect(&cfg.database_url)
            .await
            .context("historical store")?,
    );
    let cache = Arc::new(
        RedisCache::connect(
            &cfg.redis_url,
            cfg.adsb.redis_hash_key.clone(),
            cfg.adsb.redis_ttl_s,
        )
        .await
        .context("realtime cache")?,
    );

    // Shared pipeline state.
    let metrics = Arc::new(Metrics::new());
    let shards = cfg.resources.worker_pool_size.max(4) * 2;
    let window = Arc::new(WindowStore::new(cfg.window.clone(), shards, metrics.clone()));
    let smoother = Arc::new(Smoother::new(cfg.smoother.clone(), shards));
    let validator = Arc::new(Validator::new(cfg.window.clone(), metrics.clone()));
    let publisher = Arc::new(Publisher::new(
        cache.clone(),
        history.clone(),
        window.clone(),
        metrics.clone(),
        cfg.window.allowed_lateness_ms,
    ));
    let pipeline = Arc::new(Pipeline {
        window,
        smoother,
        publisher,
        history: history.clone(),
        metrics: metrics.clone(),
        weights: cfg.weights.clone(),
        window_cfg: cfg.window.clone(),
    });

    // Ingest channel + shutdown signal.
    let queue = IngestQueue::new(cfg.resources.ingest_chan_cap, metrics.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Source adapters.
    let ais_health = AdapterHealth::new("ais_hub", cfg.ais.enabled);
    let adsb_health = AdapterHealth::new("adsb_stream", cfg.adsb.enabled);
    let queue_health = AdapterHealth::new("adsb_queue", cfg.adsb.enabled);

    let ais = AisHubAdapter::new(
        cfg.ais.clone(),
        queue.clone(),
        ais_health.clone(),
        metrics.clone(),
    );
    tokio::spawn(ais.run(shutdown_rx.clone()));

    let (batch_tx, batch_rx) = mpsc::channel(cfg.adsb.batch_queue_cap.max(1));
    let adsb = AdsbStreamAdapter::new(
        cfg.adsb.clone(),
        batch_tx,
        adsb_health.clone(),
        metrics.clone(),
    );
    tokio::spawn(adsb.run(shutdown_rx.clone()));

    let queue_worker = AdsbQueueWorker::new(
        cfg.adsb.clone(),
        batch_rx,
        queue.clone(),
        cache.clone(),
        history.clone(),
        validator.clone(),
        cfg.weights.clone(),
        queue_health.clone(),
        metrics.clone(),
    );
    tokio::spawn(queue_worker.run(shutdown_rx.clone()));

    // Orchestrator.
    let orchestrator = Orchestrator::new(
        pipeline,
        queue.clone(),
        validator,
        cfg.resources.clone(),
        vec![ais_health, adsb_health, queue_health],
    );
    let orch_handle = tokio::spawn(orchestrator.clone().run(shutdown_rx));

    // Health + status surface.
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status))
        .with_state(orchestrator);

    let addr = format!("0.0.0.0:{}", cfg.port);
    info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("http server error: {e}");
        }
    });

    // Cooperative shutdown: signal, then give the pipeline its drain window.
    tokio::signal::ctrl_c().await.ok();
    info!("shutdown requested, draining");
    let _ = shutdown_tx.send(true);
    let drain = Duration::from_millis(cfg.resources.shutdown_drain_ms + 1000);
    let _ = tokio::time::timeout(drain, orch_handle).await;
    server.abort();
    info!("bye");
    Ok(())
}
