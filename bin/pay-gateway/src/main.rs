//! Payment Gateway
//!
//! Accepts payments over HTTP, enqueues them durably in Redis, and routes
//! them to one of two external processors from a worker pool gated by
//! per-processor circuit breakers and a shared health cache. An optional
//! Postgres audit trail provides crash recovery.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use pay_api::{create_router, AppState};
use pay_router::{
    HealthMonitor, HealthMonitorConfig, PaymentRouter, ProcessorClient, ProcessorClientConfig,
    WorkerPool, WorkerPoolConfig,
};
use pay_store::{AuditStore, JobQueue, MemoryAuditStore, PgAuditStore, RedisStore};
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

struct GatewayConfig {
    api_port: u16,
    redis_url: String,
    database_url: Option<String>,
    audit_enabled: bool,
    workers: usize,
    max_queue_depth: u64,
    processors: ProcessorClientConfig,
}

fn load_config() -> GatewayConfig {
    let api_port = std::env::var("API_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(9999);

    let redis_url = std::env::var("REDIS_URL")
        .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

    let database_url = std::env::var("DATABASE_URL").ok();

    let audit_enabled = std::env::var("AUDIT_ENABLED")
        .map(|v| v.parse().unwrap_or(true))
        .unwrap_or(true);

    let workers = std::env::var("WORKER_COUNT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(5);

    let max_queue_depth = std::env::var("MAX_QUEUE_DEPTH")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let mut processors = ProcessorClientConfig::default();
    if let Ok(url) = std::env::var("PAYMENT_PROCESSOR_URL_DEFAULT") {
        processors.default_url = url;
    }
    if let Ok(url) = std::env::var("PAYMENT_PROCESSOR_URL_FALLBACK") {
        processors.fallback_url = url;
    }

    GatewayConfig {
        api_port,
        redis_url,
        database_url,
        audit_enabled,
        workers,
        max_queue_depth,
        processors,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    info!("starting payment gateway");
    let config = load_config();

    // 1. Shared stores
    let store = RedisStore::connect(&config.redis_url).await?;
    store.ping().await?;
    info!(redis_url = %config.redis_url, "connected to redis");

    let audit: Arc<dyn AuditStore> = match (&config.database_url, config.audit_enabled) {
        (Some(url), true) => {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .acquire_timeout(Duration::from_secs(5))
                .connect(url)
                .await?;
            let pg = PgAuditStore::new(pool);
            pg.init_schema().await?;
            info!("audit store ready (postgres)");
            Arc::new(pg)
        }
        _ => {
            warn!("running without a relational audit store; crash recovery is disabled");
            Arc::new(MemoryAuditStore::new())
        }
    };

    // 2. Recover payments that never reached a terminal state
    let queue: Arc<dyn JobQueue> = Arc::new(store.clone());
    match audit.scan_incomplete().await {
        Ok(jobs) if !jobs.is_empty() => {
            info!(count = jobs.len(), "re-enqueueing incomplete payments");
            for job in &jobs {
                if let Err(e) = queue.publish(job).await {
                    error!(payment_id = %job.payment_id, error = %e, "recovery enqueue failed");
                }
            }
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "startup recovery scan failed"),
    }

    // 3. Routing engine
    let processors = Arc::new(ProcessorClient::new(config.processors.clone())?);
    let router = Arc::new(PaymentRouter::new(
        processors.clone(),
        Arc::new(store.clone()),
    ));

    // 4. Background tasks: health monitor and worker pool
    let (shutdown_tx, _) = broadcast::channel(1);

    let monitor = HealthMonitor::new(
        processors,
        Arc::new(store.clone()),
        HealthMonitorConfig::default(),
    );
    let monitor_handle = monitor.spawn(shutdown_tx.subscribe());

    let worker_pool = Arc::new(WorkerPool::new(
        queue,
        Arc::new(store.clone()),
        audit.clone(),
        router.clone(),
        WorkerPoolConfig {
            workers: config.workers,
            ..WorkerPoolConfig::default()
        },
    ));
    worker_pool.start().await?;

    // 5. HTTP API
    let state = AppState {
        queue: Arc::new(store.clone()),
        summary: Arc::new(store.clone()),
        purge: Arc::new(store.clone()),
        audit,
        router,
        max_queue_depth: config.max_queue_depth,
        worker_count: config.workers,
    };

    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

    let addr = format!("0.0.0.0:{}", config.api_port);
    let listener = TcpListener::bind(&addr).await?;
    info!(port = config.api_port, workers = config.workers, "payment gateway listening");

    let server_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "http server error");
        }
    });

    // 6. Graceful shutdown: stop ingress, drain workers, join the monitor
    shutdown_signal().await;
    info!("shutdown signal received");

    server_task.abort();
    let _ = shutdown_tx.send(());
    worker_pool.shutdown().await;
    if tokio::time::timeout(Duration::from_secs(10), monitor_handle)
        .await
        .is_err()
    {
        warn!("health monitor did not stop in time");
    }

    info!("payment gateway shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
