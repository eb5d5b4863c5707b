mod config;
mod db;
mod models;
mod routes;
mod services;

use crate::config::AppConfig;
use crate::db::connection::{close_pool, create_pool};
use crate::db::migrate::migrate;
use crate::services::primary_store::SqlitePrimaryStore;
use resilience_core::alerts::{AlertSink, LogNotifier, WebhookNotifier};
use resilience_core::api::gate::GatePolicy;
use resilience_core::api::{create_router, ApiState};
use resilience_core::archive::{Archive, HttpArchive, MemoryArchive};
use resilience_core::backup::{RetentionManager, RetentionPolicy, SnapshotBuilder};
use resilience_core::cache::{FailoverCache, RespConnector};
use resilience_core::clock::{Clock, SystemClock};
use resilience_core::extractor::BackupReader;
use resilience_core::health::HealthMonitor;
use resilience_core::scheduler::BackupScheduler;
use resilience_core::utils::logger;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    logger::init(&config.core.log)?;
    tracing::info!("Starting resilience server on port {}", config.port);

    if let Some(dir) = config.db_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    let pool = create_pool(&config.db_path)?;
    migrate(&pool)?;

    let core = &config.core;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let mut sink = AlertSink::new(core.alerts.history_capacity, clock.clone())
        .with_notifier(Arc::new(LogNotifier));
    if let Some(url) = &core.alerts.webhook_url {
        sink = sink.with_notifier(Arc::new(WebhookNotifier::new(url.clone())));
    }
    let alerts = Arc::new(sink);

    let store = Arc::new(SqlitePrimaryStore::new(
        pool.clone(),
        clock.clone(),
        core.snapshot.id_field.clone(),
    ));
    let health = Arc::new(
        HealthMonitor::new(store.clone(), clock.clone(), &core.health).with_alerts(alerts.clone()),
    );

    let archive: Arc<dyn Archive> = if config.archive_in_memory {
        tracing::warn!("Archive kept in memory; backups will not survive a restart");
        Arc::new(MemoryArchive::new(clock.clone()))
    } else {
        Arc::new(HttpArchive::new(&core.archive)?)
    };
    if !archive.test_connection().await {
        tracing::warn!("Archive API unreachable at startup; backups will fail until it recovers");
    }

    let connector = Arc::new(RespConnector::new(Duration::from_millis(core.cache.connect_timeout_ms)));
    let cache = Arc::new(FailoverCache::connect(connector, &core.cache).await);

    let builder = Arc::new(SnapshotBuilder::new(
        store.clone(),
        archive.clone(),
        clock.clone(),
        core.snapshot.compression_level,
    ));
    let retention = Arc::new(RetentionManager::new(
        archive.clone(),
        clock.clone(),
        RetentionPolicy::from(&core.retention),
    ));
    let scheduler = Arc::new(BackupScheduler::new(
        builder,
        retention,
        archive.clone(),
        alerts.clone(),
        clock.clone(),
        core.scheduler.clone(),
        core.archive.storage_limit_bytes,
    ));
    scheduler.start();

    let reader = Arc::new(
        BackupReader::new(archive.clone(), core.snapshot.id_field.clone())
            .with_catalog_ttl(Duration::from_millis(core.snapshot.catalog_ttl_ms)),
    );
    let state = ApiState {
        health,
        cache: Some(cache),
        archive,
        scheduler: scheduler.clone(),
        alerts,
        reader: reader.clone(),
        gate: Arc::new(GatePolicy::from_config(&core.gate)),
        started_at: Instant::now(),
    };
    let app = create_router(state, routes::documents::router(store, reader));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down...");
    scheduler.stop().await;
    close_pool(&pool);
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
