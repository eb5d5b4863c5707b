//! End-to-end safe-mode behavior through the HTTP router.

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Extension, State};
use axum::http::{Request, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{TimeZone, Utc};
use http_body_util::BodyExt;
use resilience_core::alerts::{AlertSink, AlertType};
use resilience_core::api::gate::{DegradedMode, GatePolicy};
use resilience_core::api::{create_router, ApiState};
use resilience_core::archive::MemoryArchive;
use resilience_core::backup::source::MemorySource;
use resilience_core::backup::{BackupSource, RetentionManager, RetentionPolicy, SnapshotBuilder};
use resilience_core::clock::ManualClock;
use resilience_core::config::{Config, HealthConfig};
use resilience_core::extractor::BackupReader;
use resilience_core::health::{ConnectionState, HealthMonitor, PrimaryProbe};
use resilience_core::scheduler::BackupScheduler;
use resilience_core::CoreError;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tower::ServiceExt;

struct SwitchProbe {
    connected: AtomicBool,
    hang: AtomicBool,
}

#[async_trait]
impl PrimaryProbe for SwitchProbe {
    async fn connection_state(&self) -> Result<ConnectionState, CoreError> {
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(if self.connected.load(Ordering::SeqCst) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        })
    }
}

#[derive(Clone)]
struct Products {
    source: Arc<MemorySource>,
    reader: Arc<BackupReader>,
}

async fn list_products(State(p): State<Products>, Extension(DegradedMode(degraded)): Extension<DegradedMode>) -> Json<Value> {
    if degraded {
        let data = p.reader.list("products").await.unwrap_or_default();
        return Json(json!({ "source": "backup", "data": data }));
    }
    let snapshot = p.source.full_snapshot().await.unwrap_or_default();
    Json(json!({ "source": "primary", "data": snapshot.collections.get("products") }))
}

async fn create_product(State(p): State<Products>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    p.source.upsert("products", body.clone());
    (StatusCode::CREATED, Json(body))
}

struct Harness {
    clock: Arc<ManualClock>,
    probe: Arc<SwitchProbe>,
    source: Arc<MemorySource>,
    alerts: Arc<AlertSink>,
    scheduler: Arc<BackupScheduler>,
    app: Router,
}

fn harness(config: Config) -> Harness {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 9, 1, 12, 0, 0).unwrap()));
    let probe = Arc::new(SwitchProbe {
        connected: AtomicBool::new(true),
        hang: AtomicBool::new(false),
    });
    let source = Arc::new(MemorySource::new(clock.clone(), "publicId"));
    let archive = Arc::new(MemoryArchive::new(clock.clone()));
    let alerts = Arc::new(AlertSink::new(100, clock.clone()));

    let health = Arc::new(HealthMonitor::new(probe.clone(), clock.clone(), &config.health).with_alerts(alerts.clone()));
    let builder = Arc::new(SnapshotBuilder::new(source.clone(), archive.clone(), clock.clone(), 3));
    let retention = Arc::new(RetentionManager::new(archive.clone(), clock.clone(), RetentionPolicy::default()));
    let scheduler = Arc::new(BackupScheduler::new(
        builder,
        retention,
        archive.clone(),
        alerts.clone(),
        clock.clone(),
        config.scheduler.clone(),
        config.archive.storage_limit_bytes,
    ));
    let reader = Arc::new(BackupReader::new(archive.clone(), "publicId"));

    let state = ApiState {
        health,
        cache: None,
        archive,
        scheduler: scheduler.clone(),
        alerts: alerts.clone(),
        reader: reader.clone(),
        gate: Arc::new(GatePolicy::from_config(&config.gate)),
        started_at: Instant::now(),
    };

    let products = Router::new()
        .route("/products", get(list_products).post(create_product))
        .route("/api/auth/login", post(|| async { Json(json!({ "token": "t" })) }))
        .with_state(Products {
            source: source.clone(),
            reader,
        });

    Harness {
        clock,
        probe,
        source,
        alerts,
        scheduler,
        app: create_router(state, products),
    }
}

async fn send(app: &Router, method: &str, uri: &str, role: Option<&str>, body: Option<Value>) -> (StatusCode, axum::http::HeaderMap, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(role) = role {
        builder = builder.header("x-actor-role", role).header("x-actor-id", "ops-1");
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, headers, json)
}

#[tokio::test]
async fn test_primary_outage_blocks_writes_and_serves_reads_from_backup() {
    let h = harness(Config::default());
    h.source.upsert("products", json!({ "publicId": "p1", "name": "Lamp", "price": 40 }));
    h.source.upsert("products", json!({ "publicId": "p2", "name": "Desk", "price": 250 }));
    h.scheduler.trigger_full_backup_now("ops-1").await;

    let (status, _, body) = send(&h.app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["dependencies"]["primary"]["connected"], true);

    let (status, _, _) = send(&h.app, "POST", "/products", None, Some(json!({ "publicId": "p3" }))).await;
    assert_eq!(status, StatusCode::CREATED);

    // Primary goes away; the cached answer expires after one check interval.
    h.probe.connected.store(false, Ordering::SeqCst);
    h.clock.advance(chrono::Duration::milliseconds(HealthConfig::default().check_interval_ms as i64 + 1));

    let (status, _, body) = send(&h.app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["dependencies"]["primary"]["connected"], false);
    assert_eq!(body["dependencies"]["primary"]["state"], "disconnected");

    let (status, headers, body) = send(&h.app, "POST", "/products", None, Some(json!({ "publicId": "p4" }))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["success"], false);
    assert_eq!(body["safeMode"], true);
    assert_eq!(body["retryAfter"], 30);
    assert!(body["message"].as_str().unwrap().contains("safe mode"));
    assert_eq!(headers.get("retry-after").unwrap(), "30");

    let (status, _, body) = send(&h.app, "GET", "/products", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["source"], "backup");
    assert_eq!(body["data"].as_array().unwrap().len(), 2, "p3 was written after the backup");

    let (status, _, body) = send(&h.app, "GET", "/backups/entities/products/p2", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["name"], "Desk");

    let (status, _, _) = send(&h.app, "POST", "/api/auth/login", None, Some(json!({}))).await;
    assert_eq!(status, StatusCode::OK, "allow-listed mutation");

    assert_eq!(
        h.alerts.critical_history(10)[0].alert_type,
        AlertType::SafeModeEntered
    );

    // Recovery
    h.probe.connected.store(true, Ordering::SeqCst);
    h.clock.advance(chrono::Duration::seconds(6));
    let (status, _, _) = send(&h.app, "POST", "/products", None, Some(json!({ "publicId": "p5" }))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(h.alerts.history(1)[0].alert_type, AlertType::SafeModeExited);
}

#[tokio::test]
async fn test_backup_lifecycle_requires_elevated_role() {
    let h = harness(Config::default());
    h.source.upsert("products", json!({ "publicId": "p1" }));

    let (status, _, _) = send(&h.app, "POST", "/backups/full", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _, _) = send(&h.app, "POST", "/backups/full", Some("operator"), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _, body) = send(&h.app, "POST", "/backups/full", Some("admin"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["backup"]["triggeredBy"], "ops-1");
    assert_eq!(body["backup"]["kind"], "full");

    let (status, _, body) = send(&h.app, "POST", "/backups/incremental", Some("admin"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["skipped"], true);

    // Degraded: still elevated-only, and the gate answers before the handler.
    h.probe.connected.store(false, Ordering::SeqCst);
    h.clock.advance(chrono::Duration::seconds(6));
    let (status, _, _) = send(&h.app, "POST", "/backups/full", Some("operator"), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _, body) = send(&h.app, "GET", "/backups/status", Some("operator"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["scheduler"]["backupsCompleted"], 1);
    assert!(body["alertStats"]["total"].as_u64().unwrap() >= 3);

    let (status, _, body) = send(&h.app, "GET", "/backups/storage", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["storage"]["tier"], "healthy");

    let (status, _, body) = send(&h.app, "GET", "/backups/alerts?limit=1&critical=true", Some("operator"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["alerts"][0]["type"], "safe_mode_entered");
}

#[tokio::test]
async fn test_hung_primary_enters_safe_mode_after_check_timeout() {
    let mut config = Config::default();
    config.health.probe_timeout_ms = 50;
    config.validate().unwrap();
    let h = harness(config);
    h.probe.hang.store(true, Ordering::SeqCst);

    let started = Instant::now();
    let (status, _, body) = send(&h.app, "POST", "/products", None, Some(json!({ "publicId": "p1" }))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["safeMode"], true);
    assert!(started.elapsed() >= std::time::Duration::from_millis(50));

    // Cached: the next write is refused without waiting on the probe again.
    let (status, _, _) = send(&h.app, "POST", "/products", None, Some(json!({ "publicId": "p2" }))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let (status, _, body) = send(&h.app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["dependencies"]["primary"]["state"], "error");
    assert_eq!(h.alerts.critical_history(1)[0].alert_type, AlertType::SafeModeEntered);
    assert!(h.source.full_snapshot().await.unwrap().is_empty());
}
