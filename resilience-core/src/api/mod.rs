//! HTTP surface: health, backup endpoints and the degradation gate.

pub mod backups;
pub mod error;
pub mod gate;
pub mod health;

use crate::alerts::AlertSink;
use crate::archive::Archive;
use crate::cache::FailoverCache;
use crate::extractor::BackupReader;
use crate::health::HealthMonitor;
use crate::scheduler::BackupScheduler;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use gate::GatePolicy;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

/// Shared application state
#[derive(Clone)]
pub struct ApiState {
    pub health: Arc<HealthMonitor>,
    pub cache: Option<Arc<FailoverCache>>,
    pub archive: Arc<dyn Archive>,
    pub scheduler: Arc<BackupScheduler>,
    pub alerts: Arc<AlertSink>,
    pub reader: Arc<BackupReader>,
    pub gate: Arc<GatePolicy>,
    pub started_at: Instant,
}

/// Resilience routes without the gate.
pub fn routes(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/backups/status", get(backups::status))
        .route("/backups/full", post(backups::trigger_full))
        .route("/backups/incremental", post(backups::trigger_incremental))
        .route("/backups/storage", get(backups::storage))
        .route("/backups/alerts", get(backups::alerts))
        .route("/backups/entities/{collection}/{key}", get(backups::entity))
        .with_state(state)
}

/// Put `router` behind the degradation gate.
pub fn protect(router: Router, state: ApiState) -> Router {
    router
        .layer(middleware::from_fn_with_state(state, gate::degradation_gate))
        .layer(TraceLayer::new_for_http())
}

/// Resilience routes merged with the application's own, all gated.
pub fn create_router(state: ApiState, app: Router) -> Router {
    protect(routes(state.clone()).merge(app), state)
}
