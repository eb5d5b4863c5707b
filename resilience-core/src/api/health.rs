//! Aggregate health endpoint.

use super::gate::{current_mode, GateMode};
use super::ApiState;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::{json, Value};

/// GET /health - always 200 while the process can answer
pub async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let mode = current_mode(&state).await;
    let primary = state.health.status().await;

    let cache = async {
        match &state.cache {
            Some(cache) => {
                let reachable = cache.ping().await.is_ok();
                json!({ "configured": true, "mode": cache.mode().await, "connected": reachable })
            }
            None => json!({ "configured": false, "connected": false }),
        }
    };
    let archive = async { json!({ "connected": state.archive.test_connection().await }) };
    let (cache, archive): (Value, Value) = tokio::join!(cache, archive);

    let scheduler = state.scheduler.state();

    Json(json!({
        "status": if mode == GateMode::Normal { "ok" } else { "degraded" },
        "mode": mode,
        "safeMode": mode == GateMode::Degraded,
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "dependencies": {
            "primary": {
                "connected": primary.is_healthy,
                "state": primary.last_state,
                "lastCheckedAt": primary.last_checked_at,
                "checkIntervalMs": primary.check_interval_ms,
            },
            "cache": cache,
            "archive": archive,
        },
        "scheduler": {
            "isRunning": scheduler.is_running,
            "lastFullBackup": scheduler.last_full_backup,
            "lastIncrementalBackup": scheduler.last_incremental_backup,
            "backupsCompleted": scheduler.backups_completed,
            "backupsFailed": scheduler.backups_failed,
        },
    }))
}
