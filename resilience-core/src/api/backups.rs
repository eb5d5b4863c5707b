//! Backup endpoints: status, manual triggers, storage, alerts and
//! archive-sourced entity reads.

use super::error::ApiError;
use super::gate::Access;
use super::ApiState;
use crate::scheduler::RunOutcome;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

const RECENT_ALERTS: usize = 20;

/// GET /backups/status
pub async fn status(State(state): State<ApiState>, headers: HeaderMap) -> Result<impl IntoResponse, ApiError> {
    state.gate.authorize(&headers, Access::Operator)?;
    Ok(Json(json!({
        "success": true,
        "scheduler": state.scheduler.state(),
        "recentAlerts": state.alerts.history(RECENT_ALERTS),
        "criticalAlerts": state.alerts.critical_history(RECENT_ALERTS),
        "alertStats": state.alerts.stats(),
    })))
}

/// POST /backups/full
pub async fn trigger_full(State(state): State<ApiState>, headers: HeaderMap) -> Result<Response, ApiError> {
    let actor = state.gate.authorize(&headers, Access::Elevated)?;
    tracing::info!(actor = %actor.id, "Manual full backup requested");
    outcome_response(state.scheduler.trigger_full_backup_now(&actor.id).await)
}

/// POST /backups/incremental
pub async fn trigger_incremental(State(state): State<ApiState>, headers: HeaderMap) -> Result<Response, ApiError> {
    let actor = state.gate.authorize(&headers, Access::Elevated)?;
    tracing::info!(actor = %actor.id, "Manual incremental backup requested");
    outcome_response(state.scheduler.trigger_incremental_backup_now(&actor.id).await)
}

fn outcome_response(outcome: RunOutcome) -> Result<Response, ApiError> {
    let response = match outcome {
        RunOutcome::Completed { manifest } => Json(json!({ "success": true, "backup": manifest })).into_response(),
        RunOutcome::FallbackCompleted { manifest } => {
            Json(json!({ "success": true, "fallback": true, "backup": manifest })).into_response()
        }
        RunOutcome::Skipped {
            message,
            parent_backup_id,
        } => Json(json!({
            "success": true,
            "skipped": true,
            "message": message,
            "parentBackupId": parent_backup_id,
        }))
        .into_response(),
        RunOutcome::Failed {
            reason,
            partial_manifest,
            fallback,
        } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "success": false,
                "error": reason,
                "fallback": fallback,
                "partialManifest": partial_manifest,
            })),
        )
            .into_response(),
        RunOutcome::AlreadyRunning { kind } => {
            return Err(ApiError::Conflict(format!("A {} backup is already in progress", kind.as_str())));
        }
    };
    Ok(response)
}

/// GET /backups/storage
pub async fn storage(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    let stats = state
        .scheduler
        .storage_stats()
        .await
        .map_err(|e| ApiError::ServiceUnavailable(format!("Archive unavailable: {e}")))?;
    Ok(Json(json!({ "success": true, "storage": stats })))
}

#[derive(Debug, Deserialize)]
pub struct AlertQuery {
    #[serde(default = "default_alert_limit")]
    pub limit: usize,
    #[serde(default)]
    pub critical: bool,
}

fn default_alert_limit() -> usize {
    50
}

/// GET /backups/alerts?limit=&critical=
pub async fn alerts(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<AlertQuery>,
) -> Result<impl IntoResponse, ApiError> {
    state.gate.authorize(&headers, Access::Operator)?;
    let alerts = if query.critical {
        state.alerts.critical_history(query.limit)
    } else {
        state.alerts.history(query.limit)
    };
    Ok(Json(json!({
        "success": true,
        "alerts": alerts,
        "stats": state.alerts.stats(),
    })))
}

/// GET /backups/entities/{collection}/{key}
pub async fn entity(
    State(state): State<ApiState>,
    Path((collection, key)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let doc = state
        .reader
        .lookup_entity(&collection, &key)
        .await
        .map_err(|e| ApiError::ServiceUnavailable(format!("Backup snapshot unavailable: {e}")))?
        .ok_or_else(|| ApiError::NotFound(format!("{collection}/{key} not found in latest backup")))?;
    Ok(Json(json!({ "success": true, "source": "backup", "data": doc })))
}
