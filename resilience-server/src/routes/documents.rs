//! Document CRUD backed by the primary store. Reads fall back to the latest
//! backup while the gate reports degraded mode.

use crate::services::primary_store::SqlitePrimaryStore;
use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use resilience_core::api::error::ApiError;
use resilience_core::api::gate::DegradedMode;
use resilience_core::extractor::BackupReader;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Clone)]
pub struct DocumentsState {
    pub store: Arc<SqlitePrimaryStore>,
    pub reader: Arc<BackupReader>,
}

pub fn router(store: Arc<SqlitePrimaryStore>, reader: Arc<BackupReader>) -> Router {
    Router::new()
        .route("/api/documents/{collection}", get(list).post(upsert))
        .route("/api/documents/{collection}/{key}", get(get_one))
        .with_state(DocumentsState { store, reader })
}

fn backup_unavailable(e: impl std::fmt::Display) -> ApiError {
    ApiError::ServiceUnavailable(format!("Backup snapshot unavailable: {e}"))
}

async fn list(
    State(state): State<DocumentsState>,
    Extension(DegradedMode(degraded)): Extension<DegradedMode>,
    Path(collection): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if degraded {
        let data = state.reader.list(&collection).await.map_err(backup_unavailable)?;
        return Ok(Json(json!({ "success": true, "source": "backup", "data": data })));
    }
    let data = state.store.list(&collection).await?;
    Ok(Json(json!({ "success": true, "source": "primary", "data": data })))
}

async fn get_one(
    State(state): State<DocumentsState>,
    Extension(DegradedMode(degraded)): Extension<DegradedMode>,
    Path((collection, key)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let (source, doc) = if degraded {
        let doc = state
            .reader
            .lookup_entity(&collection, &key)
            .await
            .map_err(backup_unavailable)?;
        ("backup", doc)
    } else {
        ("primary", state.store.get(&collection, &key).await?)
    };
    let doc = doc.ok_or_else(|| ApiError::NotFound(format!("{collection}/{key} not found")))?;
    Ok(Json(json!({ "success": true, "source": source, "data": doc })))
}

async fn upsert(
    State(state): State<DocumentsState>,
    Path(collection): Path<String>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    if !body.is_object() {
        return Err(ApiError::BadRequest("Document body must be a JSON object".into()));
    }
    if body.get(state.store.id_field()).is_none() {
        return Err(ApiError::BadRequest(format!(
            "Document is missing '{}'",
            state.store.id_field()
        )));
    }
    let id = state.store.upsert(&collection, body.clone()).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "id": id, "data": body })),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::create_pool;
    use crate::db::migrate::migrate;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::{TimeZone, Utc};
    use http_body_util::BodyExt;
    use resilience_core::archive::MemoryArchive;
    use resilience_core::clock::ManualClock;
    use tower::ServiceExt;

    async fn call(app: &Router, degraded: bool, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .extension(DegradedMode(degraded));
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_reads_switch_to_backup_when_degraded() {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_pool(&dir.path().join("primary.db")).unwrap();
        migrate(&pool).unwrap();
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 8, 1, 0, 0, 0).unwrap()));
        let store = Arc::new(SqlitePrimaryStore::new(pool, clock.clone(), "publicId"));
        let reader = Arc::new(BackupReader::new(Arc::new(MemoryArchive::new(clock)), "publicId"));
        let app = router(store, reader);

        let (status, body) = call(&app, false, "POST", "/api/documents/products", Some(json!({ "publicId": "p1" }))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["id"], "p1");

        let (status, _) = call(&app, false, "POST", "/api/documents/products", Some(json!({ "name": "x" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(&app, false, "GET", "/api/documents/products/p1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["source"], "primary");

        // Nothing has been backed up, so the degraded view is empty.
        let (status, body) = call(&app, true, "GET", "/api/documents/products", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["source"], "backup");
        assert_eq!(body["data"].as_array().unwrap().len(), 0);

        let (status, _) = call(&app, true, "GET", "/api/documents/products/p1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
