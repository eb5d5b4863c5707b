//! Entity reads served from the newest archived snapshot.
//!
//! The restore chain (latest full, then its incrementals oldest first) is
//! downloaded, decompressed and folded into one keyed view. Documents are
//! keyed by their stable public identifier. The view is cached until a newer
//! backup shows up in the catalog. The catalog itself is re-read at most once
//! per TTL, and while the archive cannot be reached the last good view keeps
//! answering.

use crate::archive::Archive;
use crate::backup::catalog::{BackupCatalog, CatalogEntry};
use crate::backup::source::SnapshotEnvelope;
use crate::backup::BackupError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotInfo {
    pub full_backup_id: String,
    pub incremental_backup_ids: Vec<String>,
    pub as_of: DateTime<Utc>,
    pub document_count: usize,
}

struct View {
    chain: Vec<String>,
    info: SnapshotInfo,
    collections: BTreeMap<String, BTreeMap<String, Value>>,
}

#[derive(Default)]
struct Cached {
    view: Option<Arc<View>>,
    checked_at: Option<Instant>,
}

pub struct BackupReader {
    archive: Arc<dyn Archive>,
    id_field: String,
    catalog_ttl: Duration,
    cached: Mutex<Cached>,
}

impl BackupReader {
    pub fn new(archive: Arc<dyn Archive>, id_field: impl Into<String>) -> Self {
        Self {
            archive,
            id_field: id_field.into(),
            catalog_ttl: Duration::ZERO,
            cached: Mutex::new(Cached::default()),
        }
    }

    /// Reuse the last catalog listing for `ttl` before asking the archive again.
    pub fn with_catalog_ttl(mut self, ttl: Duration) -> Self {
        self.catalog_ttl = ttl;
        self
    }

    /// `Ok(None)` when no backup exists or the key is absent from it.
    pub async fn lookup_entity(&self, collection: &str, key: &str) -> Result<Option<Value>, BackupError> {
        let Some(view) = self.current().await? else {
            return Ok(None);
        };
        Ok(view.collections.get(collection).and_then(|docs| docs.get(key)).cloned())
    }

    pub async fn list(&self, collection: &str) -> Result<Vec<Value>, BackupError> {
        let Some(view) = self.current().await? else {
            return Ok(Vec::new());
        };
        Ok(view
            .collections
            .get(collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default())
    }

    pub async fn snapshot_info(&self) -> Result<Option<SnapshotInfo>, BackupError> {
        Ok(self.current().await?.map(|v| v.info.clone()))
    }

    async fn current(&self) -> Result<Option<Arc<View>>, BackupError> {
        let mut cached = self.cached.lock().await;
        if let Some(at) = cached.checked_at {
            if at.elapsed() < self.catalog_ttl {
                return Ok(cached.view.clone());
            }
        }

        let catalog = match BackupCatalog::load(self.archive.as_ref()).await {
            Ok(catalog) => catalog,
            Err(e) => {
                let Some(view) = cached.view.clone() else {
                    return Err(e.into());
                };
                tracing::warn!(
                    error = %e,
                    full = %view.info.full_backup_id,
                    "Backup catalog unavailable, serving cached snapshot"
                );
                cached.checked_at = Some(Instant::now());
                return Ok(Some(view));
            }
        };
        let Some((full, incrementals)) = catalog.restore_chain() else {
            cached.view = None;
            cached.checked_at = Some(Instant::now());
            return Ok(None);
        };
        let chain: Vec<String> = std::iter::once(full)
            .chain(incrementals.iter().copied())
            .map(|e| e.backup_id.clone())
            .collect();

        if let Some(view) = cached.view.clone() {
            if view.chain == chain {
                cached.checked_at = Some(Instant::now());
                return Ok(Some(view));
            }
        }

        let view = match self.build(full, &incrementals, chain).await {
            Ok(view) => Arc::new(view),
            Err(e) => {
                let Some(view) = cached.view.clone() else {
                    return Err(e);
                };
                tracing::warn!(
                    error = %e,
                    full = %view.info.full_backup_id,
                    "Newer backup unreadable, serving cached snapshot"
                );
                return Ok(Some(view));
            }
        };
        tracing::info!(
            full = %view.info.full_backup_id,
            incrementals = view.info.incremental_backup_ids.len(),
            documents = view.info.document_count,
            "Loaded backup snapshot for degraded reads"
        );
        cached.view = Some(view.clone());
        cached.checked_at = Some(Instant::now());
        Ok(Some(view))
    }

    async fn build(
        &self,
        full: &CatalogEntry,
        incrementals: &[&CatalogEntry],
        chain: Vec<String>,
    ) -> Result<View, BackupError> {
        let mut collections: BTreeMap<String, BTreeMap<String, Value>> = BTreeMap::new();
        let mut as_of = full.created_at;

        for entry in std::iter::once(full).chain(incrementals.iter().copied()) {
            let envelope = self.fetch_envelope(entry).await?;
            as_of = envelope.created_at.unwrap_or(entry.created_at);
            for (collection, docs) in envelope.collections {
                let keyed = collections.entry(collection).or_default();
                for doc in docs {
                    match doc.get(&self.id_field).and_then(entity_key) {
                        Some(key) => {
                            keyed.insert(key, doc);
                        }
                        None => tracing::debug!(backup_id = %entry.backup_id, "Skipping document without public id"),
                    }
                }
            }
        }

        let document_count = collections.values().map(|docs| docs.len()).sum();
        Ok(View {
            info: SnapshotInfo {
                full_backup_id: full.backup_id.clone(),
                incremental_backup_ids: incrementals.iter().map(|e| e.backup_id.clone()).collect(),
                as_of,
                document_count,
            },
            chain,
            collections,
        })
    }

    async fn fetch_envelope(&self, entry: &CatalogEntry) -> Result<SnapshotEnvelope, BackupError> {
        let pin = entry.payload.as_ref().ok_or_else(|| {
            BackupError::Source(format!("backup {} has no payload", entry.backup_id))
        })?;
        let compressed = self.archive.get(&pin.content_id).await?;
        let raw = tokio::task::spawn_blocking(move || zstd::decode_all(&compressed[..]))
            .await
            .map_err(|e| BackupError::Task(e.to_string()))?
            .map_err(|e| BackupError::Compression(e.to_string()))?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

/// Public ids may be stored as strings or numbers.
fn entity_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
