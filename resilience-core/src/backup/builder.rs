//! Snapshot builder: read, serialize, compress, upload, then pin the manifest.
//!
//! Runs are serialized by an internal lock so a full and an incremental never
//! interleave (an incremental must not pick a parent that a concurrent full is
//! about to retire).

use super::catalog::{self, BackupCatalog, PAYLOAD_ID_KEY, ROLE_MANIFEST, ROLE_PAYLOAD};
use super::manifest::{compression_ratio, BackupKind, BackupManifest, PartialManifest};
use super::source::{BackupSource, Snapshot, SnapshotEnvelope, PAYLOAD_FORMAT_VERSION};
use super::{BackupError, BackupFailure};
use crate::archive::Archive;
use crate::clock::Clock;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum IncrementalOutcome {
    Created(BackupManifest),
    #[serde(rename_all = "camelCase")]
    Skipped { message: String, parent_backup_id: String },
}

pub struct SnapshotBuilder {
    source: Arc<dyn BackupSource>,
    archive: Arc<dyn Archive>,
    clock: Arc<dyn Clock>,
    compression_level: i32,
    run_lock: Mutex<()>,
}

/// Everything `publish` needs besides the snapshot itself.
struct PublishPlan<'a> {
    kind: BackupKind,
    backup_id: String,
    created_at: DateTime<Utc>,
    parent_backup_id: Option<String>,
    triggered_by: &'a str,
    started: Instant,
}

impl SnapshotBuilder {
    pub fn new(
        source: Arc<dyn BackupSource>,
        archive: Arc<dyn Archive>,
        clock: Arc<dyn Clock>,
        compression_level: i32,
    ) -> Self {
        Self {
            source,
            archive,
            clock,
            compression_level,
            run_lock: Mutex::new(()),
        }
    }

    pub async fn create_full(&self, triggered_by: &str) -> Result<BackupManifest, BackupFailure> {
        let _guard = self.run_lock.lock().await;
        let started = Instant::now();
        let created_at = self.clock.now();
        let backup_id = new_backup_id(BackupKind::Full, created_at);

        let mut partial = PartialManifest {
            backup_id: backup_id.clone(),
            kind: Some(BackupKind::Full),
            started_at: Some(created_at),
            stage: "read".into(),
            ..Default::default()
        };

        tracing::info!(backup_id = %backup_id, triggered_by, "Creating full backup");
        let snapshot = self
            .source
            .full_snapshot()
            .await
            .map_err(|e| failed(BackupError::Source(format!("{e:#}")), &partial))?;

        let plan = PublishPlan {
            kind: BackupKind::Full,
            backup_id,
            created_at,
            parent_backup_id: None,
            triggered_by,
            started,
        };
        self.publish(plan, snapshot, None, &mut partial).await
    }

    /// Delta since the latest backup, parented on the latest full.
    pub async fn create_incremental(&self, triggered_by: &str) -> Result<IncrementalOutcome, BackupFailure> {
        let _guard = self.run_lock.lock().await;
        let started = Instant::now();
        let created_at = self.clock.now();
        let backup_id = new_backup_id(BackupKind::Incremental, created_at);

        let mut partial = PartialManifest {
            backup_id: backup_id.clone(),
            kind: Some(BackupKind::Incremental),
            started_at: Some(created_at),
            stage: "resolve-parent".into(),
            ..Default::default()
        };

        let catalog = BackupCatalog::load(self.archive.as_ref())
            .await
            .map_err(|e| failed(BackupError::Archive(e), &partial))?;
        let Some(parent) = catalog.latest_full() else {
            return Err(BackupError::NoPriorBackup.into());
        };
        let parent_id = parent.backup_id.clone();
        let since = catalog
            .latest_complete()
            .map(|e| e.created_at)
            .unwrap_or(parent.created_at);
        partial.parent_backup_id = Some(parent_id.clone());

        partial.stage = "read".into();
        let changes = self
            .source
            .changes_since(since)
            .await
            .map_err(|e| failed(BackupError::Source(format!("{e:#}")), &partial))?;

        if changes.is_empty() {
            let message = format!("No changes since {}", since.to_rfc3339());
            tracing::info!(parent = %parent_id, "Skipping incremental backup: {}", message);
            return Ok(IncrementalOutcome::Skipped {
                message,
                parent_backup_id: parent_id,
            });
        }

        let change_count = changes.document_count();
        partial.change_count = Some(change_count);
        tracing::info!(backup_id = %backup_id, parent = %parent_id, change_count, triggered_by, "Creating incremental backup");

        let plan = PublishPlan {
            kind: BackupKind::Incremental,
            backup_id,
            created_at,
            parent_backup_id: Some(parent_id),
            triggered_by,
            started,
        };
        self.publish(plan, changes, Some(change_count), &mut partial)
            .await
            .map(IncrementalOutcome::Created)
    }

    async fn publish(
        &self,
        plan: PublishPlan<'_>,
        snapshot: Snapshot,
        change_count: Option<u64>,
        partial: &mut PartialManifest,
    ) -> Result<BackupManifest, BackupFailure> {
        let document_count = snapshot.document_count();

        partial.stage = "serialize".into();
        let envelope = SnapshotEnvelope {
            format_version: PAYLOAD_FORMAT_VERSION,
            backup_id: plan.backup_id.clone(),
            kind: plan.kind,
            created_at: Some(plan.created_at),
            parent_backup_id: plan.parent_backup_id.clone(),
            collections: snapshot.collections,
        };
        let serialized = serde_json::to_vec(&envelope).map_err(|e| failed(e.into(), partial))?;
        let size_bytes = serialized.len() as u64;
        partial.size_bytes = Some(size_bytes);

        partial.stage = "compress".into();
        let level = self.compression_level;
        let compressed = tokio::task::spawn_blocking(move || zstd::encode_all(&serialized[..], level))
            .await
            .map_err(|e| failed(BackupError::Task(e.to_string()), partial))?
            .map_err(|e| failed(BackupError::Compression(e.to_string()), partial))?;
        let compressed_size_bytes = compressed.len() as u64;
        partial.compressed_size_bytes = Some(compressed_size_bytes);

        partial.stage = "upload".into();
        let payload_metadata = catalog::pin_metadata(
            ROLE_PAYLOAD,
            plan.kind,
            &plan.backup_id,
            plan.created_at,
            plan.parent_backup_id.as_deref(),
        );
        let payload = self
            .archive
            .put(
                Bytes::from(compressed),
                &format!("backup-{}.json.zst", plan.backup_id),
                payload_metadata,
            )
            .await
            .map_err(|e| failed(e.into(), partial))?;
        partial.content_id = Some(payload.content_id.clone());

        let manifest = BackupManifest {
            backup_id: plan.backup_id.clone(),
            kind: plan.kind,
            created_at: plan.created_at,
            size_bytes,
            compressed_size_bytes,
            compression_ratio: compression_ratio(size_bytes, compressed_size_bytes),
            content_id: payload.content_id.clone(),
            parent_backup_id: plan.parent_backup_id.clone(),
            change_count,
            document_count,
            duration_ms: plan.started.elapsed().as_millis() as u64,
            triggered_by: plan.triggered_by.to_string(),
        };

        partial.stage = "manifest".into();
        let mut manifest_metadata = catalog::pin_metadata(
            ROLE_MANIFEST,
            plan.kind,
            &plan.backup_id,
            plan.created_at,
            plan.parent_backup_id.as_deref(),
        );
        manifest_metadata.insert(PAYLOAD_ID_KEY.into(), payload.content_id.clone());
        let manifest_json = serde_json::to_value(&manifest).map_err(|e| failed(e.into(), partial))?;

        if let Err(e) = self
            .archive
            .put_json(&manifest_json, &format!("manifest-{}.json", plan.backup_id), manifest_metadata)
            .await
        {
            // A payload without a manifest is never used; release it now.
            if let Err(unpin_err) = self.archive.unpin(&payload.content_id).await {
                tracing::warn!(content_id = %payload.content_id, error = %unpin_err, "Failed to release orphaned payload");
            }
            return Err(failed(e.into(), partial));
        }

        tracing::info!(
            backup_id = %manifest.backup_id,
            kind = manifest.kind.as_str(),
            size_bytes,
            compressed_size_bytes,
            ratio = manifest.compression_ratio,
            duration_ms = manifest.duration_ms,
            "Backup uploaded"
        );
        Ok(manifest)
    }
}

fn failed(error: BackupError, partial: &PartialManifest) -> BackupFailure {
    BackupFailure {
        error,
        partial: Some(partial.clone()),
    }
}

fn new_backup_id(kind: BackupKind, at: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", kind.as_str(), at.format("%Y%m%dT%H%M%SZ"), &suffix[..8])
}
