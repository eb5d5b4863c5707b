//! Manifest types for full and incremental backups.
//!
//! A manifest is pinned as a JSON sidecar next to the compressed payload it
//! describes. Every incremental names its parent full, so a restore chain is
//! the full plus its incrementals in creation order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Full,
    Incremental,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Incremental => "incremental",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full" => Some(BackupKind::Full),
            "incremental" => Some(BackupKind::Incremental),
            _ => None,
        }
    }
}

/// Immutable record of one completed backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    pub backup_id: String,
    pub kind: BackupKind,
    /// When the snapshot read started; the next incremental diffs from here.
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub compressed_size_bytes: u64,
    pub compression_ratio: f64,
    /// Content id of the compressed payload
    pub content_id: String,
    #[serde(default)]
    pub parent_backup_id: Option<String>,
    #[serde(default)]
    pub change_count: Option<u64>,
    #[serde(default)]
    pub document_count: u64,
    pub duration_ms: u64,
    #[serde(default)]
    pub triggered_by: String,
}

impl BackupManifest {
    /// Alert payload for a successful run.
    pub fn alert_payload(&self) -> Value {
        json!({
            "backupId": self.backup_id,
            "kind": self.kind.as_str(),
            "contentId": self.content_id,
            "sizeBytes": self.size_bytes,
            "compressedSizeBytes": self.compressed_size_bytes,
            "compressionRatio": self.compression_ratio,
            "compressionRatioLabel": format_ratio(self.compression_ratio),
            "parentBackupId": self.parent_backup_id,
            "changeCount": self.change_count,
            "durationMs": self.duration_ms,
            "triggeredBy": self.triggered_by,
        })
    }
}

/// Whatever was known when a backup failed, returned for diagnosis.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialManifest {
    pub backup_id: String,
    pub kind: Option<BackupKind>,
    pub started_at: Option<DateTime<Utc>>,
    pub stage: String,
    pub size_bytes: Option<u64>,
    pub compressed_size_bytes: Option<u64>,
    pub content_id: Option<String>,
    pub parent_backup_id: Option<String>,
    pub change_count: Option<u64>,
}

/// Uncompressed over compressed size, rounded to two decimals.
pub fn compression_ratio(size_bytes: u64, compressed_size_bytes: u64) -> f64 {
    if compressed_size_bytes == 0 {
        return 0.0;
    }
    let ratio = size_bytes as f64 / compressed_size_bytes as f64;
    (ratio * 100.0).round() / 100.0
}

pub fn format_ratio(ratio: f64) -> String {
    format!("{:.2}:1", ratio)
}
