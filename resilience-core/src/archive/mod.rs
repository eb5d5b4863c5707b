//! Content-addressed backup archive.
//!
//! Entries are pinned under a hash-derived content id and carry a flat
//! key/value metadata map that backups use to find each other again after a
//! restart. `unpin` failures only cost storage; callers log and move on.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub use http::HttpArchive;
pub use memory::MemoryArchive;

pub type PinMetadata = BTreeMap<String, String>;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Archive upload failed: {0}")]
    Upload(String),

    #[error("Archive download failed: {0}")]
    Download(String),

    #[error("Archive unpin failed: {0}")]
    Unpin(String),

    #[error("Archive request timed out: {0}")]
    Timeout(String),

    #[error("Archive rejected credentials")]
    Auth,

    #[error("Archive returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Content not found: {0}")]
    NotFound(String),

    #[error("Content {0} failed integrity check")]
    Integrity(String),

    #[error("Archive transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Archive serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutResult {
    pub content_id: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinnedEntry {
    pub content_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub size_bytes: u64,
    pub pinned_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: PinMetadata,
}

/// Matches entries whose metadata contains every listed pair.
#[derive(Debug, Clone, Default)]
pub struct PinFilter {
    pub metadata: PinMetadata,
}

impl PinFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn matches(&self, metadata: &PinMetadata) -> bool {
        self.metadata.iter().all(|(k, v)| metadata.get(k) == Some(v))
    }
}

#[async_trait]
pub trait Archive: Send + Sync {
    /// Pin raw bytes with a name and metadata sidecar.
    async fn put(&self, bytes: Bytes, name: &str, metadata: PinMetadata) -> Result<PutResult, ArchiveError>;

    /// Pin a JSON document.
    async fn put_json(
        &self,
        value: &serde_json::Value,
        name: &str,
        metadata: PinMetadata,
    ) -> Result<PutResult, ArchiveError>;

    async fn get(&self, content_id: &str) -> Result<Bytes, ArchiveError>;

    /// `Ok(false)` when nothing was pinned under the id.
    async fn unpin(&self, content_id: &str) -> Result<bool, ArchiveError>;

    async fn list(&self, filter: &PinFilter) -> Result<Vec<PinnedEntry>, ArchiveError>;

    async fn test_connection(&self) -> bool;

    /// Total pinned bytes.
    async fn usage_bytes(&self) -> Result<u64, ArchiveError> {
        Ok(self.list(&PinFilter::new()).await?.iter().map(|e| e.size_bytes).sum())
    }
}

/// Hex sha256 of the content, the id scheme of [`MemoryArchive`].
pub fn content_digest(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(bytes))
}
