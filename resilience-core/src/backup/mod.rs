//! Backups: snapshot building, the archive catalog and retention.

pub mod builder;
pub mod catalog;
pub mod manifest;
pub mod retention;
pub mod source;

use crate::archive::ArchiveError;
use manifest::PartialManifest;
use thiserror::Error;

pub use builder::{IncrementalOutcome, SnapshotBuilder};
pub use catalog::BackupCatalog;
pub use manifest::{BackupKind, BackupManifest};
pub use retention::{RetentionManager, RetentionPolicy, RetentionReport};
pub use source::{BackupSource, Snapshot};

#[derive(Error, Debug)]
pub enum BackupError {
    /// No full backup exists to parent an incremental.
    #[error("No prior full backup to base an incremental on")]
    NoPriorBackup,

    #[error("Failed to read backup source: {0}")]
    Source(String),

    #[error("Failed to serialize snapshot: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Compression failed: {0}")]
    Compression(String),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("Backup task aborted: {0}")]
    Task(String),
}

/// A failed backup with whatever was learned before it failed.
#[derive(Error, Debug)]
#[error("{error}")]
pub struct BackupFailure {
    pub error: BackupError,
    pub partial: Option<PartialManifest>,
}

impl BackupFailure {
    pub fn is_no_prior_backup(&self) -> bool {
        matches!(self.error, BackupError::NoPriorBackup)
    }
}

impl From<BackupError> for BackupFailure {
    fn from(error: BackupError) -> Self {
        Self { error, partial: None }
    }
}
