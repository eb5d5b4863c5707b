//! Crate-wide error type for the resilience core.

use crate::api::gate::GateError;
use crate::archive::ArchiveError;
use crate::backup::BackupError;
use crate::cache::CacheError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Probe failure: {0}")]
    Probe(String),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Gate(#[from] GateError),
}

pub type Result<T> = std::result::Result<T, CoreError>;
