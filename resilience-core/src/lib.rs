//! Resilience core
//!
//! Keeps a service answering reads while its primary store is down: a cached
//! health probe drives a safe-mode gate, a cache client fails over from remote
//! to local, and a scheduler keeps full and incremental backups flowing into a
//! content-addressed archive from which degraded reads are served.

pub mod alerts;
pub mod api;
pub mod archive;
pub mod backup;
pub mod cache;
pub mod clock;
pub mod config;
pub mod extractor;
pub mod health;
pub mod scheduler;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::CoreError;
pub type Result<T> = std::result::Result<T, CoreError>;
