//! Utility modules shared across the resilience core.

pub mod errors;
pub mod logger;

pub use errors::{CoreError, Result};
