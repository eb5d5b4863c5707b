//! Configuration for the resilience core.
//!
//! Loads from a TOML file; every field has a default so partial files are valid.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// How long a probe result stays cached
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,

    /// Upper bound on a single connectivity probe
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Managed cache endpoint, tried first when set
    #[serde(default)]
    pub remote_url: Option<String>,

    /// Local fallback endpoint
    #[serde(default = "default_local_cache_url")]
    pub local_url: String,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// First reconnect delay for the local endpoint
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,

    /// Reconnect delay ceiling
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Archive API base URL
    #[serde(default = "default_archive_url")]
    pub base_url: String,

    /// Bearer token
    #[serde(default)]
    pub token: String,

    #[serde(default = "default_upload_timeout_secs")]
    pub upload_timeout_secs: u64,

    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,

    /// Plan quota used for the storage check
    #[serde(default = "default_storage_limit_bytes")]
    pub storage_limit_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_full_backups_to_keep")]
    pub full_backups_to_keep: usize,

    #[serde(default = "default_incremental_retention_days")]
    pub incremental_retention_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub full_enabled: bool,

    #[serde(default = "default_true")]
    pub incremental_enabled: bool,

    #[serde(default = "default_true")]
    pub storage_check_enabled: bool,

    #[serde(default = "default_incremental_interval_hours")]
    pub incremental_interval_hours: u32,

    #[serde(default = "default_storage_warning_percent")]
    pub storage_warning_percent: f64,

    #[serde(default = "default_storage_critical_percent")]
    pub storage_critical_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Ring buffer size
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Optional webhook receiving every recorded event
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Mutation paths still permitted while degraded
    #[serde(default = "default_allow_list")]
    pub allow_list: Vec<String>,

    /// Backup lifecycle paths that additionally require an elevated role
    #[serde(default = "default_backup_lifecycle")]
    pub backup_lifecycle: Vec<String>,

    #[serde(default = "default_retry_after_secs")]
    pub retry_after_secs: u64,

    /// Header carrying the caller's role, set by the upstream auth layer
    #[serde(default = "default_role_header")]
    pub role_header: String,

    /// Header carrying the caller's identity, recorded as `triggeredBy`
    #[serde(default = "default_actor_header")]
    pub actor_header: String,

    /// Roles allowed to create, restore or delete backups
    #[serde(default = "default_elevated_roles")]
    pub elevated_roles: Vec<String>,

    /// Roles allowed to read backup status and alerts
    #[serde(default = "default_operator_roles")]
    pub operator_roles: Vec<String>,

    /// Bound on the health lookup done by the gate. Must exceed the probe timeout.
    #[serde(default = "default_gate_timeout_ms")]
    pub evaluation_timeout_ms: u64,

    /// Mode assumed when the gate cannot decide
    #[serde(default)]
    pub on_evaluation_error: FailurePolicy,
}

/// What the degradation gate does when its own evaluation fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Treat the service as healthy and let the request through.
    #[default]
    FailOpen,
    /// Treat the service as degraded.
    FailClosed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Stable public identifier field used for lookups
    #[serde(default = "default_id_field")]
    pub id_field: String,

    /// zstd level (1-22)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    /// How long degraded reads reuse one archive catalog listing
    #[serde(default = "default_catalog_ttl_ms")]
    pub catalog_ttl_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// One JSON object per line instead of the human-readable format.
    #[serde(default)]
    pub json: bool,
}

// Default values
fn default_check_interval_ms() -> u64 {
    5_000
}

fn default_probe_timeout_ms() -> u64 {
    2_000
}

fn default_local_cache_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    2_000
}

fn default_command_timeout_ms() -> u64 {
    1_000
}

fn default_reconnect_base_ms() -> u64 {
    1_000
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_archive_url() -> String {
    "http://localhost:5001".to_string()
}

fn default_upload_timeout_secs() -> u64 {
    120
}

fn default_download_timeout_secs() -> u64 {
    60
}

fn default_storage_limit_bytes() -> u64 {
    1024 * 1024 * 1024 // 1GB
}

fn default_full_backups_to_keep() -> usize {
    1
}

fn default_incremental_retention_days() -> i64 {
    3
}

fn default_true() -> bool {
    true
}

fn default_incremental_interval_hours() -> u32 {
    6
}

fn default_storage_warning_percent() -> f64 {
    80.0
}

fn default_storage_critical_percent() -> f64 {
    90.0
}

fn default_history_capacity() -> usize {
    500
}

fn default_allow_list() -> Vec<String> {
    vec![
        "/api/ledger/transfers".to_string(),
        "/api/ledger/transfers/*".to_string(),
        "/api/auth/*".to_string(),
        "/backups/*".to_string(),
    ]
}

fn default_backup_lifecycle() -> Vec<String> {
    vec![
        "/backups/full".to_string(),
        "/backups/incremental".to_string(),
        "/backups/restore".to_string(),
        "/backups/restore/*".to_string(),
        "/backups/delete/*".to_string(),
    ]
}

fn default_retry_after_secs() -> u64 {
    30
}

fn default_role_header() -> String {
    "x-actor-role".to_string()
}

fn default_actor_header() -> String {
    "x-actor-id".to_string()
}

fn default_elevated_roles() -> Vec<String> {
    vec!["admin".to_string()]
}

fn default_operator_roles() -> Vec<String> {
    vec!["admin".to_string(), "operator".to_string()]
}

fn default_gate_timeout_ms() -> u64 {
    2_500
}

fn default_id_field() -> String {
    "publicId".to_string()
}

fn default_compression_level() -> i32 {
    3
}

fn default_catalog_ttl_ms() -> u64 {
    5_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: default_check_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            remote_url: None,
            local_url: default_local_cache_url(),
            connect_timeout_ms: default_connect_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            base_url: default_archive_url(),
            token: String::new(),
            upload_timeout_secs: default_upload_timeout_secs(),
            download_timeout_secs: default_download_timeout_secs(),
            storage_limit_bytes: default_storage_limit_bytes(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            full_backups_to_keep: default_full_backups_to_keep(),
            incremental_retention_days: default_incremental_retention_days(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            full_enabled: true,
            incremental_enabled: true,
            storage_check_enabled: true,
            incremental_interval_hours: default_incremental_interval_hours(),
            storage_warning_percent: default_storage_warning_percent(),
            storage_critical_percent: default_storage_critical_percent(),
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
            webhook_url: None,
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            allow_list: default_allow_list(),
            backup_lifecycle: default_backup_lifecycle(),
            retry_after_secs: default_retry_after_secs(),
            role_header: default_role_header(),
            actor_header: default_actor_header(),
            elevated_roles: default_elevated_roles(),
            operator_roles: default_operator_roles(),
            evaluation_timeout_ms: default_gate_timeout_ms(),
            on_evaluation_error: FailurePolicy::default(),
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            id_field: default_id_field(),
            compression_level: default_compression_level(),
            catalog_ttl_ms: default_catalog_ttl_ms(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the components cannot operate with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.retention.full_backups_to_keep == 0 {
            anyhow::bail!("retention.full_backups_to_keep must be at least 1");
        }
        if self.scheduler.incremental_interval_hours == 0 || 24 % self.scheduler.incremental_interval_hours != 0 {
            anyhow::bail!("scheduler.incremental_interval_hours must divide 24");
        }
        if self.scheduler.storage_warning_percent >= self.scheduler.storage_critical_percent {
            anyhow::bail!("scheduler.storage_warning_percent must be below storage_critical_percent");
        }
        if self.gate.evaluation_timeout_ms <= self.health.probe_timeout_ms {
            anyhow::bail!("gate.evaluation_timeout_ms must exceed health.probe_timeout_ms");
        }
        if self.alerts.history_capacity == 0 {
            anyhow::bail!("alerts.history_capacity must be at least 1");
        }
        Ok(())
    }
}
