use resilience_core::Config;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub db_path: PathBuf,
    /// Keep backups in process memory instead of the archive API (local development).
    pub archive_in_memory: bool,
    pub core: Config,
}

impl AppConfig {
    /// `.env`, then an optional `CONFIG_FILE` (TOML), then individual overrides.
    pub fn from_env() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let mut core = match std::env::var("CONFIG_FILE") {
            Ok(path) => Config::from_file(&path)?,
            Err(_) => Config::default(),
        };

        if let Ok(url) = std::env::var("ARCHIVE_URL") {
            core.archive.base_url = url;
        }
        if let Ok(token) = std::env::var("ARCHIVE_TOKEN") {
            core.archive.token = token;
        }
        if let Ok(url) = std::env::var("CACHE_REMOTE_URL") {
            core.cache.remote_url = Some(url).filter(|u| !u.is_empty());
        }
        if let Ok(url) = std::env::var("CACHE_LOCAL_URL") {
            core.cache.local_url = url;
        }
        if let Ok(url) = std::env::var("ALERT_WEBHOOK_URL") {
            core.alerts.webhook_url = Some(url).filter(|u| !u.is_empty());
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            core.log.level = level;
        }
        if let Ok(format) = std::env::var("LOG_FORMAT") {
            core.log.json = format.eq_ignore_ascii_case("json");
        }
        core.validate()?;

        Ok(Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3000),
            db_path: PathBuf::from(std::env::var("DATABASE_PATH").unwrap_or_else(|_| "data/primary.db".into())),
            archive_in_memory: std::env::var("ARCHIVE_IN_MEMORY")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            core,
        })
    }
}
