//! Cache failover client.
//!
//! One logical cache handle over two endpoints. A configured remote endpoint
//! is tried first; the first connection-class error tears it down and the
//! client repoints to the local endpoint for the rest of the process. The
//! local endpoint reconnects with capped exponential backoff.
//!
//! The swap is not atomic with the call that hit the dying remote: that call
//! returns its error. Cache users treat every operation as best-effort.

pub mod resp;

use crate::config::CacheConfig;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache connection error: {0}")]
    Connection(String),

    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache command error: {0}")]
    Command(String),

    #[error("Cache unavailable, reconnecting (attempt {attempt})")]
    Unavailable { attempt: u32 },
}

impl CacheError {
    /// Timeouts, refusals, resets and handshake failures.
    pub fn is_connection_class(&self) -> bool {
        matches!(self, CacheError::Connection(_) | CacheError::Io(_))
    }
}

/// A live connection to one cache endpoint.
#[async_trait]
pub trait CacheConnection: Send {
    async fn ping(&mut self) -> Result<(), CacheError>;
    async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;
    async fn set(&mut self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError>;
    async fn expire(&mut self, key: &str, ttl: Duration) -> Result<bool, CacheError>;
}

/// Opens connections; swapped for a fake in tests.
#[async_trait]
pub trait CacheConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn CacheConnection>, CacheError>;
}

pub struct RespConnector {
    connect_timeout: Duration,
}

impl RespConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl CacheConnector for RespConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn CacheConnection>, CacheError> {
        let conn = resp::RespConnection::connect(url, self.connect_timeout).await?;
        Ok(Box::new(conn))
    }
}

/// Public view of the link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    Remote,
    Local,
    Reconnecting,
}

enum Link {
    Remote(Box<dyn CacheConnection>),
    Local(Box<dyn CacheConnection>),
    Reconnecting { attempt: u32, retry_at: Instant },
}

impl Link {
    fn mode(&self) -> CacheMode {
        match self {
            Link::Remote(_) => CacheMode::Remote,
            Link::Local(_) => CacheMode::Local,
            Link::Reconnecting { .. } => CacheMode::Reconnecting,
        }
    }
}

/// Capped exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

enum Command<'a> {
    Ping,
    Get(&'a str),
    Set(&'a str, &'a [u8], Option<Duration>),
    Expire(&'a str, Duration),
}

enum Reply {
    Unit,
    Value(Option<Vec<u8>>),
    Flag(bool),
}

pub struct FailoverCache {
    connector: Arc<dyn CacheConnector>,
    remote_url: Option<String>,
    local_url: String,
    backoff: Backoff,
    command_timeout: Duration,
    link: Mutex<Link>,
}

impl FailoverCache {
    /// Connect, preferring the remote endpoint. Never fails: when neither
    /// endpoint answers the client starts in `Reconnecting`.
    pub async fn connect(connector: Arc<dyn CacheConnector>, config: &CacheConfig) -> Self {
        let backoff = Backoff {
            base: Duration::from_millis(config.reconnect_base_ms),
            max: Duration::from_millis(config.reconnect_max_ms),
        };
        let cache = Self {
            connector,
            remote_url: config.remote_url.clone(),
            local_url: config.local_url.clone(),
            backoff,
            command_timeout: Duration::from_millis(config.command_timeout_ms),
            link: Mutex::new(Link::Reconnecting {
                attempt: 0,
                retry_at: Instant::now(),
            }),
        };

        let initial = cache.initial_link().await;
        *cache.link.lock().await = initial;
        cache
    }

    async fn initial_link(&self) -> Link {
        if let Some(remote) = &self.remote_url {
            match self.connector.connect(remote).await {
                Ok(conn) => {
                    tracing::info!("Connected to remote cache");
                    return Link::Remote(conn);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Remote cache unavailable, falling back to local");
                }
            }
        }
        self.connect_local(0).await
    }

    async fn connect_local(&self, previous_attempts: u32) -> Link {
        match self.connector.connect(&self.local_url).await {
            Ok(conn) => {
                tracing::info!(url = %self.local_url, "Connected to local cache");
                Link::Local(conn)
            }
            Err(e) => {
                let attempt = previous_attempts + 1;
                let delay = self.backoff.delay(attempt);
                tracing::warn!(
                    error = %e,
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    "Local cache unavailable"
                );
                Link::Reconnecting {
                    attempt,
                    retry_at: Instant::now() + delay,
                }
            }
        }
    }

    pub async fn mode(&self) -> CacheMode {
        self.link.lock().await.mode()
    }

    pub async fn ping(&self) -> Result<(), CacheError> {
        self.execute(Command::Ping).await.map(|_| ())
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        match self.execute(Command::Get(key)).await? {
            Reply::Value(v) => Ok(v),
            _ => Ok(None),
        }
    }

    pub async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError> {
        self.execute(Command::Set(key, value, ttl)).await.map(|_| ())
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        match self.execute(Command::Expire(key, ttl)).await? {
            Reply::Flag(f) => Ok(f),
            _ => Ok(false),
        }
    }

    async fn execute(&self, command: Command<'_>) -> Result<Reply, CacheError> {
        let mut link = self.link.lock().await;

        if let Link::Reconnecting { attempt, retry_at } = *link {
            if Instant::now() < retry_at {
                return Err(CacheError::Unavailable { attempt });
            }
            *link = self.connect_local(attempt).await;
            if let Link::Reconnecting { attempt, .. } = *link {
                return Err(CacheError::Unavailable { attempt });
            }
        }

        let conn = match &mut *link {
            Link::Remote(conn) | Link::Local(conn) => conn,
            Link::Reconnecting { attempt, .. } => return Err(CacheError::Unavailable { attempt: *attempt }),
        };

        let result = match tokio::time::timeout(self.command_timeout, run(conn.as_mut(), command)).await {
            Ok(r) => r,
            Err(_) => Err(CacheError::Connection("command timed out".into())),
        };

        if let Err(e) = &result {
            if e.is_connection_class() {
                match link.mode() {
                    CacheMode::Remote => {
                        tracing::warn!(error = %e, "Remote cache connection lost, switching to local");
                        *link = self.connect_local(0).await;
                    }
                    CacheMode::Local => {
                        tracing::warn!(error = %e, "Local cache connection lost");
                        let delay = self.backoff.delay(1);
                        *link = Link::Reconnecting {
                            attempt: 1,
                            retry_at: Instant::now() + delay,
                        };
                    }
                    CacheMode::Reconnecting => {}
                }
            }
        }

        result
    }
}

async fn run(conn: &mut dyn CacheConnection, command: Command<'_>) -> Result<Reply, CacheError> {
    match command {
        Command::Ping => conn.ping().await.map(|_| Reply::Unit),
        Command::Get(key) => conn.get(key).await.map(Reply::Value),
        Command::Set(key, value, ttl) => conn.set(key, value, ttl).await.map(|_| Reply::Unit),
        Command::Expire(key, ttl) => conn.expire(key, ttl).await.map(Reply::Flag),
    }
}
