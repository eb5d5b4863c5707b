//! Injectable wall clock.
//!
//! Everything time-dependent (health TTL, tick calendars, retention ages,
//! manifest timestamps) reads time through [`Clock`] so tests can drive
//! midnight and six-hour boundaries without real waits.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;

/// Longest single sleep; re-reading the clock afterwards absorbs wall-clock jumps.
const MAX_SLEEP_CHUNK: std::time::Duration = std::time::Duration::from_secs(60);

#[async_trait]
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;

    /// Resolve once `now() >= deadline`.
    async fn sleep_until(&self, deadline: DateTime<Utc>);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        loop {
            let remaining = match (deadline - Utc::now()).to_std() {
                Ok(d) if !d.is_zero() => d,
                _ => return,
            };
            tokio::time::sleep(remaining.min(MAX_SLEEP_CHUNK)).await;
        }
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    tx: watch::Sender<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        let (tx, _) = watch::channel(start);
        Self { tx }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        self.tx.send_replace(at);
    }

    pub fn advance(&self, by: Duration) {
        self.tx.send_modify(|now| *now += by);
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.tx.borrow()
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() >= deadline {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
