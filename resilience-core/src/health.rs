//! Primary-store health monitor.
//!
//! `is_healthy()` sits on the request path: it returns the cached result
//! while it is younger than `check_interval_ms` and re-probes otherwise.
//! The probe is bounded by a timeout and every failure maps to `false`.

use crate::alerts::{AlertSink, AlertType, Severity};
use crate::clock::Clock;
use crate::config::HealthConfig;
use crate::utils::CoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Connection state reported by the primary store driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Connecting,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Error => "error",
        }
    }
}

/// Connectivity query against the primary store.
#[async_trait]
pub trait PrimaryProbe: Send + Sync {
    async fn connection_state(&self) -> Result<ConnectionState, CoreError>;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub is_healthy: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub check_interval_ms: u64,
    pub last_state: Option<ConnectionState>,
}

pub struct HealthMonitor {
    probe: Arc<dyn PrimaryProbe>,
    clock: Arc<dyn Clock>,
    alerts: Option<Arc<AlertSink>>,
    status: Arc<Mutex<HealthStatus>>,
    probe_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(probe: Arc<dyn PrimaryProbe>, clock: Arc<dyn Clock>, config: &HealthConfig) -> Self {
        Self {
            probe,
            clock,
            alerts: None,
            status: Arc::new(Mutex::new(HealthStatus {
                // Assume healthy until the first probe says otherwise.
                is_healthy: true,
                last_checked_at: None,
                check_interval_ms: config.check_interval_ms,
                last_state: None,
            })),
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
        }
    }

    pub fn with_alerts(mut self, alerts: Arc<AlertSink>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// Cached connectivity check.
    ///
    /// The status lock is held across the probe, so concurrent callers in the
    /// same window wait for one probe and then read the identical cached value.
    /// The probe runs in its own task holding that lock: a caller that gives
    /// up early does not cancel it, and its result still lands in the cache.
    pub async fn is_healthy(&self) -> bool {
        let status = self.status.clone().lock_owned().await;
        let now = self.clock.now();

        if let Some(last) = status.last_checked_at {
            let age_ms = (now - last).num_milliseconds();
            if age_ms <= status.check_interval_ms as i64 {
                return status.is_healthy;
            }
        }

        let refresh = tokio::spawn(refresh(
            status,
            now,
            self.probe.clone(),
            self.probe_timeout,
            self.alerts.clone(),
        ));
        match refresh.await {
            Ok(healthy) => healthy,
            Err(e) => {
                tracing::error!(error = %e, "Health refresh task failed");
                false
            }
        }
    }

    /// Last cached status without probing.
    pub async fn status(&self) -> HealthStatus {
        self.status.lock().await.clone()
    }
}

async fn refresh(
    mut status: OwnedMutexGuard<HealthStatus>,
    now: DateTime<Utc>,
    probe: Arc<dyn PrimaryProbe>,
    timeout: Duration,
    alerts: Option<Arc<AlertSink>>,
) -> bool {
    let state = probe_state(probe.as_ref(), timeout).await;
    let healthy = state == ConnectionState::Connected;
    let previous = status.last_checked_at.map(|_| status.is_healthy);

    status.is_healthy = healthy;
    status.last_checked_at = Some(now);
    status.last_state = Some(state);
    drop(status);

    report_transition(alerts.as_deref(), previous, healthy, state);
    healthy
}

async fn probe_state(probe: &dyn PrimaryProbe, timeout: Duration) -> ConnectionState {
    match tokio::time::timeout(timeout, probe.connection_state()).await {
        Ok(Ok(state)) => state,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Primary store probe failed");
            ConnectionState::Error
        }
        Err(_) => {
            tracing::warn!(
                timeout_ms = timeout.as_millis() as u64,
                "Primary store probe timed out"
            );
            ConnectionState::Error
        }
    }
}

fn report_transition(
    alerts: Option<&AlertSink>,
    previous: Option<bool>,
    healthy: bool,
    state: ConnectionState,
) {
    // The first probe only reports if it finds the store down.
    let entered = !healthy && previous != Some(false);
    let exited = healthy && previous == Some(false);

    if entered {
        tracing::warn!(state = state.as_str(), "Primary store unavailable, entering safe mode");
    } else if exited {
        tracing::info!("Primary store reachable again, leaving safe mode");
    }

    let Some(alerts) = alerts else { return };
    let payload = json!({ "primaryState": state.as_str() });
    if entered {
        alerts.record(AlertType::SafeModeEntered, Severity::Critical, payload);
    } else if exited {
        alerts.record(AlertType::SafeModeExited, Severity::Info, payload);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Probe whose answer can be flipped by the test.
    pub(crate) struct ScriptedProbe {
        pub state: SyncMutex<Result<ConnectionState, String>>,
        pub calls: AtomicUsize,
    }

    impl ScriptedProbe {
        pub(crate) fn new(state: ConnectionState) -> Self {
            Self {
                state: SyncMutex::new(Ok(state)),
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn set(&self, state: ConnectionState) {
            *self.state.lock() = Ok(state);
        }

        pub(crate) fn fail(&self, message: &str) {
            *self.state.lock() = Err(message.to_string());
        }
    }

    #[async_trait]
    impl PrimaryProbe for ScriptedProbe {
        async fn connection_state(&self) -> Result<ConnectionState, CoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.state.lock().clone().map_err(CoreError::Probe)
        }
    }

    struct HangingProbe;

    #[async_trait]
    impl PrimaryProbe for HangingProbe {
        async fn connection_state(&self) -> Result<ConnectionState, CoreError> {
            std::future::pending::<()>().await;
            Ok(ConnectionState::Connected)
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_cached_within_interval() {
        let probe = Arc::new(ScriptedProbe::new(ConnectionState::Connected));
        let clock = Arc::new(ManualClock::new(start()));
        let monitor = HealthMonitor::new(probe.clone(), clock.clone(), &HealthConfig::default());

        assert!(monitor.is_healthy().await);
        probe.set(ConnectionState::Disconnected);

        clock.advance(chrono::Duration::milliseconds(5_000));
        assert!(monitor.is_healthy().await, "exactly at the interval the cache still holds");
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);

        clock.advance(chrono::Duration::milliseconds(1));
        assert!(!monitor.is_healthy().await);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_readers_see_same_value() {
        let probe = Arc::new(ScriptedProbe::new(ConnectionState::Connected));
        let clock = Arc::new(ManualClock::new(start()));
        let monitor = Arc::new(HealthMonitor::new(probe.clone(), clock, &HealthConfig::default()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let monitor = monitor.clone();
            handles.push(tokio::spawn(async move { monitor.is_healthy().await }));
        }
        probe.set(ConnectionState::Disconnected);
        let first = monitor.is_healthy().await;
        for h in handles {
            assert_eq!(h.await.unwrap(), first);
        }
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_probe_error_is_unhealthy_and_alerts() {
        let probe = Arc::new(ScriptedProbe::new(ConnectionState::Connected));
        let clock = Arc::new(ManualClock::new(start()));
        let alerts = Arc::new(AlertSink::new(10, clock.clone()));
        let monitor = HealthMonitor::new(probe.clone(), clock.clone(), &HealthConfig::default())
            .with_alerts(alerts.clone());

        assert!(monitor.is_healthy().await);
        assert!(alerts.is_empty());

        probe.fail("connection reset");
        clock.advance(chrono::Duration::seconds(6));
        assert!(!monitor.is_healthy().await);

        probe.set(ConnectionState::Connected);
        clock.advance(chrono::Duration::seconds(6));
        assert!(monitor.is_healthy().await);

        let history = alerts.history(10);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].alert_type, AlertType::SafeModeExited);
        assert_eq!(history[1].alert_type, AlertType::SafeModeEntered);
    }

    #[tokio::test]
    async fn test_hanging_probe_times_out() {
        let clock = Arc::new(ManualClock::new(start()));
        let config = HealthConfig {
            check_interval_ms: 5_000,
            probe_timeout_ms: 20,
        };
        let monitor = HealthMonitor::new(Arc::new(HangingProbe), clock, &config);
        assert!(!monitor.is_healthy().await);
        assert_eq!(monitor.status().await.last_state, Some(ConnectionState::Error));
    }

    #[tokio::test]
    async fn test_abandoned_check_still_records_result() {
        let clock = Arc::new(ManualClock::new(start()));
        let alerts = Arc::new(AlertSink::new(10, clock.clone()));
        let config = HealthConfig {
            check_interval_ms: 5_000,
            probe_timeout_ms: 50,
        };
        let monitor =
            HealthMonitor::new(Arc::new(HangingProbe), clock, &config).with_alerts(alerts.clone());

        // The caller gives up long before the probe times out.
        let abandoned = tokio::time::timeout(Duration::from_millis(5), monitor.is_healthy()).await;
        assert!(abandoned.is_err());

        // Waits for the detached refresh to release the lock.
        let status = monitor.status().await;
        assert!(!status.is_healthy);
        assert!(status.last_checked_at.is_some());
        assert_eq!(status.last_state, Some(ConnectionState::Error));
        assert_eq!(alerts.history(1)[0].alert_type, AlertType::SafeModeEntered);

        // Cached now, so the next caller answers without waiting on the probe.
        assert!(!monitor.is_healthy().await);
    }

    #[tokio::test]
    async fn test_only_connected_counts_healthy() {
        let states = [
            ConnectionState::Connecting,
            ConnectionState::Disconnected,
            ConnectionState::Error,
        ];
        for state in states {
            let probe = Arc::new(ScriptedProbe::new(state));
            let clock = Arc::new(ManualClock::new(start()));
            let monitor = HealthMonitor::new(probe, clock, &HealthConfig::default());
            assert!(!monitor.is_healthy().await, "{:?} must not count as healthy", state);
        }
    }
}
