//! Alert sink: bounded, queryable history of lifecycle and threshold events.
//!
//! History is diagnostic only. The oldest event is evicted once the ring is
//! full. Delivery to operators is delegated to [`Notifier`]s invoked on every
//! `record`; a failing notifier never affects the caller.

use crate::clock::Clock;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    BackupStarted,
    BackupSucceeded,
    BackupFailed,
    BackupSkipped,
    FallbackTriggered,
    FallbackFailed,
    RetentionFailed,
    StorageWarning,
    StorageCritical,
    SchedulerStarted,
    SchedulerStopped,
    SafeModeEntered,
    SafeModeExited,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::BackupStarted => "backup_started",
            AlertType::BackupSucceeded => "backup_succeeded",
            AlertType::BackupFailed => "backup_failed",
            AlertType::BackupSkipped => "backup_skipped",
            AlertType::FallbackTriggered => "fallback_triggered",
            AlertType::FallbackFailed => "fallback_failed",
            AlertType::RetentionFailed => "retention_failed",
            AlertType::StorageWarning => "storage_warning",
            AlertType::StorageCritical => "storage_critical",
            AlertType::SchedulerStarted => "scheduler_started",
            AlertType::SchedulerStopped => "scheduler_stopped",
            AlertType::SafeModeEntered => "safe_mode_entered",
            AlertType::SafeModeExited => "safe_mode_exited",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub severity: Severity,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertStats {
    pub total: usize,
    pub counts_by_type: BTreeMap<String, usize>,
    pub counts_by_severity: BTreeMap<String, usize>,
}

/// External delivery channel for recorded alerts.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &AlertEvent);
}

/// Writes every alert to the tracing log at a level matching its severity.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &AlertEvent) {
        match event.severity {
            Severity::Info => tracing::info!(
                alert = event.alert_type.as_str(),
                payload = %event.payload,
                "Alert"
            ),
            Severity::Warning => tracing::warn!(
                alert = event.alert_type.as_str(),
                payload = %event.payload,
                "Alert"
            ),
            Severity::Critical => tracing::error!(
                alert = event.alert_type.as_str(),
                payload = %event.payload,
                "Alert"
            ),
        }
    }
}

/// POSTs each alert as JSON to a webhook. Delivery is fire-and-forget.
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            url: url.into(),
            client,
        }
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, event: &AlertEvent) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(alert = event.alert_type.as_str(), "No runtime for webhook delivery");
            return;
        };
        let client = self.client.clone();
        let url = self.url.clone();
        let event = event.clone();
        handle.spawn(async move {
            match client.post(&url).json(&event).send().await {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => tracing::warn!(status = %resp.status(), "Alert webhook rejected event"),
                Err(e) => tracing::warn!(error = %e, "Alert webhook delivery failed"),
            }
        });
    }
}

pub struct AlertSink {
    events: Mutex<VecDeque<AlertEvent>>,
    capacity: usize,
    notifiers: Vec<Arc<dyn Notifier>>,
    clock: Arc<dyn Clock>,
}

impl AlertSink {
    pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            notifiers: Vec::new(),
            clock,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    pub fn record(&self, alert_type: AlertType, severity: Severity, payload: Value) -> AlertEvent {
        let event = AlertEvent {
            id: Uuid::new_v4(),
            alert_type,
            severity,
            payload,
            timestamp: self.clock.now(),
        };

        {
            let mut events = self.events.lock();
            events.push_back(event.clone());
            while events.len() > self.capacity {
                events.pop_front();
            }
        }

        for notifier in &self.notifiers {
            notifier.notify(&event);
        }

        event
    }

    /// Most recent first.
    pub fn history(&self, limit: usize) -> Vec<AlertEvent> {
        self.events.lock().iter().rev().take(limit).cloned().collect()
    }

    pub fn critical_history(&self, limit: usize) -> Vec<AlertEvent> {
        self.events
            .lock()
            .iter()
            .rev()
            .filter(|e| e.severity == Severity::Critical)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> AlertStats {
        let events = self.events.lock();
        let mut stats = AlertStats {
            total: events.len(),
            ..Default::default()
        };
        for e in events.iter() {
            *stats.counts_by_type.entry(e.alert_type.as_str().to_string()).or_default() += 1;
            *stats.counts_by_severity.entry(e.severity.as_str().to_string()).or_default() += 1;
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}
