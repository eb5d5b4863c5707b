//! Backup scheduler.
//!
//! Three independent calendar loops (full at midnight, incremental every few
//! hours, storage hourly) sleep on the injected clock and spawn one task per
//! tick. A per-kind in-flight flag turns an overlapping tick into a logged
//! skip. Manual triggers go through the same run paths.

pub mod schedule;
pub mod state;
pub mod storage;

use crate::alerts::{AlertSink, AlertType, Severity};
use crate::archive::{Archive, ArchiveError};
use crate::backup::manifest::PartialManifest;
use crate::backup::{
    BackupFailure, BackupKind, BackupManifest, IncrementalOutcome, RetentionManager,
    SnapshotBuilder,
};
use crate::clock::Clock;
use crate::config::SchedulerConfig;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use schedule::{next_fire, TickKind};
pub use state::SchedulerState;
pub use storage::{StorageStats, StorageThresholds, StorageTier};

const SCHEDULER_ACTOR: &str = "scheduler";

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum RunOutcome {
    Completed {
        manifest: BackupManifest,
    },
    /// An incremental found no full to parent on and a full ran instead.
    FallbackCompleted {
        manifest: BackupManifest,
    },
    #[serde(rename_all = "camelCase")]
    Skipped {
        message: String,
        parent_backup_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Failed {
        reason: String,
        partial_manifest: Option<PartialManifest>,
        fallback: bool,
    },
    AlreadyRunning {
        kind: TickKind,
    },
}

impl RunOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, RunOutcome::Failed { .. })
    }
}

/// Clears the in-flight flag when the run ends, including on panic.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Inner {
    builder: Arc<SnapshotBuilder>,
    retention: Arc<RetentionManager>,
    archive: Arc<dyn Archive>,
    alerts: Arc<AlertSink>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    storage_limit_bytes: u64,
    state: Mutex<SchedulerState>,
    full_in_flight: AtomicBool,
    incremental_in_flight: AtomicBool,
    storage_in_flight: AtomicBool,
}

struct Running {
    token: CancellationToken,
    loops: Vec<JoinHandle<()>>,
}

pub struct BackupScheduler {
    inner: Arc<Inner>,
    running: Mutex<Option<Running>>,
}

impl BackupScheduler {
    pub fn new(
        builder: Arc<SnapshotBuilder>,
        retention: Arc<RetentionManager>,
        archive: Arc<dyn Archive>,
        alerts: Arc<AlertSink>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
        storage_limit_bytes: u64,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                builder,
                retention,
                archive,
                alerts,
                clock,
                config,
                storage_limit_bytes,
                state: Mutex::new(SchedulerState::default()),
                full_in_flight: AtomicBool::new(false),
                incremental_in_flight: AtomicBool::new(false),
                storage_in_flight: AtomicBool::new(false),
            }),
            running: Mutex::new(None),
        }
    }

    /// Start the tick loops. Returns `false` if already running.
    pub fn start(&self) -> bool {
        let mut running = self.running.lock();
        if running.is_some() {
            tracing::debug!("Scheduler already running");
            return false;
        }

        let token = CancellationToken::new();
        let kinds = self.inner.enabled_kinds();
        {
            let mut state = self.inner.state.lock();
            state.is_running = true;
        }
        self.inner.refresh_next_runs();

        let loops = kinds
            .iter()
            .map(|&kind| spawn_tick_loop(self.inner.clone(), kind, token.clone()))
            .collect();
        *running = Some(Running { token, loops });
        drop(running);

        let enabled: Vec<&str> = kinds.iter().map(|k| k.as_str()).collect();
        tracing::info!(ticks = ?enabled, "Backup scheduler started");
        self.inner
            .alerts
            .record(AlertType::SchedulerStarted, Severity::Info, json!({ "ticks": enabled }));
        true
    }

    /// Stop the tick loops. Runs already in flight finish normally.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return;
        };
        running.token.cancel();
        for handle in running.loops {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Tick loop ended abnormally");
            }
        }

        {
            let mut state = self.inner.state.lock();
            state.is_running = false;
            state.clear_next();
        }
        tracing::info!("Backup scheduler stopped");
        self.inner
            .alerts
            .record(AlertType::SchedulerStopped, Severity::Info, json!({}));
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn state(&self) -> SchedulerState {
        let mut snapshot = self.inner.state.lock().clone();
        snapshot.in_flight = [TickKind::Full, TickKind::Incremental, TickKind::StorageCheck]
            .into_iter()
            .filter(|&k| self.inner.flag(k).load(Ordering::Acquire))
            .collect();
        snapshot
    }

    pub async fn trigger_full_backup_now(&self, actor: &str) -> RunOutcome {
        self.inner.run_full(actor).await
    }

    pub async fn trigger_incremental_backup_now(&self, actor: &str) -> RunOutcome {
        self.inner.run_incremental(actor).await
    }

    /// Measure storage now, recording the result and any threshold alert.
    pub async fn check_storage_now(&self) -> Result<StorageStats, ArchiveError> {
        self.inner.check_storage().await
    }

    /// Last hourly measurement, or a fresh one (without alerting) if none ran yet.
    pub async fn storage_stats(&self) -> Result<StorageStats, ArchiveError> {
        let last = self.inner.state.lock().last_storage.clone();
        if let Some(stats) = last {
            return Ok(stats);
        }
        self.inner.measure_once().await
    }
}

fn spawn_tick_loop(inner: Arc<Inner>, kind: TickKind, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let next = next_fire(kind, inner.clock.now(), inner.config.incremental_interval_hours);
            inner.state.lock().set_next(kind, Some(next));

            tokio::select! {
                _ = token.cancelled() => break,
                _ = inner.clock.sleep_until(next) => {}
            }

            tracing::debug!(tick = kind.as_str(), at = %next, "Tick fired");
            let tick = inner.clone();
            tokio::spawn(async move { tick.fire(kind).await });
        }
    })
}

impl Inner {
    fn enabled_kinds(&self) -> Vec<TickKind> {
        let mut kinds = Vec::with_capacity(3);
        if self.config.full_enabled {
            kinds.push(TickKind::Full);
        }
        if self.config.incremental_enabled {
            kinds.push(TickKind::Incremental);
        }
        if self.config.storage_check_enabled {
            kinds.push(TickKind::StorageCheck);
        }
        kinds
    }

    fn flag(&self, kind: TickKind) -> &AtomicBool {
        match kind {
            TickKind::Full => &self.full_in_flight,
            TickKind::Incremental => &self.incremental_in_flight,
            TickKind::StorageCheck => &self.storage_in_flight,
        }
    }

    fn thresholds(&self) -> StorageThresholds {
        StorageThresholds {
            warning_percent: self.config.storage_warning_percent,
            critical_percent: self.config.storage_critical_percent,
        }
    }

    async fn fire(&self, kind: TickKind) {
        match kind {
            TickKind::Full => {
                self.run_full(SCHEDULER_ACTOR).await;
            }
            TickKind::Incremental => {
                self.run_incremental(SCHEDULER_ACTOR).await;
            }
            TickKind::StorageCheck => {
                let Some(_guard) = InFlight::acquire(self.flag(kind)) else {
                    tracing::warn!("Skipping storage check: previous check still in flight");
                    return;
                };
                if let Err(e) = self.measure_storage().await {
                    tracing::warn!(error = %e, "Storage check failed");
                }
            }
        }
    }

    fn refresh_next_runs(&self) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if !state.is_running {
            return;
        }
        for kind in self.enabled_kinds() {
            state.set_next(kind, Some(next_fire(kind, now, self.config.incremental_interval_hours)));
        }
    }

    fn busy(&self, kind: TickKind, actor: &str) -> RunOutcome {
        tracing::warn!(tick = kind.as_str(), actor, "Skipping backup: previous run still in flight");
        RunOutcome::AlreadyRunning { kind }
    }

    fn announce_start(&self, kind: BackupKind, actor: &str) {
        self.alerts.record(
            AlertType::BackupStarted,
            Severity::Info,
            json!({ "kind": kind.as_str(), "triggeredBy": actor }),
        );
    }

    async fn run_full(&self, actor: &str) -> RunOutcome {
        let Some(_guard) = InFlight::acquire(&self.full_in_flight) else {
            return self.busy(TickKind::Full, actor);
        };
        self.execute_full(actor, false).await
    }

    /// Caller holds the full in-flight flag.
    async fn execute_full(&self, actor: &str, fallback: bool) -> RunOutcome {
        self.announce_start(BackupKind::Full, actor);
        match self.builder.create_full(actor).await {
            Ok(manifest) => {
                self.on_success(&manifest).await;
                if fallback {
                    RunOutcome::FallbackCompleted { manifest }
                } else {
                    RunOutcome::Completed { manifest }
                }
            }
            Err(failure) => self.on_failure(BackupKind::Full, actor, failure, fallback),
        }
    }

    async fn run_incremental(&self, actor: &str) -> RunOutcome {
        let Some(_guard) = InFlight::acquire(&self.incremental_in_flight) else {
            return self.busy(TickKind::Incremental, actor);
        };
        self.announce_start(BackupKind::Incremental, actor);

        match self.builder.create_incremental(actor).await {
            Ok(IncrementalOutcome::Created(manifest)) => {
                self.on_success(&manifest).await;
                RunOutcome::Completed { manifest }
            }
            Ok(IncrementalOutcome::Skipped {
                message,
                parent_backup_id,
            }) => {
                self.alerts.record(
                    AlertType::BackupSkipped,
                    Severity::Info,
                    json!({
                        "kind": "incremental",
                        "message": message,
                        "parentBackupId": parent_backup_id,
                        "triggeredBy": actor,
                    }),
                );
                RunOutcome::Skipped {
                    message,
                    parent_backup_id: Some(parent_backup_id),
                }
            }
            Err(failure) if failure.is_no_prior_backup() => self.fall_back_to_full(actor).await,
            Err(failure) => self.on_failure(BackupKind::Incremental, actor, failure, false),
        }
    }

    async fn fall_back_to_full(&self, actor: &str) -> RunOutcome {
        tracing::warn!(actor, "No full backup to parent an incremental, running a full backup instead");
        self.alerts.record(
            AlertType::FallbackTriggered,
            Severity::Warning,
            json!({ "reason": "no prior full backup", "triggeredBy": actor }),
        );

        let Some(_guard) = InFlight::acquire(&self.full_in_flight) else {
            // The running full provides the parent the next incremental needs.
            tracing::info!("Full backup already in flight, fallback not needed");
            return RunOutcome::Skipped {
                message: "Full backup already in progress".into(),
                parent_backup_id: None,
            };
        };

        let outcome = self.execute_full(actor, true).await;
        if let RunOutcome::Failed { reason, .. } = &outcome {
            self.alerts.record(
                AlertType::FallbackFailed,
                Severity::Critical,
                json!({ "reason": reason, "triggeredBy": actor }),
            );
        }
        outcome
    }

    async fn on_success(&self, manifest: &BackupManifest) {
        {
            let mut state = self.state.lock();
            state.backups_completed += 1;
            match manifest.kind {
                BackupKind::Full => state.last_full_backup = Some(manifest.created_at),
                BackupKind::Incremental => state.last_incremental_backup = Some(manifest.created_at),
            }
        }
        self.alerts
            .record(AlertType::BackupSucceeded, Severity::Info, manifest.alert_payload());

        // Pruning only ever follows a confirmed upload.
        match self.retention.prune().await {
            Ok(report) => {
                if !report.failed_unpins.is_empty() {
                    tracing::warn!(
                        failed = report.failed_unpins.len(),
                        "Some unpins failed, retrying next cycle"
                    );
                }
                tracing::info!(
                    pruned = report.pruned_backups.len(),
                    unpinned = report.unpinned,
                    "Retention applied"
                );
            }
            Err(e) => {
                tracing::warn!(error = %e, "Retention pass failed");
                self.alerts.record(
                    AlertType::RetentionFailed,
                    Severity::Warning,
                    json!({ "backupId": manifest.backup_id, "error": e.to_string() }),
                );
            }
        }

        self.refresh_next_runs();
    }

    fn on_failure(&self, kind: BackupKind, actor: &str, failure: BackupFailure, fallback: bool) -> RunOutcome {
        let reason = failure.error.to_string();
        tracing::error!(kind = kind.as_str(), actor, error = %reason, "Backup failed");
        {
            let mut state = self.state.lock();
            state.backups_failed += 1;
            state.last_error = Some(reason.clone());
        }
        self.alerts.record(
            AlertType::BackupFailed,
            Severity::Critical,
            json!({
                "kind": kind.as_str(),
                "triggeredBy": actor,
                "error": reason,
                "partialManifest": failure.partial,
            }),
        );
        RunOutcome::Failed {
            reason,
            partial_manifest: failure.partial,
            fallback,
        }
    }

    async fn measure_once(&self) -> Result<StorageStats, ArchiveError> {
        let now = self.clock.now();
        storage::measure(self.archive.as_ref(), self.storage_limit_bytes, self.thresholds(), now)
            .await
    }

    async fn check_storage(&self) -> Result<StorageStats, ArchiveError> {
        let Some(_guard) = InFlight::acquire(&self.storage_in_flight) else {
            // A concurrent check is already recording and alerting.
            return self.measure_once().await;
        };
        self.measure_storage().await
    }

    async fn measure_storage(&self) -> Result<StorageStats, ArchiveError> {
        let stats = storage::measure(
            self.archive.as_ref(),
            self.storage_limit_bytes,
            self.thresholds(),
            self.clock.now(),
        )
        .await?;
        self.state.lock().last_storage = Some(stats.clone());

        let payload = json!({
            "usedBytes": stats.used_bytes,
            "limitBytes": stats.limit_bytes,
            "usagePercentage": stats.usage_percentage,
        });
        match stats.tier {
            StorageTier::Healthy => {
                tracing::debug!(usage = stats.usage_percentage, "Storage healthy");
            }
            StorageTier::Warning => {
                self.alerts.record(AlertType::StorageWarning, Severity::Warning, payload);
            }
            StorageTier::Critical => {
                self.alerts.record(AlertType::StorageCritical, Severity::Critical, payload);
            }
        }
        Ok(stats)
    }
}
