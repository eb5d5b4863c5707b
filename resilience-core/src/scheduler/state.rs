use super::schedule::TickKind;
use super::storage::StorageStats;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Scheduler bookkeeping. In-memory only; the archive is the durable record.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerState {
    pub is_running: bool,
    pub last_full_backup: Option<DateTime<Utc>>,
    pub last_incremental_backup: Option<DateTime<Utc>>,
    pub next_full_backup: Option<DateTime<Utc>>,
    pub next_incremental_backup: Option<DateTime<Utc>>,
    pub next_storage_check: Option<DateTime<Utc>>,
    pub backups_completed: u64,
    pub backups_failed: u64,
    pub last_error: Option<String>,
    pub last_storage: Option<StorageStats>,
    /// Filled in when a snapshot is taken.
    pub in_flight: Vec<TickKind>,
}

impl SchedulerState {
    pub(crate) fn set_next(&mut self, kind: TickKind, at: Option<DateTime<Utc>>) {
        match kind {
            TickKind::Full => self.next_full_backup = at,
            TickKind::Incremental => self.next_incremental_backup = at,
            TickKind::StorageCheck => self.next_storage_check = at,
        }
    }

    pub(crate) fn clear_next(&mut self) {
        self.next_full_backup = None;
        self.next_incremental_backup = None;
        self.next_storage_check = None;
    }
}
