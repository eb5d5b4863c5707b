//! Retention: prune obsolete backups after a successful cycle.
//!
//! Only the newest `full_backups_to_keep` fulls survive. Incrementals are
//! pruned once they are strictly older than `incremental_retention_days`;
//! one exactly at the boundary stays. Incrementals whose parent full is not
//! kept go with it. Unpin failures are logged and the entry is retried on the
//! next cycle.

use super::catalog::{BackupCatalog, CatalogEntry};
use super::manifest::BackupKind;
use crate::archive::{Archive, ArchiveError};
use crate::clock::Clock;
use crate::config::RetentionConfig;
use chrono::Duration;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

/// Incomplete backups younger than this may still be uploading.
const ORPHAN_GRACE_MINUTES: i64 = 60;

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    pub full_backups_to_keep: usize,
    pub incremental_retention_days: i64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            full_backups_to_keep: 1,
            incremental_retention_days: 3,
        }
    }
}

impl From<&RetentionConfig> for RetentionPolicy {
    fn from(config: &RetentionConfig) -> Self {
        Self {
            full_backups_to_keep: config.full_backups_to_keep.max(1),
            incremental_retention_days: config.incremental_retention_days,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionReport {
    pub kept_full: Vec<String>,
    pub pruned_backups: Vec<String>,
    pub unpinned: usize,
    pub failed_unpins: Vec<String>,
}

pub struct RetentionManager {
    archive: Arc<dyn Archive>,
    clock: Arc<dyn Clock>,
    policy: RetentionPolicy,
}

impl RetentionManager {
    pub fn new(archive: Arc<dyn Archive>, clock: Arc<dyn Clock>, policy: RetentionPolicy) -> Self {
        Self { archive, clock, policy }
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    /// Call only after a confirmed successful upload.
    pub async fn prune(&self) -> Result<RetentionReport, ArchiveError> {
        let catalog = BackupCatalog::load(self.archive.as_ref()).await?;
        let now = self.clock.now();
        let incremental_cutoff = now - Duration::days(self.policy.incremental_retention_days);
        let orphan_cutoff = now - Duration::minutes(ORPHAN_GRACE_MINUTES);

        let mut fulls: Vec<&CatalogEntry> =
            catalog.complete().filter(|e| e.kind == BackupKind::Full).collect();
        fulls.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let kept: Vec<&CatalogEntry> =
            fulls.iter().take(self.policy.full_backups_to_keep).copied().collect();
        let kept_ids: HashSet<&str> = kept.iter().map(|e| e.backup_id.as_str()).collect();

        let mut doomed: Vec<&CatalogEntry> = Vec::new();
        for entry in &catalog.entries {
            if kept_ids.contains(entry.backup_id.as_str()) {
                continue;
            }
            let prune = if !entry.is_complete() {
                entry.created_at < orphan_cutoff
            } else {
                match entry.kind {
                    BackupKind::Full => true,
                    BackupKind::Incremental => {
                        let orphaned = entry
                            .parent_backup_id
                            .as_deref()
                            .is_some_and(|parent| !kept_ids.contains(parent));
                        orphaned || entry.created_at < incremental_cutoff
                    }
                }
            };
            if prune {
                doomed.push(entry);
            }
        }

        // Content ids still referenced by a surviving backup are never unpinned.
        let protected: HashSet<String> = catalog
            .entries
            .iter()
            .filter(|e| !doomed.iter().any(|d| d.backup_id == e.backup_id))
            .flat_map(|e| e.content_ids())
            .collect();

        let mut report = RetentionReport {
            kept_full: kept.iter().map(|e| e.backup_id.clone()).collect(),
            ..Default::default()
        };

        for entry in doomed {
            let mut all_released = true;
            for content_id in entry.content_ids() {
                if protected.contains(&content_id) {
                    continue;
                }
                match self.archive.unpin(&content_id).await {
                    Ok(_) => report.unpinned += 1,
                    Err(e) => {
                        tracing::warn!(
                            backup_id = %entry.backup_id,
                            content_id = %content_id,
                            error = %e,
                            "Unpin failed, will retry next cycle"
                        );
                        report.failed_unpins.push(content_id);
                        all_released = false;
                    }
                }
            }
            if all_released {
                tracing::info!(
                    backup_id = %entry.backup_id,
                    kind = entry.kind.as_str(),
                    "Pruned backup"
                );
                report.pruned_backups.push(entry.backup_id.clone());
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{MemoryArchive, PinMetadata};
    use crate::backup::catalog::{pin_metadata, ROLE_MANIFEST, ROLE_PAYLOAD};
    use crate::clock::ManualClock;
    use bytes::Bytes;
    use chrono::{DateTime, TimeZone, Utc};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 10, 0, 0, 0).unwrap()
    }

    async fn seed(
        archive: &MemoryArchive,
        kind: BackupKind,
        id: &str,
        created_at: DateTime<Utc>,
        parent: Option<&str>,
        with_manifest: bool,
    ) {
        let payload = pin_metadata(ROLE_PAYLOAD, kind, id, created_at, parent);
        archive
            .put(Bytes::from(format!("payload-{}", id)), id, payload)
            .await
            .unwrap();
        if with_manifest {
            let manifest: PinMetadata = pin_metadata(ROLE_MANIFEST, kind, id, created_at, parent);
            archive
                .put_json(&serde_json::json!({ "backupId": id }), id, manifest)
                .await
                .unwrap();
        }
    }

    fn manager(archive: Arc<MemoryArchive>, clock: Arc<ManualClock>) -> RetentionManager {
        RetentionManager::new(archive, clock, RetentionPolicy::default())
    }

    #[tokio::test]
    async fn test_exactly_one_full_survives() {
        let clock = Arc::new(ManualClock::new(now()));
        let archive = Arc::new(MemoryArchive::new(clock.clone()));
        for day in 1..=4 {
            let created_at = now() - Duration::days(day);
            seed(&archive, BackupKind::Full, &format!("f{}", day), created_at, None, true).await;
        }
        seed(&archive, BackupKind::Full, "f0", now(), None, true).await;

        let report = manager(archive.clone(), clock).prune().await.unwrap();
        assert_eq!(report.kept_full, vec!["f0".to_string()]);
        assert_eq!(report.pruned_backups.len(), 4);

        let catalog = BackupCatalog::load(archive.as_ref()).await.unwrap();
        let fulls: Vec<_> = catalog.complete().filter(|e| e.kind == BackupKind::Full).collect();
        assert_eq!(fulls.len(), 1);
        assert_eq!(fulls[0].backup_id, "f0");
    }

    #[tokio::test]
    async fn test_incremental_age_boundary() {
        let clock = Arc::new(ManualClock::new(now()));
        let archive = Arc::new(MemoryArchive::new(clock.clone()));
        seed(&archive, BackupKind::Full, "f0", now() - Duration::days(5), None, true).await;
        let just_past = now() - Duration::days(3) - Duration::seconds(1);
        seed(&archive, BackupKind::Incremental, "old", just_past, Some("f0"), true).await;
        let edge = now() - Duration::days(3);
        seed(&archive, BackupKind::Incremental, "edge", edge, Some("f0"), true).await;
        let six_hours_ago = now() - Duration::hours(6);
        seed(&archive, BackupKind::Incremental, "new", six_hours_ago, Some("f0"), true).await;

        let report = manager(archive.clone(), clock).prune().await.unwrap();
        assert_eq!(report.pruned_backups, vec!["old".to_string()]);

        let catalog = BackupCatalog::load(archive.as_ref()).await.unwrap();
        let ids: Vec<_> = catalog.entries.iter().map(|e| e.backup_id.as_str()).collect();
        assert_eq!(ids, vec!["f0", "edge", "new"]);
    }

    #[tokio::test]
    async fn test_unpin_failure_is_reported_not_fatal() {
        let clock = Arc::new(ManualClock::new(now()));
        let archive = Arc::new(MemoryArchive::new(clock.clone()));
        seed(&archive, BackupKind::Full, "f1", now() - Duration::days(1), None, true).await;
        seed(&archive, BackupKind::Full, "f0", now(), None, true).await;
        archive.set_fail_unpins(true);

        let report = manager(archive.clone(), clock.clone()).prune().await.unwrap();
        assert!(report.pruned_backups.is_empty());
        assert_eq!(report.failed_unpins.len(), 2);

        archive.set_fail_unpins(false);
        let report = manager(archive.clone(), clock).prune().await.unwrap();
        assert_eq!(report.pruned_backups, vec!["f1".to_string()]);
    }

    #[tokio::test]
    async fn test_recent_orphans_are_left_alone() {
        let clock = Arc::new(ManualClock::new(now()));
        let archive = Arc::new(MemoryArchive::new(clock.clone()));
        seed(&archive, BackupKind::Full, "f0", now(), None, true).await;
        let five_minutes_ago = now() - Duration::minutes(5);
        seed(&archive, BackupKind::Full, "uploading", five_minutes_ago, None, false).await;
        let two_hours_ago = now() - Duration::hours(2);
        seed(&archive, BackupKind::Incremental, "stale", two_hours_ago, Some("f0"), false).await;

        let report = manager(archive.clone(), clock).prune().await.unwrap();
        assert_eq!(report.pruned_backups, vec!["stale".to_string()]);
    }

    #[tokio::test]
    async fn test_incrementals_of_superseded_full_are_pruned() {
        let clock = Arc::new(ManualClock::new(now()));
        let archive = Arc::new(MemoryArchive::new(clock.clone()));
        let yesterday = now() - Duration::days(1);
        seed(&archive, BackupKind::Full, "f1", yesterday, None, true).await;
        let inc_old = yesterday + Duration::hours(6);
        seed(&archive, BackupKind::Incremental, "i1", inc_old, Some("f1"), true).await;
        seed(&archive, BackupKind::Full, "f0", now(), None, true).await;
        let inc_new = now() + Duration::hours(6);
        seed(&archive, BackupKind::Incremental, "i0", inc_new, Some("f0"), true).await;

        let mut report = manager(archive.clone(), clock).prune().await.unwrap();
        report.pruned_backups.sort();
        assert_eq!(report.pruned_backups, vec!["f1".to_string(), "i1".to_string()]);

        let catalog = BackupCatalog::load(archive.as_ref()).await.unwrap();
        let ids: Vec<_> = catalog.entries.iter().map(|e| e.backup_id.as_str()).collect();
        assert_eq!(ids, vec!["f0", "i0"]);
    }
}
