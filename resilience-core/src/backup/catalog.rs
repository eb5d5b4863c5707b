//! Backup catalog rebuilt from archive metadata.
//!
//! Nothing about existing backups is kept in process memory: the archive's
//! pin metadata is the source of truth, so a restart sees the same catalog.

use super::manifest::{BackupKind, BackupManifest};
use crate::archive::{Archive, ArchiveError, PinFilter, PinMetadata, PinnedEntry};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

pub const APP_KEY: &str = "app";
pub const APP_TAG: &str = "resilience-backup";
pub const ROLE_KEY: &str = "role";
pub const ROLE_PAYLOAD: &str = "payload";
pub const ROLE_MANIFEST: &str = "manifest";
pub const KIND_KEY: &str = "kind";
pub const BACKUP_ID_KEY: &str = "backupId";
pub const CREATED_AT_KEY: &str = "createdAt";
pub const PARENT_KEY: &str = "parentBackupId";
pub const PAYLOAD_ID_KEY: &str = "payloadContentId";

/// Metadata common to both pins of one backup.
pub fn pin_metadata(
    role: &str,
    kind: BackupKind,
    backup_id: &str,
    created_at: DateTime<Utc>,
    parent_backup_id: Option<&str>,
) -> PinMetadata {
    let mut metadata = PinMetadata::new();
    metadata.insert(APP_KEY.into(), APP_TAG.into());
    metadata.insert(ROLE_KEY.into(), role.into());
    metadata.insert(KIND_KEY.into(), kind.as_str().into());
    metadata.insert(BACKUP_ID_KEY.into(), backup_id.into());
    metadata.insert(CREATED_AT_KEY.into(), created_at.to_rfc3339());
    if let Some(parent) = parent_backup_id {
        metadata.insert(PARENT_KEY.into(), parent.into());
    }
    metadata
}

#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub backup_id: String,
    pub kind: BackupKind,
    pub created_at: DateTime<Utc>,
    pub parent_backup_id: Option<String>,
    pub payload: Option<PinnedEntry>,
    pub manifest: Option<PinnedEntry>,
}

impl CatalogEntry {
    /// The manifest is pinned last, so its presence marks a finished backup.
    pub fn is_complete(&self) -> bool {
        self.payload.is_some() && self.manifest.is_some()
    }

    pub fn content_ids(&self) -> Vec<String> {
        self.payload
            .iter()
            .chain(self.manifest.iter())
            .map(|p| p.content_id.clone())
            .collect()
    }

    pub fn size_bytes(&self) -> u64 {
        self.payload.iter().chain(self.manifest.iter()).map(|p| p.size_bytes).sum()
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackupCatalog {
    /// Oldest first.
    pub entries: Vec<CatalogEntry>,
}

impl BackupCatalog {
    pub async fn load(archive: &dyn Archive) -> Result<Self, ArchiveError> {
        let pins = archive.list(&PinFilter::new().with(APP_KEY, APP_TAG)).await?;
        Ok(Self::from_pins(pins))
    }

    pub fn from_pins(pins: Vec<PinnedEntry>) -> Self {
        let mut grouped: BTreeMap<String, CatalogEntry> = BTreeMap::new();

        for pin in pins {
            let md = &pin.metadata;
            let (Some(backup_id), Some(kind), Some(created_at)) = (
                md.get(BACKUP_ID_KEY).cloned(),
                md.get(KIND_KEY).and_then(|k| BackupKind::parse(k)),
                md.get(CREATED_AT_KEY)
                    .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
                    .map(|c| c.with_timezone(&Utc)),
            ) else {
                tracing::debug!(content_id = %pin.content_id, "Ignoring pin without backup metadata");
                continue;
            };

            let parent_backup_id = md.get(PARENT_KEY).cloned();
            let role = md.get(ROLE_KEY).cloned();

            let entry = grouped.entry(backup_id.clone()).or_insert_with(|| CatalogEntry {
                backup_id,
                kind,
                created_at,
                parent_backup_id,
                payload: None,
                manifest: None,
            });
            match role.as_deref() {
                Some(ROLE_PAYLOAD) => entry.payload = Some(pin),
                Some(ROLE_MANIFEST) => entry.manifest = Some(pin),
                _ => {}
            }
        }

        let mut entries: Vec<CatalogEntry> = grouped.into_values().collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.backup_id.cmp(&b.backup_id)));
        Self { entries }
    }

    pub fn complete(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.iter().filter(|e| e.is_complete())
    }

    pub fn latest_full(&self) -> Option<&CatalogEntry> {
        self.complete().filter(|e| e.kind == BackupKind::Full).last()
    }

    pub fn latest_complete(&self) -> Option<&CatalogEntry> {
        self.complete().last()
    }

    /// Latest full plus its incrementals, oldest first.
    pub fn restore_chain(&self) -> Option<(&CatalogEntry, Vec<&CatalogEntry>)> {
        let full = self.latest_full()?;
        let incrementals = self
            .complete()
            .filter(|e| e.kind == BackupKind::Incremental)
            .filter(|e| e.parent_backup_id.as_deref() == Some(full.backup_id.as_str()))
            .collect();
        Some((full, incrementals))
    }
}

pub async fn fetch_manifest(archive: &dyn Archive, entry: &CatalogEntry) -> Result<BackupManifest, ArchiveError> {
    let pin = entry
        .manifest
        .as_ref()
        .ok_or_else(|| ArchiveError::NotFound(format!("manifest for {}", entry.backup_id)))?;
    let bytes = archive.get(&pin.content_id).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn pin(role: &str, kind: BackupKind, id: &str, hour: u32, parent: Option<&str>) -> PinnedEntry {
        let created_at = Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap();
        PinnedEntry {
            content_id: format!("{}-{}", id, role),
            name: String::new(),
            size_bytes: 100,
            pinned_at: created_at,
            metadata: pin_metadata(role, kind, id, created_at, parent),
        }
    }

    #[test]
    fn test_groups_and_orders_entries() {
        let catalog = BackupCatalog::from_pins(vec![
            pin(ROLE_MANIFEST, BackupKind::Incremental, "i1", 6, Some("f1")),
            pin(ROLE_PAYLOAD, BackupKind::Full, "f1", 0, None),
            pin(ROLE_MANIFEST, BackupKind::Full, "f1", 0, None),
            pin(ROLE_PAYLOAD, BackupKind::Incremental, "i1", 6, Some("f1")),
            pin(ROLE_PAYLOAD, BackupKind::Incremental, "i2", 12, Some("f1")),
        ]);

        assert_eq!(catalog.entries.len(), 3);
        assert_eq!(catalog.entries[0].backup_id, "f1");
        assert!(!catalog.entries[2].is_complete(), "i2 has no manifest");
        assert_eq!(catalog.latest_complete().unwrap().backup_id, "i1");

        let (full, incrementals) = catalog.restore_chain().unwrap();
        assert_eq!(full.backup_id, "f1");
        assert_eq!(incrementals.len(), 1);
        assert_eq!(full.content_ids(), vec!["f1-payload".to_string(), "f1-manifest".to_string()]);
    }

    #[test]
    fn test_ignores_foreign_pins() {
        let mut foreign = pin(ROLE_PAYLOAD, BackupKind::Full, "x", 0, None);
        foreign.metadata.remove(CREATED_AT_KEY);
        let catalog = BackupCatalog::from_pins(vec![foreign]);
        assert!(catalog.entries.is_empty());
        assert!(catalog.restore_chain().is_none());
    }
}
