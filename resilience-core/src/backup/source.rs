//! Backup-scoped state read from the primary store.

use super::manifest::BackupKind;
use crate::clock::Clock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Documents grouped by collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub collections: BTreeMap<String, Vec<Value>>,
}

impl Snapshot {
    pub fn document_count(&self) -> u64 {
        self.collections.values().map(|docs| docs.len() as u64).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.document_count() == 0
    }
}

#[async_trait]
pub trait BackupSource: Send + Sync {
    /// Every backup-scoped document.
    async fn full_snapshot(&self) -> anyhow::Result<Snapshot>;

    /// Documents created or modified after `since`.
    async fn changes_since(&self, since: DateTime<Utc>) -> anyhow::Result<Snapshot>;
}

/// In-process source for development and tests. Each document records the
/// clock time of its last upsert.
pub struct MemorySource {
    clock: Arc<dyn Clock>,
    docs: Mutex<BTreeMap<String, Vec<(Value, DateTime<Utc>)>>>,
    id_field: String,
}

impl MemorySource {
    pub fn new(clock: Arc<dyn Clock>, id_field: impl Into<String>) -> Self {
        Self {
            clock,
            docs: Mutex::new(BTreeMap::new()),
            id_field: id_field.into(),
        }
    }

    /// Insert or replace by the identifier field.
    pub fn upsert(&self, collection: &str, doc: Value) {
        let now = self.clock.now();
        let mut docs = self.docs.lock();
        let entries = docs.entry(collection.to_string()).or_default();
        let id = doc.get(&self.id_field).cloned();
        match entries.iter_mut().find(|(d, _)| id.is_some() && d.get(&self.id_field) == id.as_ref()) {
            Some(slot) => *slot = (doc, now),
            None => entries.push((doc, now)),
        }
    }

    fn collect(&self, since: Option<DateTime<Utc>>) -> Snapshot {
        let docs = self.docs.lock();
        let mut snapshot = Snapshot::default();
        for (collection, entries) in docs.iter() {
            let selected: Vec<Value> = entries
                .iter()
                .filter(|(_, at)| since.map_or(true, |s| *at > s))
                .map(|(d, _)| d.clone())
                .collect();
            if !selected.is_empty() {
                snapshot.collections.insert(collection.clone(), selected);
            }
        }
        snapshot
    }
}

#[async_trait]
impl BackupSource for MemorySource {
    async fn full_snapshot(&self) -> anyhow::Result<Snapshot> {
        Ok(self.collect(None))
    }

    async fn changes_since(&self, since: DateTime<Utc>) -> anyhow::Result<Snapshot> {
        Ok(self.collect(Some(since)))
    }
}

pub const PAYLOAD_FORMAT_VERSION: u32 = 1;

/// Serialized payload. Identity fields make every payload unique, so two
/// backups of identical data never share a content id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEnvelope {
    #[serde(default = "default_format_version")]
    pub format_version: u32,
    #[serde(default)]
    pub backup_id: String,
    #[serde(default = "default_kind")]
    pub kind: BackupKind,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parent_backup_id: Option<String>,
    #[serde(default)]
    pub collections: BTreeMap<String, Vec<Value>>,
}

fn default_format_version() -> u32 {
    PAYLOAD_FORMAT_VERSION
}

fn default_kind() -> BackupKind {
    BackupKind::Full
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_document_count() {
        let mut snapshot = Snapshot::default();
        assert!(snapshot.is_empty());
        snapshot.collections.insert("products".into(), vec![json!({}), json!({})]);
        snapshot.collections.insert("users".into(), vec![json!({})]);
        assert_eq!(snapshot.document_count(), 3);
    }

    #[tokio::test]
    async fn test_memory_source_changes_since() {
        use crate::clock::ManualClock;
        use chrono::TimeZone;

        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        let source = MemorySource::new(clock.clone(), "publicId");
        source.upsert("products", json!({ "publicId": "p1", "price": 10 }));
        let checkpoint = clock.now();

        clock.advance(chrono::Duration::minutes(5));
        source.upsert("products", json!({ "publicId": "p1", "price": 12 }));
        source.upsert("products", json!({ "publicId": "p2", "price": 3 }));

        assert_eq!(source.full_snapshot().await.unwrap().document_count(), 2);
        let delta = source.changes_since(checkpoint).await.unwrap();
        assert_eq!(delta.document_count(), 2);
        assert_eq!(delta.collections["products"][0]["price"], 12);
        assert!(source.changes_since(clock.now()).await.unwrap().is_empty());
    }

    #[test]
    fn test_legacy_envelope_defaults() {
        let envelope: SnapshotEnvelope = serde_json::from_str(r#"{"collections":{"products":[{"publicId":"p1"}]}}"#).unwrap();
        assert_eq!(envelope.format_version, PAYLOAD_FORMAT_VERSION);
        assert_eq!(envelope.kind, BackupKind::Full);
        assert!(envelope.created_at.is_none());
        assert_eq!(envelope.collections["products"].len(), 1);
    }
}
