//! In-process archive keyed by sha256 digest.
//!
//! Used for local development and tests. Fault switches let drills simulate
//! failed uploads, unpins and listings.

use super::{content_digest, Archive, ArchiveError, PinFilter, PinMetadata, PinnedEntry, PutResult};
use crate::clock::Clock;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

struct StoredPin {
    bytes: Bytes,
    entry: PinnedEntry,
}

pub struct MemoryArchive {
    pins: Mutex<BTreeMap<String, StoredPin>>,
    clock: Arc<dyn Clock>,
    fail_uploads: AtomicBool,
    fail_unpins: AtomicBool,
    fail_lists: AtomicBool,
    uploads: AtomicUsize,
}

impl MemoryArchive {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            pins: Mutex::new(BTreeMap::new()),
            clock,
            fail_uploads: AtomicBool::new(false),
            fail_unpins: AtomicBool::new(false),
            fail_lists: AtomicBool::new(false),
            uploads: AtomicUsize::new(0),
        }
    }

    pub fn set_fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_unpins(&self, fail: bool) {
        self.fail_unpins.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_lists(&self, fail: bool) {
        self.fail_lists.store(fail, Ordering::SeqCst);
    }

    /// Successful puts since creation.
    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn pin_count(&self) -> usize {
        self.pins.lock().len()
    }

    fn store(
        &self,
        bytes: Bytes,
        name: &str,
        metadata: PinMetadata,
    ) -> Result<PutResult, ArchiveError> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(ArchiveError::Upload(format!("simulated upload failure for {}", name)));
        }

        let content_id = content_digest(&bytes);
        let size_bytes = bytes.len() as u64;
        let mut pins = self.pins.lock();
        // Re-pinning identical content keeps the original pin, as the hosted API does.
        pins.entry(content_id.clone()).or_insert_with(|| StoredPin {
            bytes,
            entry: PinnedEntry {
                content_id: content_id.clone(),
                name: name.to_string(),
                size_bytes,
                pinned_at: self.clock.now(),
                metadata,
            },
        });
        drop(pins);

        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(PutResult { content_id, size_bytes })
    }
}

#[async_trait]
impl Archive for MemoryArchive {
    async fn put(
        &self,
        bytes: Bytes,
        name: &str,
        metadata: PinMetadata,
    ) -> Result<PutResult, ArchiveError> {
        self.store(bytes, name, metadata)
    }

    async fn put_json(
        &self,
        value: &serde_json::Value,
        name: &str,
        metadata: PinMetadata,
    ) -> Result<PutResult, ArchiveError> {
        let bytes = serde_json::to_vec(value)?;
        self.store(Bytes::from(bytes), name, metadata)
    }

    async fn get(&self, content_id: &str) -> Result<Bytes, ArchiveError> {
        let bytes = self
            .pins
            .lock()
            .get(content_id)
            .map(|p| p.bytes.clone())
            .ok_or_else(|| ArchiveError::NotFound(content_id.to_string()))?;
        if content_digest(&bytes) != content_id {
            return Err(ArchiveError::Integrity(content_id.to_string()));
        }
        Ok(bytes)
    }

    async fn unpin(&self, content_id: &str) -> Result<bool, ArchiveError> {
        if self.fail_unpins.load(Ordering::SeqCst) {
            return Err(ArchiveError::Unpin(format!("simulated unpin failure for {}", content_id)));
        }
        Ok(self.pins.lock().remove(content_id).is_some())
    }

    async fn list(&self, filter: &PinFilter) -> Result<Vec<PinnedEntry>, ArchiveError> {
        if self.fail_lists.load(Ordering::SeqCst) {
            return Err(ArchiveError::Timeout("pins".to_string()));
        }
        Ok(self
            .pins
            .lock()
            .values()
            .filter(|p| filter.matches(&p.entry.metadata))
            .map(|p| p.entry.clone())
            .collect())
    }

    async fn test_connection(&self) -> bool {
        true
    }
}
