//! Archive storage usage against the configured limit.

use crate::archive::{Archive, ArchiveError};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageTier {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub used_bytes: u64,
    pub limit_bytes: u64,
    pub usage_percentage: f64,
    pub last_checked: DateTime<Utc>,
    pub tier: StorageTier,
}

#[derive(Debug, Clone, Copy)]
pub struct StorageThresholds {
    pub warning_percent: f64,
    pub critical_percent: f64,
}

impl Default for StorageThresholds {
    fn default() -> Self {
        Self {
            warning_percent: 80.0,
            critical_percent: 90.0,
        }
    }
}

impl StorageThresholds {
    pub fn classify(&self, usage_percentage: f64) -> StorageTier {
        if usage_percentage >= self.critical_percent {
            StorageTier::Critical
        } else if usage_percentage >= self.warning_percent {
            StorageTier::Warning
        } else {
            StorageTier::Healthy
        }
    }
}

/// Unrounded usage. Tiers are decided on this value.
pub fn usage_percentage(used_bytes: u64, limit_bytes: u64) -> f64 {
    if limit_bytes == 0 {
        return 100.0;
    }
    used_bytes as f64 * 100.0 / limit_bytes as f64
}

/// Two decimals, for reporting only.
fn display_percentage(pct: f64) -> f64 {
    (pct * 100.0).round() / 100.0
}

pub async fn measure(
    archive: &dyn Archive,
    limit_bytes: u64,
    thresholds: StorageThresholds,
    now: DateTime<Utc>,
) -> Result<StorageStats, ArchiveError> {
    let used_bytes = archive.usage_bytes().await?;
    let pct = usage_percentage(used_bytes, limit_bytes);
    Ok(StorageStats {
        used_bytes,
        limit_bytes,
        usage_percentage: display_percentage(pct),
        last_checked: now,
        tier: thresholds.classify(pct),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{MemoryArchive, PinMetadata};
    use crate::clock::ManualClock;
    use bytes::Bytes;
    use std::sync::Arc;

    #[test]
    fn test_tiers() {
        let t = StorageThresholds::default();
        assert_eq!(t.classify(0.0), StorageTier::Healthy);
        assert_eq!(t.classify(79.99), StorageTier::Healthy);
        assert_eq!(t.classify(80.0), StorageTier::Warning);
        assert_eq!(t.classify(89.9), StorageTier::Warning);
        assert_eq!(t.classify(90.0), StorageTier::Critical);
        assert_eq!(t.classify(120.0), StorageTier::Critical);
    }

    #[test]
    fn test_usage_percentage() {
        assert_eq!(usage_percentage(79, 100), 79.0);
        assert_eq!(display_percentage(usage_percentage(1, 3)), 33.33);
        assert_eq!(usage_percentage(5, 0), 100.0);
    }

    #[tokio::test]
    async fn test_tier_uses_unrounded_usage() {
        let now = Utc::now();
        let archive = MemoryArchive::new(Arc::new(ManualClock::new(now)));
        archive
            .put(Bytes::from(vec![0u8; 79_996]), "blob", PinMetadata::new())
            .await
            .unwrap();

        let stats = measure(&archive, 100_000, StorageThresholds::default(), now).await.unwrap();
        assert_eq!(stats.usage_percentage, 80.0);
        assert_eq!(stats.tier, StorageTier::Healthy);
    }
}
