//! Calendar arithmetic for the three tick kinds, all on UTC boundaries.

use chrono::{DateTime, Duration, NaiveTime, Timelike, Utc};
use serde::Serialize;

const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TickKind {
    Full,
    Incremental,
    StorageCheck,
}

impl TickKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TickKind::Full => "full",
            TickKind::Incremental => "incremental",
            TickKind::StorageCheck => "storage_check",
        }
    }
}

/// First fire time strictly after `after`.
///
/// Full fires daily at 00:00. Incremental fires every `interval_hours`
/// counted from midnight, restarting at midnight when the interval does not
/// divide the day. Storage checks fire on the hour.
pub fn next_fire(kind: TickKind, after: DateTime<Utc>, interval_hours: u32) -> DateTime<Utc> {
    let midnight = after.date_naive().and_time(NaiveTime::MIN).and_utc();
    // Whole seconds; a fractional remainder still lands before the next boundary.
    let elapsed = i64::from(after.num_seconds_from_midnight());

    let step = match kind {
        TickKind::Full => SECONDS_PER_DAY,
        TickKind::Incremental => i64::from(interval_hours.clamp(1, 24)) * 3_600,
        TickKind::StorageCheck => 3_600,
    };

    let next = (elapsed / step + 1) * step;
    midnight + Duration::seconds(next.min(SECONDS_PER_DAY))
}
