//! Timestamp helpers. Spec §6.4: every `created_at`-style column is stored
//! twice — ISO-8601 text for human readability, monotonic nanoseconds in a
//! parallel column for timing math (backoff, rate-limiter refill).

use chrono::{DateTime, Utc};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as nanoseconds since the Unix epoch.
///
/// Not strictly monotonic across a clock step, but monotonic enough for a
/// single-process driver: every timestamp in this crate is produced on the
/// same host clock and only ever compared to other timestamps from it.
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_nanos() as i64
}

/// Current time as an ISO-8601 string, for the human-readable twin column.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

/// Render a nanosecond timestamp as ISO-8601.
pub fn nanos_to_iso(nanos: i64) -> String {
    let secs = nanos.div_euclid(1_000_000_000);
    let nsecs = nanos.rem_euclid(1_000_000_000) as u32;
    DateTime::<Utc>::from_timestamp(secs, nsecs)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}
