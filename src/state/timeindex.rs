//! Sortable byte keys for timestamps.
//!
//! Keys are eight big-endian bytes of a signed value with the sign bit flipped, so byte order
//! equals numeric order. Descending keys encode `i64::MAX - nanos`: a plain ascending scan over
//! them walks from newest to oldest, and the mapping is identical on every index rebuild so ties
//! always break the same way (by the id that follows the key).

use chrono::{DateTime, Utc};

pub type TimeKey = [u8; 8];

/// Key that sorts earlier times first.
pub fn ascending(ts: DateTime<Utc>) -> TimeKey {
    encode(nanos(ts))
}

/// Key that sorts later times first.
pub fn descending(ts: DateTime<Utc>) -> TimeKey {
    encode(i64::MAX.saturating_sub(nanos(ts)))
}

/// Descending key for an optional time; a missing time is indexed as the unix epoch.
pub fn descending_opt(ts: Option<DateTime<Utc>>) -> TimeKey {
    encode(i64::MAX.saturating_sub(ts.map(nanos).unwrap_or(0)))
}

fn nanos(ts: DateTime<Utc>) -> i64 {
    // Out of range only after the year 2262.
    ts.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

fn encode(value: i64) -> TimeKey {
    ((value as u64) ^ (1 << 63)).to_be_bytes()
}
