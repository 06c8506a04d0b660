#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current Unix time in milliseconds.
#[inline]
pub fn unix_ms_now() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or(Duration::from_secs(0))
		.as_millis() as i64
}

/// Convert a `SystemTime` to Unix seconds (clamped at the epoch).
#[inline]
pub fn to_unix_secs(t: SystemTime) -> i64 {
	t.duration_since(UNIX_EPOCH).unwrap_or(Duration::from_secs(0)).as_secs() as i64
}

/// Convert a `SystemTime` to Unix milliseconds (clamped at the epoch).
#[inline]
pub fn to_unix_ms(t: SystemTime) -> i64 {
	t.duration_since(UNIX_EPOCH).unwrap_or(Duration::from_secs(0)).as_millis() as i64
}

/// Convert Unix seconds back to a `SystemTime`.
#[inline]
pub fn from_unix_secs(secs: i64) -> SystemTime {
	UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64)
}
