//! Wall-clock helpers.
//!
//! Every timestamp that crosses the wire or reaches storage is unix
//! milliseconds as `u64`.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Age of `timestamp` relative to `now`, zero for future timestamps.
pub fn age_ms(timestamp: u64, now: u64) -> u64 {
    now.saturating_sub(timestamp)
}
