mod id;

pub use id::*;

use chrono::Utc;

/// Returns the server's wall clock as milliseconds since the unix epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
