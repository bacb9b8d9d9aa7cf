//! Per-session monotonic millisecond clock.

use dashmap::DashMap;

/// Issues strictly increasing millisecond timestamps per key.
///
/// Wall-clock time is used when it is ahead of the last issued value;
/// otherwise the clock steps by one millisecond. Two events appended to the
/// same session therefore never share a timestamp, which is what makes the
/// timestamp usable as a replay cursor.
#[derive(Debug, Default)]
pub struct SessionClock {
    last: DashMap<String, i64>,
}

impl SessionClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next timestamp for `key`, strictly greater than any previous one.
    pub fn next(&self, key: &str) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        let mut entry = self.last.entry(key.to_string()).or_insert(0);
        let next = now.max(*entry + 1);
        *entry = next;
        next
    }

    /// Fast-forward the clock past an externally observed timestamp (e.g. the
    /// max persisted timestamp at startup).
    pub fn observe(&self, key: &str, timestamp: i64) {
        let mut entry = self.last.entry(key.to_string()).or_insert(0);
        if timestamp > *entry {
            *entry = timestamp;
        }
    }
}
