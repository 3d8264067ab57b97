// =============================================================================
// Kill Zones — UTC session windows during which entries are permitted
// =============================================================================
//
// Entry determiners may gate on these windows. Times are minutes-from-
// midnight UTC; a window may wrap midnight (start > end), e.g. 23:00-02:00.
// =============================================================================

use chrono::{TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// A named trading-session window in UTC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillZone {
    pub name: String,
    /// Window start, minutes from UTC midnight (inclusive).
    pub start_minute: u32,
    /// Window end, minutes from UTC midnight (exclusive).
    pub end_minute: u32,
}

impl KillZone {
    pub fn new(name: impl Into<String>, start_minute: u32, end_minute: u32) -> Self {
        Self {
            name: name.into(),
            start_minute,
            end_minute,
        }
    }

    /// True when `timestamp_ms` falls inside this window.
    pub fn contains(&self, timestamp_ms: i64) -> bool {
        let dt = match Utc.timestamp_millis_opt(timestamp_ms).single() {
            Some(dt) => dt,
            None => return false,
        };
        let minute = dt.hour() * 60 + dt.minute();

        if self.start_minute <= self.end_minute {
            minute >= self.start_minute && minute < self.end_minute
        } else {
            // Wraps midnight.
            minute >= self.start_minute || minute < self.end_minute
        }
    }
}

/// The standard session windows: Asia open, London open, New York open.
pub fn default_kill_zones() -> Vec<KillZone> {
    vec![
        KillZone::new("asia", 0, 3 * 60),
        KillZone::new("london", 7 * 60, 10 * 60),
        KillZone::new("new_york", 12 * 60, 15 * 60),
    ]
}

/// True when `timestamp_ms` falls inside any of `zones`. An empty zone list
/// means no gating — always true.
pub fn in_any_kill_zone(zones: &[KillZone], timestamp_ms: i64) -> bool {
    zones.is_empty() || zones.iter().any(|z| z.contains(timestamp_ms))
}
