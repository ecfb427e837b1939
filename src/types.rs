//! Clock helpers and the collision-resistant id generator.

use chrono::{Datelike, Local, TimeZone, Timelike};
use parking_lot::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

pub const NS_IN_SECOND: i64 = 1_000_000_000;
pub const NS_IN_MS: i64 = 1_000_000;

/// Current wall-clock time in milliseconds since the UNIX epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Current wall-clock time in nanoseconds since the UNIX epoch.
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

/// Rounds a nanosecond span to whole seconds.
pub fn ns_to_secs(ns: i64) -> i64 {
    (ns as f64 / NS_IN_SECOND as f64).round() as i64
}

pub fn secs_to_ns(secs: i64) -> i64 {
    secs.saturating_mul(NS_IN_SECOND)
}

/// Local hour, day of week (Sunday = 0) and UTC offset in minutes for a
/// millisecond timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalendarStamp {
    pub hour: u32,
    pub dow: u32,
    pub tz_minutes: i32,
}

impl CalendarStamp {
    pub fn at(timestamp_ms: i64) -> Self {
        match Local.timestamp_millis_opt(timestamp_ms).single() {
            Some(local) => CalendarStamp {
                hour: local.hour(),
                dow: local.weekday().num_days_from_sunday(),
                tz_minutes: local.offset().local_minus_utc() / 60,
            },
            None => CalendarStamp {
                hour: 0,
                dow: 0,
                tz_minutes: 0,
            },
        }
    }
}

/// Hands out strictly increasing millisecond timestamps.
///
/// Used for record ids and the `timestamp` request parameter. Two calls never
/// return the same value, including under concurrent use and when the wall
/// clock moves backwards: the generator then keeps counting up from the last
/// value it issued.
#[derive(Debug, Default)]
pub struct TimeGenerator {
    last: Mutex<i64>,
}

impl TimeGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the floor so future ids sort after `id`. Called with the
    /// largest id already on disk when the agent starts.
    pub fn observe(&self, id: i64) {
        let mut last = self.last.lock();
        if id > *last {
            *last = id;
        }
    }

    pub fn next(&self) -> i64 {
        self.next_at(now_ms())
    }

    fn next_at(&self, now: i64) -> i64 {
        let mut last = self.last.lock();
        let id = if now > *last { now } else { *last + 1 };
        *last = id;
        id
    }
}
