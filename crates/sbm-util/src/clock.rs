//! Wall-clock timestamps for persistence and security metrics.
//!
//! The store keeps TEXT columns in local ISO time without sub-second
//! precision; the security policy parses them back for inactivity checks.

use chrono::{Local, NaiveDateTime, Timelike};

/// Local ISO timestamp without sub-second digits, e.g. `"2026-02-04T21:18:00"`.
pub fn now_iso() -> String {
    now_naive().format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Local naive wall-clock time (second resolution).
pub fn now_naive() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

/// Parse a timestamp produced by [`now_iso`]. Returns `None` on any other
/// shape so a malformed row never aborts a policy evaluation.
pub fn parse_iso(ts: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S").ok()
}
