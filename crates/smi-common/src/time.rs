//! ---
//! smi_section: "01-core-functionality"
//! smi_subsection: "module"
//! smi_type: "source"
//! smi_scope: "code"
//! smi_description: "Shared primitives and utilities for SMI services."
//! smi_version: "v0.1.0"
//! smi_owner: "tbd"
//! ---
use chrono::{DateTime, TimeZone, Utc};

/// Seconds since the unix epoch, as carried in message headers.
pub fn unix_time_now() -> i64 {
    unix_time(Utc::now())
}

/// Convert a UTC timestamp into whole seconds since the unix epoch.
pub fn unix_time(at: DateTime<Utc>) -> i64 {
    at.timestamp()
}

/// Convert unix seconds back into a UTC timestamp.
///
/// Returns `None` when the value is outside the range chrono can represent.
pub fn unix_time_to_datetime(seconds: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(seconds, 0).single()
}
