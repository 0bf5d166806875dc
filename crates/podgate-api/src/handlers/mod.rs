//! Request handlers.
//!
//! Handlers are thin: decode and validate parameters, call the engine, and
//! encode the result. Anything that can be rejected is rejected before a
//! streaming handler commits its 200 status.

pub mod container;
pub mod image;
pub mod pod;
pub mod system;

use chrono::{DateTime, Utc};

/// Formats a timestamp the way Docker clients expect.
pub(crate) fn rfc3339(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}

/// Formats an optional timestamp; Docker uses the zero time for "never".
pub(crate) fn rfc3339_or_zero(time: Option<DateTime<Utc>>) -> String {
    time.map_or_else(|| "0001-01-01T00:00:00Z".to_string(), rfc3339)
}
