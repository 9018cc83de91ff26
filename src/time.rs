//! Timestamp Utility.
//!
//! All internal timestamps are UTC. Every ingress from an external source
//! must pass through [`to_utc`]; every persistence boundary must pass
//! [`validate_utc`].

use crate::error::KtrdrError;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

/// Anything that can be turned into a UTC instant at an ingress boundary.
pub trait IntoUtc {
    fn into_utc(self) -> Result<DateTime<Utc>, KtrdrError>;
}

impl IntoUtc for NaiveDateTime {
    fn into_utc(self) -> Result<DateTime<Utc>, KtrdrError> {
        Ok(Utc.from_utc_datetime(&self))
    }
}

impl<Tz: TimeZone> IntoUtc for DateTime<Tz> {
    fn into_utc(self) -> Result<DateTime<Utc>, KtrdrError> {
        Ok(self.with_timezone(&Utc))
    }
}

impl IntoUtc for &str {
    fn into_utc(self) -> Result<DateTime<Utc>, KtrdrError> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(self) {
            return Ok(dt.with_timezone(&Utc));
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(self, "%Y-%m-%d %H:%M:%S") {
            return Ok(Utc.from_utc_datetime(&naive));
        }
        Err(KtrdrError::invalid_input(format!(
            "unparseable timestamp: {self}"
        )))
    }
}

/// Convert any datetime input into a UTC-aware instant.
pub fn to_utc<T: IntoUtc>(input: T) -> Result<DateTime<Utc>, KtrdrError> {
    input.into_utc()
}

/// A strictly monotonic, duplicate-free, UTC-indexed sequence of instants.
///
/// `validate_utc` is trivially satisfied here because `chrono::DateTime<Utc>`
/// carries its timezone in the type; this assertion exists as the explicit
/// checkpoint every boundary read/write must call, matching the invariant
/// that a storage-layer bug producing non-UTC data is caught immediately
/// rather than silently propagating.
pub fn validate_utc(index: &[DateTime<Utc>]) -> Result<(), KtrdrError> {
    for pair in index.windows(2) {
        if pair[1] <= pair[0] {
            return Err(KtrdrError::TimezoneViolation {
                message: format!(
                    "index not strictly monotonic increasing at {} -> {}",
                    pair[0], pair[1]
                ),
            });
        }
    }
    Ok(())
}

/// Format a UTC instant for display in `display_tz`. Never call this from an
/// internal code path before terminal egress (API boundary, log formatter).
pub fn format_for_display<Tz: TimeZone>(utc: DateTime<Utc>, display_tz: &Tz) -> String
where
    Tz::Offset: std::fmt::Display,
{
    utc.with_timezone(display_tz).to_rfc3339()
}
