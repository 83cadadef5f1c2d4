use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Declares a string-backed identifier. New ids are UUIDv7 so they sort by
/// creation time and correlate easily in logs.
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// A backup target (WordPress site or source repository).
    SiteId
);
string_id!(
    /// A configured storage destination.
    SinkId
);
string_id!(
    /// A declarative backup schedule.
    ScheduleId
);
string_id!(
    /// One concrete backup execution.
    JobId
);

/// Canonical text form for persisted timestamps.
///
/// Fixed microsecond precision keeps lexical order equal to time order, which
/// the SQL `ORDER BY` / `<=` comparisons rely on.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a timestamp written by [`format_timestamp`] (any RFC 3339 accepted).
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamps_sort_lexically() {
        let a = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let b = a + chrono::Duration::microseconds(1);
        assert!(format_timestamp(a) < format_timestamp(b));
        assert_eq!(format_timestamp(a), "2026-03-01T09:00:00.000000Z");
    }

    #[test]
    fn timestamp_parse_is_inverse() {
        let a = Utc.with_ymd_and_hms(2026, 10, 19, 23, 59, 0).unwrap();
        assert_eq!(parse_timestamp(&format_timestamp(a)).unwrap(), a);
    }

    #[test]
    fn ids_are_unique_and_display_raw() {
        let a = JobId::new();
        let b = JobId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string(), a.as_str());
    }
}
