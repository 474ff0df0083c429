//! Defines custom `DateTime` type.

use std::fmt;

use chrono::{SecondsFormat, TimeZone, Utc};
use redis::{RedisWrite, ToRedisArgs};
use serde::de::{Deserialize, Deserializer, Error};
use serde::ser::{Serialize, Serializer};

use crate::models::Duration;

/// Thin wrapper around a `chrono::DateTime<Utc>` with functions for custom (de)serialisation.
///
/// Serialised to JSON and passed to Redis as an RFC3339 string with millisecond precision.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub struct DateTime(chrono::DateTime<Utc>);

impl DateTime {
    /// Get current UTC date/time.
    pub fn now() -> Self {
        DateTime(Utc::now())
    }

    /// Build a date/time from milliseconds since the Unix epoch.
    pub fn from_millis(millis: i64) -> Option<Self> {
        Utc.timestamp_millis_opt(millis).single().map(DateTime)
    }

    /// Milliseconds since the Unix epoch.
    pub fn timestamp_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Number of milliseconds since another given date/time. Negative if `other` is later.
    pub fn millis_since(&self, other: &DateTime) -> i64 {
        self.0.signed_duration_since(other.0).num_milliseconds()
    }

    /// This date/time shifted forwards by the given duration, or `None` if that's past the
    /// latest representable date/time.
    pub fn checked_plus(&self, duration: Duration) -> Option<Self> {
        self.0
            .checked_add_signed(chrono::Duration::milliseconds(duration.as_millis()))
            .map(DateTime)
    }

    /// This date/time shifted forwards by the given duration, clamped to the latest
    /// representable date/time.
    pub fn plus(&self, duration: Duration) -> Self {
        self.checked_plus(duration)
            .unwrap_or(DateTime(chrono::DateTime::<Utc>::MAX_UTC))
    }

    /// This date/time shifted backwards by the given duration, clamped to the earliest
    /// representable date/time.
    pub fn minus(&self, duration: Duration) -> Self {
        self.0
            .checked_sub_signed(chrono::Duration::milliseconds(duration.as_millis()))
            .map_or(DateTime(chrono::DateTime::<Utc>::MIN_UTC), DateTime)
    }

    pub fn to_rfc3339(&self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn parse(s: &str) -> Option<Self> {
        chrono::DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| DateTime(dt.with_timezone(&Utc)))
    }
}

impl ToRedisArgs for DateTime {
    /// Format this struct as an RFC3339 date string for storage in Redis.
    fn write_redis_args<W: ?Sized + RedisWrite>(&self, out: &mut W) {
        self.to_rfc3339().write_redis_args(out)
    }
}

impl Serialize for DateTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_rfc3339())
    }
}

impl<'de> Deserialize<'de> for DateTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<DateTime, D::Error> {
        let s: String = Deserialize::deserialize(deserializer)?;
        DateTime::parse(&s).ok_or_else(|| D::Error::custom(format!("Invalid RFC3339 date/time: {}", s)))
    }
}

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_rfc3339())
    }
}
