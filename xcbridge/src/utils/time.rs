//! Serde helpers rendering `SystemTime` as RFC 3339 strings.
//!
//! Used with `#[serde(with = "crate::utils::time")]` on lock entries, session
//! summaries and artifact records.
use chrono::{DateTime, Local};
use serde::{self, Deserialize, Deserializer, Serializer};
use std::time::{Duration, SystemTime};

/// Serializes a `SystemTime` to an RFC 3339 string.
pub fn serialize<S>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let datetime: DateTime<Local> = (*time).into();
    serializer.serialize_str(&datetime.to_rfc3339())
}

/// Deserializes an RFC 3339 string to a `SystemTime`.
pub fn deserialize<'de, D>(deserializer: D) -> Result<SystemTime, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    DateTime::parse_from_rfc3339(&s)
        .map(SystemTime::from)
        .map_err(serde::de::Error::custom)
}

/// Time elapsed since `earlier`, treating clock steps backwards as zero.
pub fn age(earlier: SystemTime) -> Duration {
    SystemTime::now()
        .duration_since(earlier)
        .unwrap_or(Duration::ZERO)
}
