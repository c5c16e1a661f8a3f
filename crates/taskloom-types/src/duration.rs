//! Compact human-readable durations (`"250ms"`, `"10s"`, `"5m"`, `"1h"`, `"2d"`).
//!
//! This is the duration format of the condition wire shape and of timeouts in
//! declarative workflow files. Formatting always picks the largest unit that
//! represents the value exactly, so `format(parse(s))` is canonical.

use std::time::Duration;

use thiserror::Error;

/// Failure to parse a duration string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DurationParseError {
    #[error("empty duration string")]
    Empty,

    #[error("invalid duration number in '{0}'")]
    InvalidNumber(String),

    #[error("unknown duration unit '{unit}' in '{input}' (expected ms, s, m, h or d)")]
    UnknownUnit { input: String, unit: String },
}

/// Format a duration using the largest exact unit.
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis == 0 {
        return "0s".to_string();
    }
    if millis % 1000 != 0 {
        return format!("{millis}ms");
    }

    let secs = duration.as_secs();
    if secs % 86_400 == 0 {
        format!("{}d", secs / 86_400)
    } else if secs % 3_600 == 0 {
        format!("{}h", secs / 3_600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

/// Parse a duration string. A bare number is read as seconds.
pub fn parse_duration(input: &str) -> Result<Duration, DurationParseError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(DurationParseError::Empty);
    }

    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);

    let value: u64 = number
        .parse()
        .map_err(|_| DurationParseError::InvalidNumber(input.to_string()))?;

    let duration = match unit.trim() {
        "ms" => Duration::from_millis(value),
        "" | "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value * 60),
        "h" => Duration::from_secs(value * 3_600),
        "d" => Duration::from_secs(value * 86_400),
        other => {
            return Err(DurationParseError::UnknownUnit {
                input: input.to_string(),
                unit: other.to_string(),
            });
        }
    };

    Ok(duration)
}

/// `#[serde(with = "crate::duration::serde_str")]` adapter.
pub mod serde_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
