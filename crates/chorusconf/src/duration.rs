//! Duration strings such as `"30m"` or `"1h30m"`.

use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// Parse a duration string.
///
/// Accepts one or more `<integer><unit>` groups where unit is `ms`, `s`, `m`,
/// `h`, `d`, `w` or `y`. A bare integer is read as milliseconds.
pub fn parse_duration(literal: &str) -> Option<Duration> {
    let literal = literal.trim();
    if literal.is_empty() {
        return None;
    }
    if let Ok(ms) = literal.parse::<u64>() {
        return Some(Duration::from_millis(ms));
    }

    let bytes = literal.as_bytes();
    let mut total_ms = 0u64;
    let mut idx = 0usize;
    while idx < bytes.len() {
        let start = idx;
        while idx < bytes.len() && bytes[idx].is_ascii_digit() {
            idx += 1;
        }
        if start == idx {
            return None;
        }
        let value: u64 = literal[start..idx].parse().ok()?;

        let unit_start = idx;
        while idx < bytes.len() && bytes[idx].is_ascii_alphabetic() {
            idx += 1;
        }
        let factor: u64 = match &literal[unit_start..idx] {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60 * 1_000,
            "h" => 60 * 60 * 1_000,
            "d" => 24 * 60 * 60 * 1_000,
            "w" => 7 * 24 * 60 * 60 * 1_000,
            "y" => 365 * 24 * 60 * 60 * 1_000,
            _ => return None,
        };
        total_ms = total_ms.checked_add(value.checked_mul(factor)?)?;
    }

    Some(Duration::from_millis(total_ms))
}

/// Render a duration in the form `parse_duration` accepts.
pub fn format_duration(duration: Duration) -> String {
    format!("{}ms", duration.as_millis())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Millis(u64),
    Text(String),
}

/// Serde helper for optional duration fields written as strings or integers.
pub(crate) fn deserialize_opt_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<RawDuration> = Option::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(RawDuration::Millis(ms)) => Ok(Some(Duration::from_millis(ms))),
        Some(RawDuration::Text(text)) => parse_duration(&text)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid duration: {text:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_units() {
        assert_eq!(parse_duration("30m"), Some(Duration::from_secs(30 * 60)));
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("1d"), Some(Duration::from_secs(86_400)));
    }

    #[test]
    fn test_compound_and_bare() {
        assert_eq!(parse_duration("1h30m"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_duration("1500"), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_rejects_garbage() {
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("m"), None);
        assert_eq!(parse_duration("10 minutes"), None);
        assert_eq!(parse_duration("5q"), None);
    }

    #[test]
    fn test_format_parses_back() {
        let d = Duration::from_secs(1800);
        assert_eq!(parse_duration(&format_duration(d)), Some(d));
    }
}
