//! Go duration strings (`1h30m`, `90s`, `500ms`).
//!
//! Spec durations are written the way Kubernetes `metav1.Duration` renders them.
//! Use with `#[serde(with = "duration")]` or `#[serde(with = "duration::option")]`.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

/// Parses a Go duration string.
///
/// # Errors
///
/// Returns a description of the problem when the string is not a valid duration.
pub fn parse(input: &str) -> std::result::Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err(String::from("empty duration"));
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.starts_with('-') {
        return Err(format!("negative duration '{input}'"));
    }

    let s = s.strip_prefix('+').unwrap_or(s);
    let mut total_nanos: u128 = 0;
    let mut rest = s;

    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(format!("invalid duration '{input}': expected a number"));
        }
        let (number, tail) = rest.split_at(number_len);
        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_len);

        let unit_nanos: u128 = match unit {
            "ns" => 1,
            "us" | "µs" | "μs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 3_600 * 1_000_000_000,
            "" => return Err(format!("invalid duration '{input}': missing unit")),
            other => return Err(format!("invalid duration '{input}': unknown unit '{other}'")),
        };

        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        if whole.is_empty() && fraction.is_empty() {
            return Err(format!("invalid duration '{input}'"));
        }
        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole
                .parse()
                .map_err(|_| format!("invalid duration '{input}'"))?
        };
        total_nanos = total_nanos.saturating_add(whole.saturating_mul(unit_nanos));

        if !fraction.is_empty() {
            let digits =
                u32::try_from(fraction.len()).map_err(|_| format!("invalid duration '{input}'"))?;
            let scale = 10u128
                .checked_pow(digits)
                .ok_or_else(|| format!("invalid duration '{input}'"))?;
            let fraction: u128 = fraction
                .parse()
                .map_err(|_| format!("invalid duration '{input}'"))?;
            total_nanos = total_nanos.saturating_add(fraction.saturating_mul(unit_nanos) / scale);
        }

        rest = next;
    }

    let overflow = |_| format!("duration '{input}' overflows");
    let secs = u64::try_from(total_nanos / 1_000_000_000).map_err(overflow)?;
    let nanos = u32::try_from(total_nanos % 1_000_000_000).map_err(overflow)?;
    Ok(Duration::new(secs, nanos))
}

/// Formats a duration the way Go prints it (`1h30m0s`, `500ms`, `0s`).
#[must_use]
pub fn format(duration: Duration) -> String {
    if duration.is_zero() {
        return String::from("0s");
    }
    if duration.as_secs() == 0 {
        let millis = duration.subsec_millis();
        if u128::from(millis) * 1_000_000 == duration.as_nanos() {
            return format!("{millis}ms");
        }
        return format!("{}ns", duration.as_nanos());
    }

    let total = duration.as_secs();
    let hours = total / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;
    let millis = duration.subsec_millis();

    let seconds = if millis == 0 {
        format!("{seconds}s")
    } else {
        format!("{seconds}.{millis:03}s")
    };

    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}")
    } else {
        seconds
    }
}

/// Serializes a duration as a Go duration string.
///
/// # Errors
///
/// Propagates serializer errors.
pub fn serialize<S: Serializer>(
    value: &Duration,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&format(*value))
}

/// Deserializes a Go duration string.
///
/// # Errors
///
/// Returns an error when the string is not a valid duration.
pub fn deserialize<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Duration, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse(&raw).map_err(serde::de::Error::custom)
}

/// Same as the parent module for `Option<Duration>` fields.
pub mod option {
    use super::{Deserialize, Deserializer, Duration, Serializer};

    /// Serializes an optional duration.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&super::format(*d)),
            None => serializer.serialize_none(),
        }
    }

    /// Deserializes an optional duration.
    ///
    /// # Errors
    ///
    /// Returns an error when the string is not a valid duration.
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Option<Duration>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|s| super::parse(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_compound() {
        assert_eq!(parse("1h30m").unwrap(), Duration::from_secs(5_400));
        assert_eq!(parse("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse("1.5h").unwrap(), Duration::from_secs(5_400));
        assert_eq!(parse("0").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse("").is_err());
        assert!(parse("10").is_err());
        assert!(parse("5x").is_err());
        assert!(parse("-5m").is_err());
    }

    #[test]
    fn test_format() {
        assert_eq!(format(Duration::from_secs(5_400)), "1h30m0s");
        assert_eq!(format(Duration::from_secs(300)), "5m0s");
        assert_eq!(format(Duration::from_secs(45)), "45s");
        assert_eq!(format(Duration::from_millis(250)), "250ms");
        assert_eq!(format(Duration::ZERO), "0s");
    }
}
