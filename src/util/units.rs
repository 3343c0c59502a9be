use serde::{de, Deserialize, Deserializer};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors produced when parsing human-readable sizes and durations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UnitParseError {
    #[error("empty value")]
    Empty,
    #[error("invalid number in {0:?}")]
    InvalidNumber(String),
    #[error("unknown unit {unit:?} in {input:?}")]
    UnknownUnit { input: String, unit: String },
    #[error("value out of range: {0:?}")]
    Overflow(String),
}

/// A byte count that deserializes from either an integer or a string such as
/// `"700MB"`, `"1.5 GiB"` or `"4g"`.
///
/// Decimal suffixes (`KB`, `MB`, `GB`, `TB`) are powers of 1000, binary
/// suffixes (`KiB`, `MiB`, `GiB`, `TiB`) powers of 1024. A bare single-letter
/// suffix (`k`, `m`, `g`, `t`) is treated as binary, matching what most
/// trackers report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bytes", self.0)
    }
}

impl std::str::FromStr for ByteSize {
    type Err = UnitParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_size(s).map(ByteSize)
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Int(n) => Ok(ByteSize(n)),
            Raw::Text(s) => parse_size(&s).map(ByteSize).map_err(de::Error::custom),
        }
    }
}

/// Split `"1.5GiB"` into `("1.5", "GiB")`.
fn split_number(input: &str) -> (&str, &str) {
    let idx = input
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(input.len());
    let (num, unit) = input.split_at(idx);
    (num, unit.trim())
}

/// Parse a human-readable byte size into a number of bytes.
pub fn parse_size(input: &str) -> Result<u64, UnitParseError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(UnitParseError::Empty);
    }

    let (num, unit) = split_number(trimmed);
    let multiplier: u64 = match unit.to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "kb" => 1_000,
        "mb" => 1_000_000,
        "gb" => 1_000_000_000,
        "tb" => 1_000_000_000_000,
        "k" | "kib" => 1 << 10,
        "m" | "mib" => 1 << 20,
        "g" | "gib" => 1 << 30,
        "t" | "tib" => 1 << 40,
        _ => {
            return Err(UnitParseError::UnknownUnit {
                input: input.to_string(),
                unit: unit.to_string(),
            })
        }
    };

    scale(num, multiplier, input)
}

/// Parse a duration such as `"90m"`, `"12h"`, `"1d"`, `"1w"` or `"1d12h"`.
///
/// A bare integer is read as seconds. An empty string is rejected; callers
/// that treat "unset" as zero should check for emptiness first.
pub fn parse_duration(input: &str) -> Result<Duration, UnitParseError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(UnitParseError::Empty);
    }

    if let Ok(secs) = trimmed.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total: u64 = 0;
    let mut rest = trimmed;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_end == 0 {
            return Err(UnitParseError::InvalidNumber(input.to_string()));
        }
        let (num, after) = rest.split_at(num_end);
        let unit_end = after
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(after.len());
        let (unit, next) = after.split_at(unit_end);

        let multiplier: u64 = match unit.trim() {
            "s" | "sec" | "secs" => 1,
            "m" | "min" | "mins" => 60,
            "h" | "hr" | "hrs" => 3_600,
            "d" | "day" | "days" => 86_400,
            "w" | "wk" | "weeks" => 604_800,
            other => {
                return Err(UnitParseError::UnknownUnit {
                    input: input.to_string(),
                    unit: other.to_string(),
                })
            }
        };

        total = total
            .checked_add(scale(num, multiplier, input)?)
            .ok_or_else(|| UnitParseError::Overflow(input.to_string()))?;
        rest = next;
    }

    Ok(Duration::from_secs(total))
}

fn scale(num: &str, multiplier: u64, input: &str) -> Result<u64, UnitParseError> {
    if let Ok(whole) = num.parse::<u64>() {
        return whole
            .checked_mul(multiplier)
            .ok_or_else(|| UnitParseError::Overflow(input.to_string()));
    }

    let value: f64 = num
        .parse()
        .map_err(|_| UnitParseError::InvalidNumber(input.to_string()))?;
    let scaled = value * multiplier as f64;
    if !scaled.is_finite() || scaled < 0.0 || scaled > u64::MAX as f64 {
        return Err(UnitParseError::Overflow(input.to_string()));
    }
    Ok(scaled.round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_bytes() {
        assert_eq!(parse_size("1024"), Ok(1024));
        assert_eq!(parse_size("512B"), Ok(512));
    }

    #[test]
    fn test_decimal_and_binary_suffixes() {
        assert_eq!(parse_size("700MB"), Ok(700_000_000));
        assert_eq!(parse_size("1GiB"), Ok(1 << 30));
        assert_eq!(parse_size("4g"), Ok(4 << 30));
        assert_eq!(parse_size("1.5 GiB"), Ok(1_610_612_736));
    }

    #[test]
    fn test_size_errors() {
        assert_eq!(parse_size(""), Err(UnitParseError::Empty));
        assert!(matches!(
            parse_size("12 parsecs"),
            Err(UnitParseError::UnknownUnit { .. })
        ));
        assert!(matches!(
            parse_size("..MB"),
            Err(UnitParseError::InvalidNumber(_))
        ));
    }

    #[test]
    fn test_bytesize_deserializes_from_int_or_string() {
        #[derive(Deserialize)]
        struct Wrapper {
            size: ByteSize,
        }

        let w: Wrapper = toml::from_str("size = 42").unwrap();
        assert_eq!(w.size, ByteSize(42));

        let w: Wrapper = toml::from_str("size = \"2KB\"").unwrap();
        assert_eq!(w.size, ByteSize(2_000));

        assert!(toml::from_str::<Wrapper>("size = \"lots\"").is_err());
    }

    #[test]
    fn test_durations() {
        assert_eq!(parse_duration("90m"), Ok(Duration::from_secs(5_400)));
        assert_eq!(parse_duration("12h"), Ok(Duration::from_secs(43_200)));
        assert_eq!(parse_duration("1d"), Ok(Duration::from_secs(86_400)));
        assert_eq!(parse_duration("1w"), Ok(Duration::from_secs(604_800)));
        assert_eq!(parse_duration("1d12h"), Ok(Duration::from_secs(129_600)));
        assert_eq!(parse_duration("30"), Ok(Duration::from_secs(30)));
    }

    #[test]
    fn test_duration_errors() {
        assert_eq!(parse_duration("  "), Err(UnitParseError::Empty));
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("3 fortnights").is_err());
    }
}
