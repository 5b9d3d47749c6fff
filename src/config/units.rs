//! Human-readable unit parsing for configuration values: durations
//! suffixed `ms`/`s`/`m`/`h` (a bare number is milliseconds), and byte sizes
//! suffixed `k`/`m`/`g` (base-1024, a bare number is bytes).

use crate::errors::{XecError, XecResult};

/// Parse a duration string into milliseconds.
///
/// Accepts a bare integer (milliseconds), or an integer immediately followed
/// by one of `ms`, `s`, `m`, `h`.
///
/// # Errors
/// Returns `XecError::ConfigInvalid` if `input` is not a recognized form.
pub fn parse_duration_ms(input: &str) -> XecResult<u64> {
    let trimmed = input.trim();
    let (number_part, unit) = split_number_and_suffix(trimmed);
    let number: u64 = number_part
        .parse()
        .map_err(|_| XecError::ConfigInvalid(format!("invalid duration '{input}'")))?;
    let ms = match unit {
        "" | "ms" => number,
        "s" => number.saturating_mul(1_000),
        "m" => number.saturating_mul(60_000),
        "h" => number.saturating_mul(3_600_000),
        other => return Err(XecError::ConfigInvalid(format!("unknown duration unit '{other}' in '{input}'"))),
    };
    Ok(ms)
}

/// Parse a byte-size string into a byte count.
///
/// Accepts a bare integer (bytes), or an integer immediately followed by one
/// of `k`, `m`, `g` (base-1024, case-insensitive).
///
/// # Errors
/// Returns `XecError::ConfigInvalid` if `input` is not a recognized form.
pub fn parse_size_bytes(input: &str) -> XecResult<u64> {
    let trimmed = input.trim();
    let (number_part, unit) = split_number_and_suffix(trimmed);
    let number: u64 = number_part
        .parse()
        .map_err(|_| XecError::ConfigInvalid(format!("invalid size '{input}'")))?;
    let bytes = match unit.to_ascii_lowercase().as_str() {
        "" => number,
        "k" => number.saturating_mul(1024),
        "m" => number.saturating_mul(1024 * 1024),
        "g" => number.saturating_mul(1024 * 1024 * 1024),
        other => return Err(XecError::ConfigInvalid(format!("unknown size unit '{other}' in '{input}'"))),
    };
    Ok(bytes)
}

fn split_number_and_suffix(s: &str) -> (&str, &str) {
    let split_at = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    s.split_at(split_at)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_number_is_milliseconds() {
        assert_eq!(parse_duration_ms("500").unwrap(), 500);
    }

    #[test]
    fn duration_suffixes_convert_correctly() {
        assert_eq!(parse_duration_ms("30s").unwrap(), 30_000);
        assert_eq!(parse_duration_ms("2m").unwrap(), 120_000);
        assert_eq!(parse_duration_ms("1h").unwrap(), 3_600_000);
        assert_eq!(parse_duration_ms("250ms").unwrap(), 250);
    }

    #[test]
    fn size_suffixes_are_base_1024() {
        assert_eq!(parse_size_bytes("1k").unwrap(), 1024);
        assert_eq!(parse_size_bytes("2m").unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_size_bytes("1g").unwrap(), 1024 * 1024 * 1024);
    }

    #[test]
    fn unknown_unit_is_rejected() {
        assert!(parse_duration_ms("5x").is_err());
        assert!(parse_size_bytes("5tb").is_err());
    }
}
