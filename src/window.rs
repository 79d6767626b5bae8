//! Lookback window shorthand parsing
//!
//! Recall commands express how far back to look as a compact shorthand
//! like `30s`, `5m`, `1h30m`, or `2d`. Parsing happens before any storage
//! access; a malformed window is rejected outright.
//!
//! Units: `y` (365 days), `mo` (30 days), `w`, `d`, `h`, `m`, `s`.

use crate::error::WindowError;
use std::time::Duration;

const SECS_PER_MINUTE: f64 = 60.0;
const SECS_PER_HOUR: f64 = 3600.0;
const SECS_PER_DAY: f64 = 86_400.0;

fn unit_secs(unit: &str) -> Option<f64> {
    match unit {
        "y" => Some(365.0 * SECS_PER_DAY),
        "mo" => Some(30.0 * SECS_PER_DAY),
        "w" => Some(7.0 * SECS_PER_DAY),
        "d" => Some(SECS_PER_DAY),
        "h" => Some(SECS_PER_HOUR),
        "m" => Some(SECS_PER_MINUTE),
        "s" => Some(1.0),
        _ => None,
    }
}

/// Parse a lookback shorthand like `"1h30m"` into a [`Duration`].
pub fn parse_lookback(input: &str) -> Result<Duration, WindowError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(WindowError::Empty);
    }

    let mut total_secs = 0.0f64;
    let mut saw_unit = false;
    let mut rest = s;

    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(number_len);

        if tail.is_empty() {
            // Trailing digits with no unit, e.g. "30" or "5m3".
            return Err(WindowError::NoUnit(input.trim().to_string()));
        }

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_len);

        let value: f64 = number
            .parse()
            .map_err(|_| WindowError::BadNumber(number.to_string()))?;
        let secs = unit_secs(unit).ok_or_else(|| WindowError::UnknownUnit(unit.to_string()))?;

        total_secs += value * secs;
        saw_unit = true;
        rest = next;
    }

    if !saw_unit {
        return Err(WindowError::NoUnit(input.trim().to_string()));
    }
    if !total_secs.is_finite() || total_secs <= 0.0 {
        return Err(WindowError::Zero);
    }

    Ok(Duration::from_secs_f64(total_secs))
}
