//! Human-friendly durations such as `"500ms"`, `"10s"` or `"2h"`.

use std::time::Duration;

use crate::error::{Error, Result};

/// Parse a duration with a unit suffix.
///
/// Supported suffixes: `ms`, `s`, `m`, `h`, `d`. The value must be > 0.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(Error::invalid_duration(input, "empty duration string"));
    }

    let Some(split) = trimmed.find(|c: char| c.is_alphabetic()) else {
        return Err(Error::invalid_duration(
            input,
            "missing unit suffix (ms/s/m/h/d)",
        ));
    };
    let (number, suffix) = trimmed.split_at(split);

    let value: u64 = number
        .trim()
        .parse()
        .map_err(|_| Error::invalid_duration(input, format!("invalid number `{number}`")))?;
    if value == 0 {
        return Err(Error::invalid_duration(input, "duration must be > 0"));
    }

    let millis_per_unit: u64 = match suffix {
        "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        _ => {
            return Err(Error::invalid_duration(
                input,
                format!("unknown suffix `{suffix}` (expected ms/s/m/h/d)"),
            ));
        },
    };
    let millis = value
        .checked_mul(millis_per_unit)
        .ok_or_else(|| Error::invalid_duration(input, "duration too large"))?;

    Ok(Duration::from_millis(millis))
}
