use chrono::{DateTime, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::warn;

use crate::error::{DotclawError, Result};

/// Parse a scheduled-task timestamp into a UTC instant.
///
/// Two accepted shapes:
/// - ISO-8601 with `Z` or a `±HH:MM` offset — parsed natively.
/// - Bare local wall-clock `YYYY-MM-DD[ T]HH:MM[:SS]` — resolved against
///   `tz`. Ambiguous local times (DST fold) take the earlier instant;
///   nonexistent local times (spring-forward gap) advance to the first
///   valid instant.
pub fn parse_scheduled_timestamp(input: &str, tz: Tz) -> Result<DateTime<Utc>> {
    let trimmed = input.trim();

    if has_explicit_offset(trimmed) {
        return DateTime::parse_from_rfc3339(trimmed)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| DotclawError::Timestamp(format!("{trimmed}: {e}")));
    }

    let naive = parse_local_naive(trimmed)
        .ok_or_else(|| DotclawError::Timestamp(format!("unrecognized timestamp: {trimmed}")))?;

    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Ok(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earlier, _later) => Ok(earlier.with_timezone(&Utc)),
        LocalResult::None => {
            // Spring-forward gap: walk forward in 30-minute steps until the
            // wall clock exists again. DST gaps are at most 2 hours, so four
            // probes always suffice.
            for step in 1..=4 {
                let probe = naive + chrono::Duration::minutes(30 * step);
                if let LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) =
                    tz.from_local_datetime(&probe)
                {
                    return Ok(dt.with_timezone(&Utc));
                }
            }
            Err(DotclawError::Timestamp(format!(
                "{trimmed} does not exist in {tz}"
            )))
        }
    }
}

/// Validate an IANA timezone name, falling back to `default` when the name
/// does not parse.
pub fn validate_timezone(name: &str, default: Tz) -> Tz {
    match name.parse::<Tz>() {
        Ok(tz) => tz,
        Err(_) => {
            warn!(timezone = name, fallback = %default, "invalid timezone, using fallback");
            default
        }
    }
}

/// True when the string carries its own UTC offset (`Z` or trailing `±HH:MM`).
fn has_explicit_offset(s: &str) -> bool {
    if s.ends_with('Z') || s.ends_with('z') {
        return true;
    }
    // An offset suffix looks like +05:30 / -08:00 after the time part. A bare
    // date's '-' separators are earlier than 6 chars from the end.
    let bytes = s.as_bytes();
    if bytes.len() < 6 {
        return false;
    }
    let tail = &s[s.len() - 6..];
    (tail.starts_with('+') || tail.starts_with('-')) && tail.as_bytes()[3] == b':'
}

fn parse_local_naive(s: &str) -> Option<NaiveDateTime> {
    for fmt in [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt);
        }
    }
    None
}
