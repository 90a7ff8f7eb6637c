//! Interval-string parsing for `ExternalSource.spec.interval`.
//!
//! Accepts strings matching `^([0-9]+(\.[0-9]+)?(ms|s|m|h))+$` — one or more
//! concatenated `<number><unit>` segments, e.g. `"5m"`, `"1h30m"`, `"1.5s"`.
//! The reconciler applies a floor of one minute at the call site via
//! [`floor_to_minute`]; parsing itself accepts any positive duration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Minimum interval the reconciler will actually honour, regardless of what
/// was parsed from the spec.
pub const MINIMUM_INTERVAL: Duration = Duration::from_secs(60);

/// A parsed, newtype-wrapped polling interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Interval(#[serde(with = "humantime_serde")] Duration);

impl Interval {
    /// Parse a raw interval string, rejecting anything that doesn't match
    /// the concatenated `<number><unit>` grammar.
    pub fn parse(raw: &str) -> Result<Self, IntervalError> {
        Ok(Self(parse_duration(raw)?))
    }

    /// The parsed duration, not yet floored.
    pub fn as_duration(&self) -> Duration {
        self.0
    }

    /// The duration the reconciler should actually requeue at: never less
    /// than [`MINIMUM_INTERVAL`].
    pub fn floor_to_minute(&self) -> Duration {
        floor_to_minute(self.0)
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", humantime::format_duration(self.0))
    }
}

/// Error returned when an interval string doesn't match the expected grammar.
#[derive(Debug, thiserror::Error)]
pub enum IntervalError {
    /// The string was empty, or contained a segment with no recognized unit.
    #[error("invalid interval {raw:?}: {reason}")]
    Malformed {
        /// The original, unparsed string.
        raw: String,
        /// Human-readable reason.
        reason: String,
    },
}

/// Floor a parsed duration to [`MINIMUM_INTERVAL`].
pub fn floor_to_minute(d: Duration) -> Duration {
    d.max(MINIMUM_INTERVAL)
}

/// Parse a raw interval string into a [`Duration`], without flooring.
///
/// Grammar: one or more `<digits>[.<digits>]<unit>` segments concatenated
/// with no separators, where `<unit>` is one of `ms`, `s`, `m`, `h`.
pub fn parse_duration(raw: &str) -> Result<Duration, IntervalError> {
    if raw.is_empty() {
        return Err(IntervalError::Malformed {
            raw: raw.to_string(),
            reason: "empty string".to_string(),
        });
    }

    let mut total = Duration::ZERO;
    let mut chars = raw.char_indices().peekable();
    let mut any_segment = false;

    while chars.peek().is_some() {
        let num_start = chars.peek().map(|(i, _)| *i).unwrap_or(0);
        let mut num_end = num_start;
        let mut saw_digit = false;
        let mut saw_dot = false;

        while let Some(&(i, c)) = chars.peek() {
            if c.is_ascii_digit() {
                saw_digit = true;
                num_end = i + c.len_utf8();
                chars.next();
            } else if c == '.' && !saw_dot {
                saw_dot = true;
                num_end = i + c.len_utf8();
                chars.next();
            } else {
                break;
            }
        }

        if !saw_digit {
            return Err(IntervalError::Malformed {
                raw: raw.to_string(),
                reason: format!("expected a number at byte offset {num_start}"),
            });
        }

        let number: f64 = raw[num_start..num_end].parse().map_err(|_| IntervalError::Malformed {
            raw: raw.to_string(),
            reason: format!("invalid numeric segment {:?}", &raw[num_start..num_end]),
        })?;

        let unit_start = num_end;
        let mut unit_end = unit_start;
        while let Some(&(i, c)) = chars.peek() {
            if c.is_ascii_digit() || c == '.' {
                break;
            }
            unit_end = i + c.len_utf8();
            chars.next();
        }

        if unit_start == unit_end {
            return Err(IntervalError::Malformed {
                raw: raw.to_string(),
                reason: "missing unit (expected one of ms, s, m, h)".to_string(),
            });
        }

        let unit = &raw[unit_start..unit_end];
        let seconds_per_unit: f64 = match unit {
            "ms" => 0.001,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            other => {
                return Err(IntervalError::Malformed {
                    raw: raw.to_string(),
                    reason: format!("unsupported unit {other:?} (expected ms, s, m, or h)"),
                });
            }
        };

        total += Duration::from_secs_f64(number * seconds_per_unit);
        any_segment = true;
    }

    if !any_segment {
        return Err(IntervalError::Malformed {
            raw: raw.to_string(),
            reason: "no segments parsed".to_string(),
        });
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_simple_segments() {
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn parses_compound_segments() {
        assert_eq!(
            parse_duration("1h30m").unwrap(),
            Duration::from_secs(3600 + 1800)
        );
        assert_eq!(
            parse_duration("1.5s").unwrap(),
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn rejects_unknown_unit() {
        assert!(parse_duration("5d").is_err());
        assert!(parse_duration("5").is_err());
        assert!(parse_duration("").is_err());
        assert!(parse_duration("m5").is_err());
    }

    #[test]
    fn floor_applies_minimum() {
        assert_eq!(floor_to_minute(Duration::from_secs(5)), MINIMUM_INTERVAL);
        assert_eq!(
            floor_to_minute(Duration::from_secs(120)),
            Duration::from_secs(120)
        );
    }

    #[test]
    fn interval_roundtrips_through_json() {
        let interval = Interval::parse("5m").unwrap();
        let json = serde_json::to_string(&interval).unwrap();
        let back: Interval = serde_json::from_str(&json).unwrap();
        assert_eq!(interval, back);
    }

    #[test]
    fn interval_display_is_human_readable() {
        let interval = Interval::parse("5m").unwrap();
        assert_eq!(interval.to_string(), "5m");
    }

    proptest! {
        #[test]
        fn any_positive_seconds_minutes_hours_roundtrip(secs in 1u64..100_000) {
            let raw = format!("{secs}s");
            let parsed = parse_duration(&raw).unwrap();
            prop_assert_eq!(parsed, Duration::from_secs(secs));
        }

        #[test]
        fn floor_never_goes_below_minimum(secs in 0u64..10_000) {
            let floored = floor_to_minute(Duration::from_secs(secs));
            prop_assert!(floored >= MINIMUM_INTERVAL);
        }
    }
}
