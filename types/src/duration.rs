//! Human-readable duration strings for configuration values.

use std::{fmt, str::FromStr, time::Duration};

/// A duration expressed as a string like `"5m"` or `"1h30m"`.
///
/// The accepted grammar is one or more `<integer><unit>` pairs where the unit
/// is one of `ns`, `us`, `ms`, `s`, `m`, `h`. Units may repeat and appear in
/// any order; the total is the sum of all pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DurationString(Duration);

impl DurationString {
    pub const fn new(duration: Duration) -> Self {
        Self(duration)
    }

    /// The parsed duration.
    pub const fn as_duration(&self) -> Duration {
        self.0
    }
}

impl From<Duration> for DurationString {
    fn from(duration: Duration) -> Self {
        Self(duration)
    }
}

impl From<DurationString> for Duration {
    fn from(s: DurationString) -> Self {
        s.0
    }
}

/// An error parsing a duration string.
#[derive(Debug, thiserror::Error)]
pub enum DurationParseError {
    #[error("empty duration")]
    Empty,

    #[error("missing number in duration {0:?}")]
    MissingNumber(String),

    #[error("missing unit in duration {0:?}")]
    MissingUnit(String),

    #[error("unknown unit {unit:?} in duration {input:?}")]
    UnknownUnit { input: String, unit: String },

    #[error("duration {0:?} overflows")]
    Overflow(String),
}

const NANOS_PER_US: u128 = 1_000;
const NANOS_PER_MS: u128 = 1_000_000;
const NANOS_PER_SEC: u128 = 1_000_000_000;
const NANOS_PER_MIN: u128 = 60 * NANOS_PER_SEC;
const NANOS_PER_HOUR: u128 = 3_600 * NANOS_PER_SEC;

impl FromStr for DurationString {
    type Err = DurationParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        if input.is_empty() {
            return Err(DurationParseError::Empty);
        }

        let mut total: u128 = 0;
        let mut rest = input;
        while !rest.is_empty() {
            let digits_end = rest
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(rest.len());
            if digits_end == 0 {
                return Err(DurationParseError::MissingNumber(input.to_owned()));
            }
            let value: u128 = rest[..digits_end]
                .parse()
                .map_err(|_| DurationParseError::Overflow(input.to_owned()))?;
            rest = &rest[digits_end..];

            let unit_end = rest
                .find(|c: char| c.is_ascii_digit())
                .unwrap_or(rest.len());
            let unit = &rest[..unit_end];
            let nanos_per_unit = match unit {
                "ns" => 1,
                "us" => NANOS_PER_US,
                "ms" => NANOS_PER_MS,
                "s" => NANOS_PER_SEC,
                "m" => NANOS_PER_MIN,
                "h" => NANOS_PER_HOUR,
                "" => return Err(DurationParseError::MissingUnit(input.to_owned())),
                _ => {
                    return Err(DurationParseError::UnknownUnit {
                        input: input.to_owned(),
                        unit: unit.to_owned(),
                    });
                }
            };
            rest = &rest[unit_end..];

            total = value
                .checked_mul(nanos_per_unit)
                .and_then(|n| total.checked_add(n))
                .ok_or_else(|| DurationParseError::Overflow(input.to_owned()))?;
        }

        let nanos =
            u64::try_from(total).map_err(|_| DurationParseError::Overflow(input.to_owned()))?;
        Ok(Self(Duration::from_nanos(nanos)))
    }
}

impl fmt::Display for DurationString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut nanos = self.0.as_nanos();
        if nanos == 0 {
            return f.write_str("0s");
        }

        for (unit, nanos_per_unit) in [
            ("h", NANOS_PER_HOUR),
            ("m", NANOS_PER_MIN),
            ("s", NANOS_PER_SEC),
            ("ms", NANOS_PER_MS),
            ("us", NANOS_PER_US),
            ("ns", 1),
        ] {
            let count = nanos / nanos_per_unit;
            if count > 0 {
                write!(f, "{count}{unit}")?;
                nanos -= count * nanos_per_unit;
            }
        }
        Ok(())
    }
}

impl serde::Serialize for DurationString {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for DurationString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s: String = serde::Deserialize::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_units() {
        for (input, expected) in [
            ("300ns", Duration::from_nanos(300)),
            ("10us", Duration::from_micros(10)),
            ("250ms", Duration::from_millis(250)),
            ("5s", Duration::from_secs(5)),
            ("15m", Duration::from_secs(15 * 60)),
            ("2h", Duration::from_secs(2 * 3_600)),
        ] {
            let parsed: DurationString = input.parse().expect(input);
            assert_eq!(parsed.as_duration(), expected, "{input}");
        }
    }

    #[test]
    fn parses_compound_durations() {
        let parsed: DurationString = "1h30m".parse().unwrap();
        assert_eq!(parsed.as_duration(), Duration::from_secs(90 * 60));

        let parsed: DurationString = "1m30s500ms".parse().unwrap();
        assert_eq!(parsed.as_duration(), Duration::from_millis(90_500));
    }

    #[test]
    fn rejects_malformed_input() {
        assert!("".parse::<DurationString>().is_err());
        assert!("h".parse::<DurationString>().is_err());
        assert!("10".parse::<DurationString>().is_err());
        assert!("10x".parse::<DurationString>().is_err());
        assert!("1.5h".parse::<DurationString>().is_err());
        assert!("-5m".parse::<DurationString>().is_err());
    }

    #[test]
    fn display_round_trips() {
        for input in ["1h30m", "5m", "250ms", "1m30s500ms"] {
            let parsed: DurationString = input.parse().unwrap();
            assert_eq!(parsed.to_string(), input);
            let reparsed: DurationString = parsed.to_string().parse().unwrap();
            assert_eq!(parsed, reparsed);
        }
    }

    #[test]
    fn deserializes_from_json_string() {
        let parsed: DurationString = serde_json::from_str(r#""45s""#).unwrap();
        assert_eq!(parsed.as_duration(), Duration::from_secs(45));

        assert!(serde_json::from_str::<DurationString>(r#""bogus""#).is_err());
    }
}
