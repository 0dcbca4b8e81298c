//! Duration strings of the form `^\d+(ms|s|m|h)$`.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer, Serializer};

/// Parse `"250ms"`, `"30s"`, `"3m"` or `"1h"`
pub fn parse_duration(input: &str) -> Result<Duration> {
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .with_context(|| format!("Invalid duration: {:?} (missing unit)", input))?;
    let (digits, unit) = input.split_at(split);
    if digits.is_empty() {
        bail!("Invalid duration: {:?} (missing value)", input);
    }
    let value: u64 = digits
        .parse()
        .with_context(|| format!("Invalid duration: {:?}", input))?;

    let millis = match unit {
        "ms" => Some(value),
        "s" => value.checked_mul(1_000),
        "m" => value.checked_mul(60_000),
        "h" => value.checked_mul(3_600_000),
        _ => bail!(
            "Invalid duration: {:?} (expected e.g. \"30s\", \"3m\", \"1h\")",
            input
        ),
    };
    let millis = millis.with_context(|| format!("Duration out of range: {:?}", input))?;
    Ok(Duration::from_millis(millis))
}

/// Render a duration in the largest unit that represents it exactly
pub fn format_duration(duration: Duration) -> String {
    let ms = duration.as_millis();
    if ms % 3_600_000 == 0 && ms > 0 {
        format!("{}h", ms / 3_600_000)
    } else if ms % 60_000 == 0 && ms > 0 {
        format!("{}m", ms / 60_000)
    } else if ms % 1_000 == 0 {
        format!("{}s", ms / 1_000)
    } else {
        format!("{}ms", ms)
    }
}

pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_duration(*duration))
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(serde::de::Error::custom)
}

pub mod option {
    use super::*;

    pub fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match duration {
            Some(d) => serializer.serialize_some(&format_duration(*d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        raw.map(|s| parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("3m").unwrap(), Duration::from_secs(180));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("0s").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["", "3", "m", "3d", "1.5h", "-1s", " 3m", "3m ", "3 m", "3mm"] {
            assert!(parse_duration(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_format_roundtrip() {
        for s in ["250ms", "30s", "3m", "2h"] {
            assert_eq!(format_duration(parse_duration(s).unwrap()), s);
        }
    }
}
