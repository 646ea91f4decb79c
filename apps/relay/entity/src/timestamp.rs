use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer};

/// Parses the timestamp shapes Postgres-backed APIs hand out: RFC 3339,
/// the `2025-03-01 12:30:45.12+00` text form, and naive UTC values.
pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_variants() {
        let expected = parse("2025-03-01T12:30:45Z").unwrap();

        assert_eq!(parse("2025-03-01T12:30:45+00:00"), Some(expected));
        assert_eq!(parse("2025-03-01 12:30:45+00"), Some(expected));
        assert_eq!(parse("2025-03-01T12:30:45"), Some(expected));
        assert_eq!(parse("2025-03-01 14:30:45+02:00"), Some(expected));
        assert_eq!(parse("yesterday"), None);
    }
}
