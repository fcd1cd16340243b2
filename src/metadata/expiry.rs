use std::fmt::{self, Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A strict RFC-3339 `YYYY-MM-DDTHH:MM:SSZ` timestamp.
///
/// Construction validates length (20) and the trailing `Z`; comparisons are
/// then lexicographic on the stored string, which is valid exactly because
/// the format is fixed-width and zero-padded.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Expiry(String);

const EXPECTED_LEN: usize = 20;

impl Expiry {
    pub fn parse(raw: &str) -> Option<Expiry> {
        if raw.len() != EXPECTED_LEN || !raw.ends_with('Z') {
            return None;
        }
        DateTime::parse_from_rfc3339(raw).ok()?;
        Some(Expiry(raw.to_string()))
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Expiry {
        Expiry(dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if this timestamp is invalid (it never is, by construction) or
    /// strictly before `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match DateTime::parse_from_rfc3339(&self.0) {
            Ok(dt) => dt < now,
            Err(_) => true,
        }
    }
}

impl Display for Expiry {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Expiry {
    fn serialize<S: Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Expiry {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Expiry, D::Error> {
        let raw = String::deserialize(de)?;
        Expiry::parse(&raw).ok_or_else(|| {
            serde::de::Error::custom(format!("not a valid RFC-3339 timestamp: {}", raw))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn rejects_malformed_timestamps() {
        assert!(Expiry::parse("not-a-date").is_none());
        assert!(Expiry::parse("2020-01-01T00:00:00+01:00").is_none());
        assert!(Expiry::parse("2020-01-01T00:00:00Z").is_some());
    }

    #[test]
    fn ordering_is_lexicographic_and_correct() {
        let a = Expiry::parse("2020-01-01T00:00:00Z").unwrap();
        let b = Expiry::parse("2021-01-01T00:00:00Z").unwrap();
        assert!(a < b);
    }

    #[test]
    fn expiry_check_uses_injected_now() {
        let e = Expiry::parse("2020-06-01T00:00:00Z").unwrap();
        let before = Utc.ymd(2020, 1, 1).and_hms(0, 0, 0);
        let after = Utc.ymd(2020, 12, 1).and_hms(0, 0, 0);
        assert!(!e.is_expired_at(before));
        assert!(e.is_expired_at(after));
    }
}
