use chrono::{DateTime, Days, Duration, Months, SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// An optional expiry instant
///
/// `Expiry::never()` means the entity does not expire; it is the canonical
/// zero value and serializes as `null`. The canonical string form (used in
/// commitments) is the RFC3339 UTC instant at second precision, or the
/// empty string for "never".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Expiry(Option<DateTime<Utc>>);

impl Expiry {
    /// The zero value: no expiry
    pub fn never() -> Self {
        Self(None)
    }

    /// An expiry at a fixed instant
    pub fn at(instant: DateTime<Utc>) -> Self {
        Self(Some(instant))
    }

    /// Parses a duration string relative to `base`
    ///
    /// Accepted forms: `"0"` and `"never"` (no expiry), or a sequence of
    /// `<value><unit>` tokens with units `y` (years), `m` (months), `d`
    /// (days), `h` (hours), `min` (minutes), `s` (seconds). Calendar units
    /// (`y`, `m`, `d`) must be whole numbers; clock units may carry a
    /// decimal fraction. `"20y1m1h"` is twenty years, one month and one
    /// hour past `base`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidExpiryString`] for unknown units, fractional
    /// calendar units, or leftover characters.
    pub fn from_date(base: DateTime<Utc>, s: &str) -> Result<Self> {
        if s == "0" || s == "never" {
            return Ok(Self::never());
        }
        let token = Regex::new(r"^([0-9]+(?:\.[0-9]+)?)(min|y|m|d|h|s)")
            .expect("the token pattern is valid");

        let mut rest = s;
        let mut instant = base;
        let mut consumed_any = false;
        while !rest.is_empty() {
            let captures = token
                .captures(rest)
                .ok_or_else(|| Error::InvalidExpiryString(s.to_owned()))?;
            let value = &captures[1];
            let unit = &captures[2];
            let fractional = value.contains('.');

            match unit {
                "y" | "m" | "d" if fractional => {
                    return Err(Error::InvalidExpiryString(s.to_owned()));
                }
                "y" | "m" => {
                    let n: u32 = value
                        .parse()
                        .map_err(|_| Error::InvalidExpiryString(s.to_owned()))?;
                    let months = if unit == "y" { n * 12 } else { n };
                    instant = instant
                        .checked_add_months(Months::new(months))
                        .ok_or_else(|| Error::InvalidExpiryString(s.to_owned()))?;
                }
                "d" => {
                    let n: u64 = value
                        .parse()
                        .map_err(|_| Error::InvalidExpiryString(s.to_owned()))?;
                    instant = instant
                        .checked_add_days(Days::new(n))
                        .ok_or_else(|| Error::InvalidExpiryString(s.to_owned()))?;
                }
                "h" | "min" | "s" => {
                    let v: f64 = value
                        .parse()
                        .map_err(|_| Error::InvalidExpiryString(s.to_owned()))?;
                    let unit_seconds = match unit {
                        "h" => 3600.0,
                        "min" => 60.0,
                        _ => 1.0,
                    };
                    let millis = (v * unit_seconds * 1000.0).round() as i64;
                    instant = instant
                        .checked_add_signed(Duration::milliseconds(millis))
                        .ok_or_else(|| Error::InvalidExpiryString(s.to_owned()))?;
                }
                _ => unreachable!("the token pattern only matches known units"),
            }
            rest = &rest[captures[0].len()..];
            consumed_any = true;
        }
        if !consumed_any {
            return Err(Error::InvalidExpiryString(s.to_owned()));
        }
        Ok(Self(Some(instant)))
    }

    pub fn is_never(&self) -> bool {
        self.0.is_none()
    }

    pub fn instant(&self) -> Option<DateTime<Utc>> {
        self.0
    }

    /// True if the expiry has passed at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.0 {
            Some(instant) => instant <= now,
            None => false,
        }
    }

    /// Canonical string form: RFC3339 UTC at second precision, empty for
    /// "never"
    ///
    /// This exact encoding feeds the requesting commitment, so it must
    /// never change shape.
    pub fn canonical_string(&self) -> String {
        match self.0 {
            Some(instant) => instant.to_rfc3339_opts(SecondsFormat::Secs, true),
            None => String::new(),
        }
    }
}

impl From<Option<DateTime<Utc>>> for Expiry {
    fn from(value: Option<DateTime<Utc>>) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> DateTime<Utc> {
        "2022-12-26T11:30:15Z".parse().unwrap()
    }

    #[test]
    fn zero_and_never_mean_no_expiry() {
        assert_eq!(Expiry::from_date(base(), "0").unwrap(), Expiry::never());
        assert_eq!(Expiry::from_date(base(), "never").unwrap(), Expiry::never());
        assert!(Expiry::from_date(base(), "0").unwrap().is_never());
    }

    #[test]
    fn clock_units_add_exact_seconds() {
        let expiry = Expiry::from_date(base(), "1min5s").unwrap();
        assert_eq!(
            expiry.instant().unwrap(),
            base() + Duration::seconds(65)
        );
    }

    #[test]
    fn calendar_arithmetic_vector() {
        let expiry = Expiry::from_date(base(), "20y1m1h").unwrap();
        assert_eq!(
            expiry.canonical_string(),
            "2043-01-26T12:30:15Z".to_owned()
        );
    }

    #[test]
    fn fractional_calendar_units_are_rejected() {
        assert!(Expiry::from_date(base(), "1.5y").is_err());
        assert!(Expiry::from_date(base(), "1.5m").is_err());
        assert!(Expiry::from_date(base(), "1.5d").is_err());
        // Clock units may be fractional
        assert!(Expiry::from_date(base(), "1.5h").is_ok());
        assert_eq!(
            Expiry::from_date(base(), "0.5min").unwrap().instant().unwrap(),
            base() + Duration::seconds(30)
        );
    }

    #[test]
    fn unknown_units_and_garbage_are_rejected() {
        assert!(Expiry::from_date(base(), "5x").is_err());
        assert!(Expiry::from_date(base(), "1h!").is_err());
        assert!(Expiry::from_date(base(), "").is_err());
        assert!(Expiry::from_date(base(), "h1").is_err());
    }

    #[test]
    fn canonical_string_of_never_is_empty() {
        assert_eq!(Expiry::never().canonical_string(), "");
    }

    #[test]
    fn expiry_comparison() {
        let expiry = Expiry::from_date(base(), "1h").unwrap();
        assert!(!expiry.is_expired(base()));
        assert!(expiry.is_expired(base() + Duration::hours(2)));
        assert!(!Expiry::never().is_expired(base() + Duration::days(10_000)));
    }

    #[test]
    fn serde_is_transparent() {
        let expiry = Expiry::from_date(base(), "1h").unwrap();
        let json = serde_json::to_string(&expiry).unwrap();
        let restored: Expiry = serde_json::from_str(&json).unwrap();
        assert_eq!(expiry, restored);
        assert_eq!(serde_json::to_string(&Expiry::never()).unwrap(), "null");
    }
}
