//! Serde helpers for column types the remote service is loose about.
//!
//! The service hands out date-only columns as `YYYY-MM-DD` but sometimes as a
//! full timestamp, and timestamp columns either as RFC 3339 or in SQL form
//! (`2024-03-01 08:15:00.123+00`). Use these with `#[serde(with = "...")]`:
//!
//! ```
//! use chrono::{DateTime, NaiveDate, Utc};
//! use lifesync_model::fields;
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct Meal {
//!     #[serde(with = "fields::date_only")]
//!     eaten_on: NaiveDate,
//!     #[serde(with = "fields::timestamp")]
//!     created_at: DateTime<Utc>,
//! }
//!
//! let meal: Meal = serde_json::from_str(
//!     r#"{"eaten_on": "2024-03-01", "created_at": "2024-03-01 08:15:00+00"}"#,
//! ).unwrap();
//! assert_eq!(meal.eaten_on, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
//! ```

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};

const SQL_TIMESTAMP_TZ: &str = "%Y-%m-%d %H:%M:%S%.f%#z";
const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Parses any timestamp form the service emits. Zone-less values are UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<FixedOffset>, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts);
    }
    if let Ok(ts) = DateTime::parse_from_str(raw, SQL_TIMESTAMP_TZ) {
        return Ok(ts);
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(Utc.from_utc_datetime(&naive).fixed_offset());
        }
    }
    Err(format!("unrecognised timestamp {raw:?}"))
}

/// `NaiveDate` ⇄ `YYYY-MM-DD`.
///
/// Timestamps are accepted on input and truncated to the date they were
/// written in (their own offset, not UTC).
pub mod date_only {
    use chrono::NaiveDate;
    use serde::{de, Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%d";

    pub fn parse(raw: &str) -> Result<NaiveDate, String> {
        NaiveDate::parse_from_str(raw, FORMAT)
            .or_else(|_| super::parse_timestamp(raw).map(|ts| ts.date_naive()))
            .map_err(|_| format!("expected a YYYY-MM-DD date, got {raw:?}"))
    }

    pub fn serialize<S: Serializer>(date: &NaiveDate, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&date.format(FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDate, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(de::Error::custom)
    }

    /// Nullable date-only column.
    pub mod option {
        use chrono::NaiveDate;
        use serde::{de, Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            date: &Option<NaiveDate>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match date {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<NaiveDate>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|raw| super::parse(&raw).map_err(de::Error::custom))
                .transpose()
        }
    }
}

/// `DateTime<Utc>` ⇄ RFC 3339 (millisecond precision, `Z` suffix).
pub mod timestamp {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn parse(raw: &str) -> Result<DateTime<Utc>, String> {
        super::parse_timestamp(raw).map(|ts| ts.with_timezone(&Utc))
    }

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(de::Error::custom)
    }

    /// Nullable timestamp column.
    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{de, Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            ts: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match ts {
                Some(t) => super::serialize(t, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|raw| super::parse(&raw).map_err(de::Error::custom))
                .transpose()
        }
    }
}
