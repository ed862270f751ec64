use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One raw record as it arrives from a source, before key normalization.
///
/// CSV rows are converted to the same shape with every value a JSON
/// string; JSON API records keep their nesting (notably `line_items`).
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Csv,
    Json,
}

impl DataSource {
    pub fn as_str(self) -> &'static str {
        match self {
            DataSource::Csv => "csv",
            DataSource::Json => "json",
        }
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed storage value. Business keys are always carried as `Text`:
/// upstream IDs run to 19 digits and must never round-trip through a
/// float or get truncated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarValue {
    Null,
    Text(String),
    Integer(i64),
    Decimal(Decimal),
    Boolean(bool),
}

impl ScalarValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ScalarValue::Null)
    }

    /// The value as a key string, if it has one. Used for business-key
    /// lookups, where `Null` (and non-key types) mean "no key".
    pub fn as_key(&self) -> Option<String> {
        match self {
            ScalarValue::Text(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            ScalarValue::Integer(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Null => f.write_str(""),
            ScalarValue::Text(s) => f.write_str(s),
            ScalarValue::Integer(n) => write!(f, "{n}"),
            ScalarValue::Decimal(d) => write!(f, "{d}"),
            ScalarValue::Boolean(b) => write!(f, "{b}"),
        }
    }
}

/// The normalized, type-coerced representation of one source record,
/// ready for storage. Every row for a given (entity, source) pair
/// carries the identical column set; fields the source did not supply
/// are `Null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRow {
    pub entity: String,
    pub data_source: DataSource,
    pub synced_at: DateTime<Utc>,
    pub values: BTreeMap<String, ScalarValue>,
}

impl CanonicalRow {
    pub fn get(&self, column: &str) -> &ScalarValue {
        self.values.get(column).unwrap_or(&ScalarValue::Null)
    }

    /// The business-key value under the given column name, if present
    /// and non-empty.
    pub fn key_value(&self, key_column: &str) -> Option<String> {
        self.values.get(key_column).and_then(ScalarValue::as_key)
    }
}

/// Parses a date-like string permissively: RFC 3339 with or without a
/// colon in the offset, naive date-times, and bare `YYYY-MM-DD` dates
/// (taken as midnight UTC). Returns `None` for anything else.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // Offsets without a colon ("+0530") are what the upstream API emits.
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%z") {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
    }
    None
}

/// Rewrites a parseable date-like string into its canonical stored form:
/// bare dates stay `YYYY-MM-DD`, anything carrying a time component
/// becomes UTC `YYYY-MM-DDTHH:MM:SSZ`.
pub fn canonicalize_timestamp(raw: &str) -> Option<String> {
    let s = raw.trim();
    if NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok() {
        return Some(s.to_string());
    }
    parse_timestamp(s).map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_timestamp_accepts_rfc3339() {
        let dt = parse_timestamp("2024-01-15T10:30:00+05:30").unwrap();
        assert_eq!(dt.to_rfc3339(), "2024-01-15T05:00:00+00:00");
    }

    #[test]
    fn parse_timestamp_accepts_offset_without_colon() {
        let dt = parse_timestamp("2024-01-15T10:30:00+0530").unwrap();
        assert_eq!(dt.to_rfc3339(), "2024-01-15T05:00:00+00:00");
    }

    #[test]
    fn parse_timestamp_accepts_bare_date_as_midnight_utc() {
        let dt = parse_timestamp("2024-06-01").unwrap();
        assert_eq!(dt.to_rfc3339(), "2024-06-01T00:00:00+00:00");
    }

    #[test]
    fn parse_timestamp_rejects_garbage() {
        assert!(parse_timestamp("").is_none());
        assert!(parse_timestamp("15/01/2024").is_none());
        assert!(parse_timestamp("soon").is_none());
    }

    #[test]
    fn canonicalize_keeps_bare_dates() {
        assert_eq!(canonicalize_timestamp("2024-06-01").as_deref(), Some("2024-06-01"));
    }

    #[test]
    fn canonicalize_rewrites_offsets_to_utc() {
        assert_eq!(
            canonicalize_timestamp("2024-01-15T10:30:00+0530").as_deref(),
            Some("2024-01-15T05:00:00Z")
        );
    }

    #[test]
    fn as_key_trims_and_rejects_empty() {
        assert_eq!(
            ScalarValue::Text(" INV-001 ".into()).as_key().as_deref(),
            Some("INV-001")
        );
        assert_eq!(ScalarValue::Text("   ".into()).as_key(), None);
        assert_eq!(ScalarValue::Null.as_key(), None);
        assert_eq!(ScalarValue::Integer(42).as_key().as_deref(), Some("42"));
    }

    #[test]
    fn nineteen_digit_key_survives_as_text() {
        let v = ScalarValue::Text("3990265000000897001".into());
        assert_eq!(v.as_key().as_deref(), Some("3990265000000897001"));
        assert_eq!(v.to_string(), "3990265000000897001");
    }
}
