//! Payload parsing for field updates.
//!
//! Meters publish a single value per message as UTF-8 text. Surrounding
//! whitespace is ignored; everything else must parse cleanly for the field's
//! kind or the update is rejected.

use chrono::{DateTime, NaiveDateTime, Utc};
use thiserror::Error;

use super::{FieldKind, FieldValue};

/// Naive layouts accepted for timestamps without an offset. Interpreted as UTC.
const NAIVE_TIMESTAMP_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Errors that can occur while parsing a payload.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("payload is not valid UTF-8")]
    NotUtf8,

    #[error("payload is empty")]
    Empty,

    #[error("invalid float: {raw:?}")]
    InvalidFloat { raw: String },

    #[error("non-finite float: {raw:?}")]
    NonFinite { raw: String },

    #[error("invalid integer: {raw:?}")]
    InvalidInteger { raw: String },

    #[error("invalid boolean: {raw:?}")]
    InvalidBoolean { raw: String },

    #[error("invalid timestamp: {raw:?}")]
    InvalidTimestamp { raw: String },
}

/// Parse a raw payload into a value of the given kind.
pub fn parse_value(kind: FieldKind, payload: &[u8]) -> Result<FieldValue, ParseError> {
    let text = std::str::from_utf8(payload).map_err(|_| ParseError::NotUtf8)?;
    let text = text.trim();
    if text.is_empty() {
        return Err(ParseError::Empty);
    }

    match kind {
        FieldKind::Float => parse_float(text).map(FieldValue::Float),
        FieldKind::Integer => parse_integer(text).map(FieldValue::Integer),
        FieldKind::Boolean => parse_boolean(text).map(FieldValue::Boolean),
        FieldKind::Timestamp => parse_timestamp(text).map(FieldValue::Timestamp),
    }
}

fn parse_float(text: &str) -> Result<f64, ParseError> {
    let value: f64 = text.parse().map_err(|_| ParseError::InvalidFloat {
        raw: text.to_string(),
    })?;
    if !value.is_finite() {
        return Err(ParseError::NonFinite {
            raw: text.to_string(),
        });
    }
    Ok(value)
}

fn parse_integer(text: &str) -> Result<i64, ParseError> {
    text.parse().map_err(|_| ParseError::InvalidInteger {
        raw: text.to_string(),
    })
}

fn parse_boolean(text: &str) -> Result<bool, ParseError> {
    if text.eq_ignore_ascii_case("true") || text == "1" {
        Ok(true)
    } else if text.eq_ignore_ascii_case("false") || text == "0" {
        Ok(false)
    } else {
        Err(ParseError::InvalidBoolean {
            raw: text.to_string(),
        })
    }
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, ParseError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.with_timezone(&Utc));
    }

    NAIVE_TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| ParseError::InvalidTimestamp {
            raw: text.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_parse_float() {
        assert_eq!(
            parse_value(FieldKind::Float, b"1.234"),
            Ok(FieldValue::Float(1.234))
        );
        assert_eq!(
            parse_value(FieldKind::Float, b" 230.1\n"),
            Ok(FieldValue::Float(230.1))
        );
        assert_eq!(
            parse_value(FieldKind::Float, b"-0.5"),
            Ok(FieldValue::Float(-0.5))
        );
        assert_eq!(parse_value(FieldKind::Float, b"7"), Ok(FieldValue::Float(7.0)));
    }

    #[test]
    fn test_parse_float_rejects_garbage() {
        assert_eq!(
            parse_value(FieldKind::Float, b"1,5"),
            Err(ParseError::InvalidFloat {
                raw: "1,5".to_string()
            })
        );
        assert_eq!(
            parse_value(FieldKind::Float, b"NaN"),
            Err(ParseError::NonFinite {
                raw: "NaN".to_string()
            })
        );
        assert!(matches!(
            parse_value(FieldKind::Float, b"inf"),
            Err(ParseError::NonFinite { .. })
        ));
    }

    #[test]
    fn test_parse_empty_and_non_utf8() {
        assert_eq!(parse_value(FieldKind::Float, b""), Err(ParseError::Empty));
        assert_eq!(parse_value(FieldKind::Float, b"   "), Err(ParseError::Empty));
        assert_eq!(
            parse_value(FieldKind::Float, &[0xff, 0xfe]),
            Err(ParseError::NotUtf8)
        );
    }

    #[test]
    fn test_parse_integer() {
        assert_eq!(
            parse_value(FieldKind::Integer, b"-67"),
            Ok(FieldValue::Integer(-67))
        );
        assert!(matches!(
            parse_value(FieldKind::Integer, b"-67.5"),
            Err(ParseError::InvalidInteger { .. })
        ));
    }

    #[test]
    fn test_parse_boolean() {
        assert_eq!(
            parse_value(FieldKind::Boolean, b"True"),
            Ok(FieldValue::Boolean(true))
        );
        assert_eq!(
            parse_value(FieldKind::Boolean, b"false"),
            Ok(FieldValue::Boolean(false))
        );
        assert_eq!(
            parse_value(FieldKind::Boolean, b"1"),
            Ok(FieldValue::Boolean(true))
        );
        assert!(matches!(
            parse_value(FieldKind::Boolean, b"yes"),
            Err(ParseError::InvalidBoolean { .. })
        ));
    }

    #[test]
    fn test_parse_timestamp_variants() {
        let expected = Utc.with_ymd_and_hms(2024, 11, 3, 14, 5, 9).unwrap();

        assert_eq!(
            parse_value(FieldKind::Timestamp, b"2024-11-03T15:05:09+01:00"),
            Ok(FieldValue::Timestamp(expected))
        );
        assert_eq!(
            parse_value(FieldKind::Timestamp, b"2024-11-03 14:05:09"),
            Ok(FieldValue::Timestamp(expected))
        );
        assert_eq!(
            parse_value(FieldKind::Timestamp, b"2024-11-03T14:05:09"),
            Ok(FieldValue::Timestamp(expected))
        );
        assert!(matches!(
            parse_value(FieldKind::Timestamp, b"yesterday"),
            Err(ParseError::InvalidTimestamp { .. })
        ));
    }

    #[test]
    fn test_value_kind_matches_parser() {
        for (kind, raw) in [
            (FieldKind::Float, "1.0"),
            (FieldKind::Integer, "1"),
            (FieldKind::Boolean, "true"),
            (FieldKind::Timestamp, "2024-01-01T00:00:00Z"),
        ] {
            let value = parse_value(kind, raw.as_bytes()).expect("parses");
            assert_eq!(value.kind(), kind);
        }
    }
}
