//! Runtime values, typed parsing, and sentinel handling.
//!
//! This module owns the [`Value`] enum (one variant per storable domain),
//! the multi-format date/datetime parsers, the suppression-marker table the
//! survey uses for withheld estimates, and the conversion from raw sheet
//! cells into target-domain values.

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use heck::ToSnakeCase;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use serde::{Deserialize, Serialize};

use crate::{domain::ValueDomain, workbook::CellValue};

/// Suppression markers the survey publishes instead of withheld or
/// unreliable estimates. Distinct from a true null: the marker is data in a
/// textual column and becomes null only in non-textual targets.
pub const SENTINEL_TOKENS: &[&str] = &["#", "*", "**", "n/a", "na", "~"];

pub fn is_sentinel(value: &str) -> bool {
    let trimmed = value.trim();
    !trimmed.is_empty()
        && SENTINEL_TOKENS
            .iter()
            .any(|token| trimmed.eq_ignore_ascii_case(token))
}

const TRUE_TOKENS: &[&str] = &["true", "t", "yes", "y"];
const FALSE_TOKENS: &[&str] = &["false", "f", "no", "n"];

/// Strict boolean vocabulary used during classification. `1`/`0` are
/// deliberately absent so numeric columns never classify as boolean.
pub fn is_boolean_token(value: &str) -> bool {
    let lowered = value.trim().to_ascii_lowercase();
    TRUE_TOKENS.contains(&lowered.as_str()) || FALSE_TOKENS.contains(&lowered.as_str())
}

pub fn parse_boolean(value: &str) -> Option<bool> {
    let lowered = value.trim().to_ascii_lowercase();
    if TRUE_TOKENS.contains(&lowered.as_str()) || lowered == "1" {
        Some(true)
    } else if FALSE_TOKENS.contains(&lowered.as_str()) || lowered == "0" {
        Some(false)
    } else {
        None
    }
}

pub fn parse_naive_date(value: &str) -> Option<NaiveDate> {
    const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%d/%m/%Y", "%Y/%m/%d", "%d-%m-%Y"];
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(value.trim(), fmt).ok())
}

pub fn parse_naive_datetime(value: &str) -> Option<NaiveDateTime> {
    const DATETIME_FORMATS: &[&str] = &[
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%m/%d/%Y %H:%M:%S",
        "%d/%m/%Y %H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
    ];
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value.trim(), fmt).ok())
}

/// Lowercase snake_case form used for target column names.
pub fn normalize_column_name(name: &str) -> String {
    let normalized = name.trim().to_snake_case();
    if normalized.is_empty() {
        "column".to_string()
    } else {
        normalized
    }
}

/// A fully converted value ready for the destination store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Integer(i64),
    Decimal(Decimal),
    Text(String),
    Boolean(bool),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
}

impl Value {
    /// Canonical string form: stable across write/read round trips, used by
    /// key building and source-vs-target comparison.
    pub fn canonical(&self) -> String {
        match self {
            Value::Integer(i) => i.to_string(),
            Value::Decimal(d) => d.normalize().to_string(),
            Value::Text(s) => s.clone(),
            Value::Boolean(b) => b.to_string(),
            Value::Date(d) => d.format("%Y-%m-%d").to_string(),
            Value::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }

    pub fn domain(&self) -> ValueDomain {
        match self {
            Value::Integer(_) => ValueDomain::Integer,
            Value::Decimal(_) => ValueDomain::Decimal,
            Value::Text(_) => ValueDomain::Text,
            Value::Boolean(_) => ValueDomain::Boolean,
            Value::Date(_) => ValueDomain::Date,
            Value::DateTime(_) => ValueDomain::DateTime,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

/// Converts one raw cell into the target domain.
///
/// `Ok(None)` is a true null (empty cell, or a sentinel aimed at a
/// non-textual column). `Err` carries a record-level message; the caller
/// decides whether that skips the record or fails the chunk.
pub fn convert_cell(
    cell: &CellValue,
    domain: ValueDomain,
) -> std::result::Result<Option<Value>, String> {
    match cell {
        CellValue::Empty => Ok(None),
        CellValue::Text(raw) => convert_text(raw, domain),
        CellValue::Int(i) => match domain {
            ValueDomain::Integer => Ok(Some(Value::Integer(*i))),
            ValueDomain::Decimal => Ok(Some(Value::Decimal(Decimal::from(*i)))),
            ValueDomain::Text | ValueDomain::LongText => Ok(Some(Value::Text(i.to_string()))),
            other => Err(format!("Cannot convert numeric '{i}' to {other}")),
        },
        CellValue::Float(f) => match domain {
            ValueDomain::Integer => {
                if f.fract() == 0.0 && f.abs() < 9.2e18 {
                    Ok(Some(Value::Integer(*f as i64)))
                } else {
                    Err(format!("Value '{f}' is not integral"))
                }
            }
            ValueDomain::Decimal => Decimal::from_f64(*f)
                .map(|decimal| Some(Value::Decimal(decimal)))
                .ok_or_else(|| format!("Value '{f}' is not representable as decimal")),
            ValueDomain::Text | ValueDomain::LongText => {
                Ok(Some(Value::Text(CellValue::Float(*f).display())))
            }
            other => Err(format!("Cannot convert numeric '{f}' to {other}")),
        },
        CellValue::Bool(b) => match domain {
            ValueDomain::Boolean => Ok(Some(Value::Boolean(*b))),
            ValueDomain::Text | ValueDomain::LongText => Ok(Some(Value::Text(b.to_string()))),
            other => Err(format!("Cannot convert boolean '{b}' to {other}")),
        },
        CellValue::DateTime(dt) => match domain {
            ValueDomain::Date => Ok(Some(Value::Date(dt.date()))),
            ValueDomain::DateTime => Ok(Some(Value::DateTime(*dt))),
            ValueDomain::Text | ValueDomain::LongText => {
                Ok(Some(Value::Text(CellValue::DateTime(*dt).display())))
            }
            other => Err(format!("Cannot convert datetime to {other}")),
        },
    }
}

fn convert_text(raw: &str, domain: ValueDomain) -> std::result::Result<Option<Value>, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if is_sentinel(trimmed) {
        // Suppression markers survive verbatim in textual columns and
        // become null everywhere else.
        return if domain.is_textual() {
            Ok(Some(Value::Text(trimmed.to_string())))
        } else {
            Ok(None)
        };
    }
    match domain {
        ValueDomain::Text | ValueDomain::LongText => Ok(Some(Value::Text(trimmed.to_string()))),
        ValueDomain::Integer => trimmed
            .parse::<i64>()
            .map(|parsed| Some(Value::Integer(parsed)))
            .map_err(|_| format!("Failed to parse '{trimmed}' as integer")),
        ValueDomain::Decimal => trimmed
            .parse::<Decimal>()
            .map(|parsed| Some(Value::Decimal(parsed)))
            .map_err(|_| format!("Failed to parse '{trimmed}' as decimal")),
        ValueDomain::Boolean => parse_boolean(trimmed)
            .map(|parsed| Some(Value::Boolean(parsed)))
            .ok_or_else(|| format!("Failed to parse '{trimmed}' as boolean")),
        ValueDomain::Date => parse_naive_date(trimmed)
            .map(|parsed| Some(Value::Date(parsed)))
            .ok_or_else(|| format!("Failed to parse '{trimmed}' as date")),
        ValueDomain::DateTime => parse_naive_datetime(trimmed)
            .map(Value::DateTime)
            .or_else(|| {
                parse_naive_date(trimmed)
                    .and_then(|date| date.and_hms_opt(0, 0, 0))
                    .map(Value::DateTime)
            })
            .map(Some)
            .ok_or_else(|| format!("Failed to parse '{trimmed}' as datetime")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_detection_is_case_insensitive() {
        assert!(is_sentinel("#"));
        assert!(is_sentinel("  ** "));
        assert!(is_sentinel("N/A"));
        assert!(!is_sentinel("35"));
        assert!(!is_sentinel(""));
    }

    #[test]
    fn normalize_column_name_snake_cases_survey_headers() {
        assert_eq!(normalize_column_name("OCC_CODE"), "occ_code");
        assert_eq!(normalize_column_name("Area Name"), "area_name");
        assert_eq!(normalize_column_name("  "), "column");
    }

    #[test]
    fn parse_naive_date_supports_survey_formats() {
        let expected = NaiveDate::from_ymd_opt(2019, 5, 14).unwrap();
        assert_eq!(parse_naive_date("2019-05-14"), Some(expected));
        assert_eq!(parse_naive_date("05/14/2019"), Some(expected));
        assert_eq!(parse_naive_date("not a date"), None);
    }

    #[test]
    fn convert_text_maps_sentinels_by_target_domain() {
        assert_eq!(
            convert_cell(&CellValue::Text("#".into()), ValueDomain::Integer),
            Ok(None)
        );
        assert_eq!(
            convert_cell(&CellValue::Text("#".into()), ValueDomain::Text),
            Ok(Some(Value::Text("#".to_string())))
        );
    }

    #[test]
    fn convert_widens_integers_into_decimal_targets() {
        assert_eq!(
            convert_cell(&CellValue::Int(120), ValueDomain::Decimal),
            Ok(Some(Value::Decimal(Decimal::from(120))))
        );
        assert_eq!(
            convert_cell(&CellValue::Text("17.85".into()), ValueDomain::Decimal),
            Ok(Some(Value::Decimal("17.85".parse().unwrap())))
        );
    }

    #[test]
    fn convert_rejects_untypable_records() {
        assert!(convert_cell(&CellValue::Text("abc".into()), ValueDomain::Integer).is_err());
        assert!(convert_cell(&CellValue::Bool(true), ValueDomain::Date).is_err());
    }

    #[test]
    fn date_values_fit_datetime_targets() {
        let converted = convert_cell(&CellValue::Text("2019-05-14".into()), ValueDomain::DateTime)
            .unwrap()
            .unwrap();
        assert_eq!(converted.canonical(), "2019-05-14 00:00:00");
    }

    #[test]
    fn canonical_decimal_drops_trailing_zeros() {
        let value = Value::Decimal("3.50".parse().unwrap());
        assert_eq!(value.canonical(), "3.5");
    }
}
