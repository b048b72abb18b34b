use chrono::{DateTime, NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::Regex;

static DATE_SHAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d{1,4}[-/.]\d{1,2}[-/.]\d{1,4}").expect("date shape pattern is valid")
});

const DATETIME_FORMATS: [&str; 6] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
];

const DATE_FORMATS: [&str; 7] = [
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%d/%m/%Y",
    "%m/%d/%Y",
    "%d-%m-%Y",
    "%d.%m.%Y",
    "%Y.%m.%d",
];

pub fn is_date_string(s: &str) -> bool {
    parse_datetime(s).is_some()
}

pub fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    if !DATE_SHAPE.is_match(s) {
        return None;
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(s, format).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|format| NaiveDate::parse_from_str(s, format).ok())
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

pub fn parse_integer(s: &str) -> Option<i64> {
    s.trim().parse::<i64>().ok()
}

pub fn parse_float(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    s.parse::<f64>().ok()
}

/// Result of trying to reinterpret a text column.
#[derive(Debug, Clone, PartialEq)]
pub enum Coerced {
    Integer(Vec<Option<i64>>),
    Float(Vec<Option<f64>>),
    /// Milliseconds since the Unix epoch.
    Datetime(Vec<Option<i64>>),
    Unchanged,
}

fn parse_all<T, F>(values: &[Option<String>], parse: F) -> Option<Vec<Option<T>>>
where
    F: Fn(&str) -> Option<T>,
{
    values
        .iter()
        .map(|v| match v {
            Some(s) => parse(s).map(Some),
            None => Some(None),
        })
        .collect()
}

/// Numeric first, then datetime. A column only converts when every present
/// value parses under the same rule.
pub fn coerce_text(values: &[Option<String>]) -> Coerced {
    if values.iter().all(Option::is_none) {
        return Coerced::Unchanged;
    }
    if let Some(ints) = parse_all(values, parse_integer) {
        return Coerced::Integer(ints);
    }
    if let Some(floats) = parse_all(values, parse_float) {
        return Coerced::Float(floats);
    }
    if let Some(dates) = parse_all(values, |s| {
        parse_datetime(s).map(|dt| dt.and_utc().timestamp_millis())
    }) {
        return Coerced::Datetime(dates);
    }
    Coerced::Unchanged
}
