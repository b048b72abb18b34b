//! Cell-level access to polars frames shared by the loader, processor,
//! profiler, exporter and chart builder.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use polars::prelude::*;
use serde_json::Value as JsonValue;
use std::collections::HashSet;

use crate::error::{AppError, Result};
use crate::models::ColumnKind;
use crate::services::stats::round2;

/// Days from 0001-01-01 (CE) to 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

pub fn column_kind(series: &Series) -> ColumnKind {
    ColumnKind::of(series.dtype())
}

pub fn is_float(series: &Series) -> bool {
    matches!(series.dtype(), DataType::Float32 | DataType::Float64)
}

/// Numeric view of a column; NaN counts as missing.
pub fn numeric_values(series: &Series) -> Result<Vec<Option<f64>>> {
    let cast = series.cast(&DataType::Float64)?;
    let ca = cast.f64()?;
    Ok(ca.into_iter().map(|v| v.filter(|x| !x.is_nan())).collect())
}

pub fn present(values: &[Option<f64>]) -> Vec<f64> {
    values.iter().flatten().copied().collect()
}

/// Text view of a column.
pub fn text_values(series: &Series) -> Result<Vec<Option<String>>> {
    let cast = series.cast(&DataType::String)?;
    let ca = cast.str()?;
    Ok(ca.into_iter().map(|v| v.map(str::to_string)).collect())
}

pub fn missing_mask(series: &Series) -> Result<Vec<bool>> {
    if is_float(series) {
        return Ok(numeric_values(series)?.iter().map(Option::is_none).collect());
    }
    let nulls = series.is_null();
    Ok(nulls.into_iter().map(|v| v.unwrap_or(true)).collect())
}

pub fn missing_count(series: &Series) -> Result<usize> {
    if is_float(series) {
        return Ok(missing_mask(series)?.into_iter().filter(|m| *m).count());
    }
    Ok(series.null_count())
}

/// Comparable per-cell keys; missing cells map to `None`.
pub fn cell_keys(series: &Series) -> Result<Vec<Option<String>>> {
    let mut keys = text_values(series)?;
    if is_float(series) {
        for (key, missing) in keys.iter_mut().zip(missing_mask(series)?) {
            if missing {
                *key = None;
            }
        }
    }
    Ok(keys)
}

pub fn unique_count(series: &Series) -> Result<usize> {
    let keys = cell_keys(series)?;
    Ok(keys.iter().flatten().collect::<HashSet<_>>().len())
}

fn row_keys(df: &DataFrame, columns: &[&str]) -> Result<Vec<Vec<Option<String>>>> {
    let mut keys = vec![Vec::with_capacity(columns.len()); df.height()];
    for name in columns {
        let cells = cell_keys(df.column(name)?)?;
        for (key, cell) in keys.iter_mut().zip(cells) {
            key.push(cell);
        }
    }
    Ok(keys)
}

/// `true` for every row that repeats an earlier row over `columns`.
pub fn duplicate_mask(df: &DataFrame, columns: &[&str]) -> Result<Vec<bool>> {
    let mut seen = HashSet::with_capacity(df.height());
    Ok(row_keys(df, columns)?
        .into_iter()
        .map(|key| !seen.insert(key))
        .collect())
}

pub fn duplicate_row_count(df: &DataFrame) -> Result<usize> {
    let columns = df.get_column_names();
    Ok(duplicate_mask(df, &columns)?.into_iter().filter(|d| *d).count())
}

pub fn filter_rows(df: &DataFrame, keep: &[bool]) -> Result<DataFrame> {
    if keep.len() != df.height() {
        return Err(AppError::Internal(format!(
            "row mask has {} entries for {} rows",
            keep.len(),
            df.height()
        )));
    }
    let mask = BooleanChunked::from_slice("keep", keep);
    Ok(df.filter(&mask)?)
}

pub fn numeric_column_names(df: &DataFrame) -> Vec<String> {
    df.get_columns()
        .iter()
        .filter(|s| column_kind(s) == ColumnKind::Numeric)
        .map(|s| s.name().to_string())
        .collect()
}

pub fn memory_usage_mb(df: &DataFrame) -> f64 {
    round2(df.estimated_size() as f64 / 1024.0 / 1024.0)
}

pub fn require_column<'a>(df: &'a DataFrame, parameter: &str, name: &str) -> Result<&'a Series> {
    df.column(name)
        .map_err(|_| AppError::invalid(parameter, format!("column '{}' not found", name)))
}

pub fn datetime_from(value: i64, unit: TimeUnit) -> Option<NaiveDateTime> {
    let (secs, nanos) = match unit {
        TimeUnit::Nanoseconds => (value.div_euclid(1_000_000_000), value.rem_euclid(1_000_000_000)),
        TimeUnit::Microseconds => (value.div_euclid(1_000_000), value.rem_euclid(1_000_000) * 1_000),
        TimeUnit::Milliseconds => (value.div_euclid(1_000), value.rem_euclid(1_000) * 1_000_000),
    };
    DateTime::from_timestamp(secs, nanos as u32).map(|dt| dt.naive_utc())
}

pub fn date_from(days: i32) -> Option<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(days + UNIX_EPOCH_DAYS_FROM_CE)
}

fn float_json(value: f64) -> JsonValue {
    serde_json::Number::from_f64(value)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}

pub fn any_to_json(value: AnyValue) -> JsonValue {
    match value {
        AnyValue::Null => JsonValue::Null,
        AnyValue::Boolean(b) => JsonValue::Bool(b),
        AnyValue::String(s) => JsonValue::String(s.to_string()),
        AnyValue::Int32(v) => v.into(),
        AnyValue::Int64(v) => v.into(),
        AnyValue::UInt32(v) => v.into(),
        AnyValue::UInt64(v) => v.into(),
        AnyValue::Float32(v) => float_json(v as f64),
        AnyValue::Float64(v) => float_json(v),
        AnyValue::Date(days) => date_from(days)
            .map(|d| JsonValue::String(d.format("%Y-%m-%d").to_string()))
            .unwrap_or(JsonValue::Null),
        AnyValue::Datetime(v, unit, _) => datetime_from(v, unit)
            .map(|dt| JsonValue::String(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()))
            .unwrap_or(JsonValue::Null),
        other => JsonValue::String(other.to_string()),
    }
}

pub fn column_json(series: &Series) -> Result<Vec<JsonValue>> {
    (0..series.len())
        .map(|i| Ok(any_to_json(series.get(i)?)))
        .collect()
}

/// Up to `limit` rows as JSON arrays, in column order.
pub fn table_rows(df: &DataFrame, limit: usize) -> Result<Vec<Vec<JsonValue>>> {
    let head = df.head(Some(limit));
    let columns = head
        .get_columns()
        .iter()
        .map(column_json)
        .collect::<Result<Vec<_>>>()?;
    Ok((0..head.height())
        .map(|row| columns.iter().map(|col| col[row].clone()).collect())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> DataFrame {
        df!(
            "name" => &[Some("A"), Some("A"), Some("B"), None],
            "value" => &[Some(1.0), Some(1.0), Some(f64::NAN), None]
        )
        .unwrap()
    }

    #[test]
    fn nan_counts_as_missing() {
        let df = frame();
        let value = df.column("value").unwrap();
        assert_eq!(missing_count(value).unwrap(), 2);
        assert_eq!(missing_mask(value).unwrap(), vec![false, false, true, true]);
        assert_eq!(missing_count(df.column("name").unwrap()).unwrap(), 1);
    }

    #[test]
    fn duplicates_keep_first_occurrence() {
        let df = frame();
        assert_eq!(
            duplicate_mask(&df, &["name", "value"]).unwrap(),
            vec![false, true, false, false]
        );
        assert_eq!(duplicate_mask(&df, &["name"]).unwrap(), vec![false, true, false, false]);
        assert_eq!(duplicate_row_count(&df).unwrap(), 1);
    }

    #[test]
    fn row_keys_do_not_merge_across_cells() {
        let df = df!(
            "a" => &[Some("a\u{1f}"), Some("a"), Some("\u{0}"), None],
            "b" => &[Some("b"), Some("\u{1f}b"), Some("x"), Some("x")]
        )
        .unwrap();
        assert_eq!(duplicate_mask(&df, &["a", "b"]).unwrap(), vec![false; 4]);
    }

    #[test]
    fn unique_count_ignores_missing() {
        let df = frame();
        assert_eq!(unique_count(df.column("name").unwrap()).unwrap(), 2);
        assert_eq!(unique_count(df.column("value").unwrap()).unwrap(), 1);
    }

    #[test]
    fn datetime_conversion_handles_units() {
        let dt = datetime_from(1_700_000_000_123, TimeUnit::Milliseconds).unwrap();
        assert_eq!(dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string(), "2023-11-14 22:13:20.123");
        assert_eq!(date_from(0).unwrap().to_string(), "1970-01-01");
    }

    #[test]
    fn rows_render_as_json() {
        let df = frame();
        let rows = table_rows(&df, 2).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0], JsonValue::String("A".into()));
        assert_eq!(rows[0][1], serde_json::json!(1.0));
    }
}
