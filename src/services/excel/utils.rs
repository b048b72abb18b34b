use std::collections::HashSet;
use calamine::Data;

/// Excel's 1900 date system puts the Unix epoch at serial day 25569.
const EXCEL_UNIX_EPOCH_SERIAL: f64 = 25_569.0;
const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// Header text for a column, with blanks filled in and repeats suffixed
/// `.1`, `.2`, ...
pub fn header_name(cell: Option<&Data>, index: usize, existing_names: &mut HashSet<String>) -> String {
    let raw = cell.map(cell_text).unwrap_or_default();
    let base_name = if raw.trim().is_empty() {
        format!("Unnamed: {}", index)
    } else {
        raw.trim().to_string()
    };

    let mut name = base_name.clone();
    let mut counter = 1;
    while !existing_names.insert(name.clone()) {
        name = format!("{}.{}", base_name, counter);
        counter += 1;
    }
    name
}

pub fn is_missing(cell: &Data) -> bool {
    match cell {
        Data::Empty | Data::Error(_) => true,
        Data::String(s) => s.is_empty(),
        _ => false,
    }
}

pub fn serial_to_epoch_millis(serial: f64) -> i64 {
    ((serial - EXCEL_UNIX_EPOCH_SERIAL) * MILLIS_PER_DAY).round() as i64
}

pub fn cell_text(cell: &Data) -> String {
    match cell {
        Data::String(s) => s.clone(),
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
        Data::DateTime(d) => crate::services::frame::datetime_from(
            serial_to_epoch_millis(d.as_f64()),
            polars::prelude::TimeUnit::Milliseconds,
        )
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| d.as_f64().to_string()),
        other => other.to_string(),
    }
}
