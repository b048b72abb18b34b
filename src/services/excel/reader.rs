use super::types::SheetSelection;
use super::utils::*;
use std::io::Cursor;
use calamine::{open_workbook_auto_from_rs, Data, Reader, Sheets};
use std::collections::HashSet;
use crate::error::{AppError, Result};
use polars::prelude::*;
use tracing::{debug, info};

static EMPTY_CELL: Data = Data::Empty;

fn open_workbook(bytes: &[u8]) -> Result<Sheets<Cursor<Vec<u8>>>> {
    open_workbook_auto_from_rs(Cursor::new(bytes.to_vec())).map_err(|e| {
        tracing::error!("Failed to open workbook: {}", e);
        AppError::Load(format!("Failed to open workbook: {}", e))
    })
}

pub fn sheet_names(bytes: &[u8]) -> Result<Vec<String>> {
    let workbook = open_workbook(bytes)?;
    Ok(workbook.sheet_names().to_vec())
}

fn resolve_sheet(names: &[String], selection: Option<&SheetSelection>) -> Result<String> {
    match selection {
        Some(SheetSelection::Index(index)) => names.get(*index).cloned().ok_or_else(|| {
            AppError::Load(format!(
                "Sheet index {} out of range; workbook has {} sheets",
                index,
                names.len()
            ))
        }),
        Some(SheetSelection::Name(name)) => names
            .iter()
            .find(|candidate| *candidate == name)
            .cloned()
            .ok_or_else(|| AppError::Load(format!("Sheet '{}' not found in workbook", name))),
        None => match names {
            [] => Err(AppError::Load("Workbook contains no sheets".to_string())),
            [only] => Ok(only.clone()),
            _ => Err(AppError::Load(format!(
                "Workbook has {} sheets ({}); select one by name or index",
                names.len(),
                names.join(", ")
            ))),
        },
    }
}

/// Reads exactly one worksheet; the first row is the header.
pub fn read_sheet(bytes: &[u8], selection: Option<&SheetSelection>) -> Result<DataFrame> {
    let mut workbook = open_workbook(bytes)?;
    let names = workbook.sheet_names().to_vec();
    let sheet_name = resolve_sheet(&names, selection)?;
    info!("Reading sheet {} of {}", sheet_name, names.len());

    let range = workbook.worksheet_range(&sheet_name)?;
    let rows: Vec<&[Data]> = range.rows().collect();
    let Some(header_row) = rows.first() else {
        return Err(AppError::Load(format!("Sheet '{}' is empty", sheet_name)));
    };

    let width = range.width();
    let mut existing_names = HashSet::new();
    let mut columns = Vec::with_capacity(width);
    for col_idx in 0..width {
        let name = header_name(header_row.get(col_idx), col_idx, &mut existing_names);
        let cells: Vec<&Data> = rows
            .iter()
            .skip(1)
            .map(|row| row.get(col_idx).unwrap_or(&EMPTY_CELL))
            .collect();
        columns.push(build_column(&name, &cells)?);
    }
    debug!("Sheet {} parsed into {} columns x {} rows", sheet_name, width, rows.len().saturating_sub(1));

    Ok(DataFrame::new(columns)?)
}

/// Uniform columns keep their cell type; anything mixed becomes text.
fn build_column(name: &str, cells: &[&Data]) -> Result<Series> {
    let present: Vec<&Data> = cells.iter().copied().filter(|c| !is_missing(c)).collect();

    if present.is_empty() {
        let nulls: Vec<Option<String>> = vec![None; cells.len()];
        return Ok(Series::new(name, nulls));
    }

    let all_numeric = present.iter().all(|c| matches!(c, Data::Int(_) | Data::Float(_)));
    if all_numeric {
        let all_integral = present.iter().all(|c| match c {
            Data::Int(_) => true,
            Data::Float(f) => f.fract() == 0.0 && f.abs() < 9.0e15,
            _ => false,
        });
        if all_integral {
            let values: Vec<Option<i64>> = cells
                .iter()
                .map(|c| match c {
                    Data::Int(i) => Some(*i),
                    Data::Float(f) => Some(*f as i64),
                    _ => None,
                })
                .collect();
            return Ok(Series::new(name, values));
        }
        let values: Vec<Option<f64>> = cells
            .iter()
            .map(|c| match c {
                Data::Int(i) => Some(*i as f64),
                Data::Float(f) => Some(*f),
                _ => None,
            })
            .collect();
        return Ok(Series::new(name, values));
    }

    if present.iter().all(|c| matches!(c, Data::DateTime(_))) {
        let values: Vec<Option<i64>> = cells
            .iter()
            .map(|c| match c {
                Data::DateTime(d) => Some(serial_to_epoch_millis(d.as_f64())),
                _ => None,
            })
            .collect();
        return Ok(Series::new(name, values)
            .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))?);
    }

    if present.iter().all(|c| matches!(c, Data::Bool(_))) {
        let values: Vec<Option<bool>> = cells
            .iter()
            .map(|c| match c {
                Data::Bool(b) => Some(*b),
                _ => None,
            })
            .collect();
        return Ok(Series::new(name, values));
    }

    let values: Vec<Option<String>> = cells
        .iter()
        .map(|c| if is_missing(c) { None } else { Some(cell_text(c)) })
        .collect();
    Ok(Series::new(name, values))
}
