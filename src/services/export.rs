use chrono::NaiveDateTime;
use polars::prelude::*;
use rust_xlsxwriter::Workbook;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use std::str::FromStr;
use tracing::info;

use crate::error::{AppError, Result};
use crate::models::ColumnKind;
use crate::services::frame::{column_json, column_kind, numeric_values, require_column, text_values};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";
const SHEET_NAME: &str = "Data";
const EXCEL_MAX_ROWS: usize = 1_048_576;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Excel,
    Json,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Excel => "xlsx",
            ExportFormat::Json => "json",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv; charset=utf-8",
            ExportFormat::Excel => {
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            }
            ExportFormat::Json => "application/json",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "excel" | "xlsx" => Ok(ExportFormat::Excel),
            "json" => Ok(ExportFormat::Json),
            other => Err(AppError::invalid(
                "format",
                format!("unknown export format '{}', expected csv, excel or json", other),
            )),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    /// Half-open row range, clamped to the table.
    pub rows: Option<(usize, usize)>,
    pub columns: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct ExportFile {
    pub file_name: String,
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

pub fn file_name(format: ExportFormat, at: NaiveDateTime) -> String {
    format!("data_export_{}.{}", at.format("%Y%m%d_%H%M%S"), format.extension())
}

pub fn subset(df: &DataFrame, options: &ExportOptions) -> Result<DataFrame> {
    let mut out = match &options.columns {
        Some(columns) => {
            for name in columns {
                require_column(df, "columns", name)?;
            }
            df.select(columns)?
        }
        None => df.clone(),
    };
    if let Some((start, end)) = options.rows {
        let start = start.min(out.height());
        let end = end.clamp(start, out.height());
        out = out.slice(start as i64, end - start);
    }
    Ok(out)
}

pub fn export(df: &DataFrame, format: ExportFormat, options: &ExportOptions) -> Result<ExportFile> {
    let table = subset(df, options)?;
    let bytes = match format {
        ExportFormat::Csv => to_csv(&table)?,
        ExportFormat::Excel => to_excel(&table)?,
        ExportFormat::Json => to_json(&table)?,
    };
    info!(
        "Exported {} rows x {} columns as {:?} ({} bytes)",
        table.height(),
        table.width(),
        format,
        bytes.len()
    );
    Ok(ExportFile {
        file_name: file_name(format, chrono::Local::now().naive_local()),
        content_type: format.content_type(),
        bytes,
    })
}

/// UTF-8 with a byte-order mark so spreadsheet tools pick the right encoding.
pub fn to_csv(df: &DataFrame) -> Result<Vec<u8>> {
    let mut buf = UTF8_BOM.to_vec();
    let mut table = df.clone();
    CsvWriter::new(&mut buf)
        .with_separator(b',')
        .finish(&mut table)
        .map_err(|e| AppError::Export(format!("Failed to write CSV: {}", e)))?;
    Ok(buf)
}

pub fn to_excel(df: &DataFrame) -> Result<Vec<u8>> {
    if df.height() + 1 > EXCEL_MAX_ROWS {
        return Err(AppError::Export(format!(
            "{} rows exceed the worksheet limit of {}",
            df.height(),
            EXCEL_MAX_ROWS - 1
        )));
    }

    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    worksheet.set_name(SHEET_NAME)?;

    for (col, series) in df.get_columns().iter().enumerate() {
        let col = u16::try_from(col)
            .map_err(|_| AppError::Export("too many columns for a worksheet".to_string()))?;
        worksheet.write_string(0, col, series.name())?;

        match column_kind(series) {
            ColumnKind::Numeric => {
                for (row, value) in numeric_values(series)?.into_iter().enumerate() {
                    if let Some(v) = value {
                        worksheet.write_number(row as u32 + 1, col, v)?;
                    }
                }
            }
            ColumnKind::Boolean => {
                for (row, value) in series.bool()?.into_iter().enumerate() {
                    if let Some(v) = value {
                        worksheet.write_boolean(row as u32 + 1, col, v)?;
                    }
                }
            }
            _ => {
                for (row, value) in text_values(series)?.into_iter().enumerate() {
                    if let Some(v) = value {
                        worksheet.write_string(row as u32 + 1, col, v)?;
                    }
                }
            }
        }
    }

    Ok(workbook.save_to_buffer()?)
}

/// Pretty-printed array of row objects.
pub fn to_json(df: &DataFrame) -> Result<Vec<u8>> {
    let columns = df
        .get_columns()
        .iter()
        .map(|series| Ok((series.name().to_string(), column_json(series)?)))
        .collect::<Result<Vec<_>>>()?;

    let records: Vec<JsonValue> = (0..df.height())
        .map(|row| {
            let record: Map<String, JsonValue> = columns
                .iter()
                .map(|(name, values)| (name.clone(), values[row].clone()))
                .collect();
            JsonValue::Object(record)
        })
        .collect();

    Ok(serde_json::to_vec_pretty(&records)?)
}
