use encoding_rs::Encoding;
use polars::prelude::*;
use rand::{rngs::StdRng, SeedableRng};
use std::io::Cursor;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::models::{QualityReport, TypeCounts};
use crate::services::detect::{coerce_text, Coerced};
use crate::services::excel::{self, SheetSelection};
use crate::services::frame::{
    column_kind, duplicate_row_count, filter_rows, memory_usage_mb, missing_count, missing_mask,
    text_values,
};

/// Separators tried in priority order when probing delimited text.
pub const DELIMITERS: [u8; 4] = [b',', b';', b'\t', b'|'];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Delimited,
    Spreadsheet,
}

impl FileFormat {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "csv" | "tsv" | "txt" | "text" | "delimited" => Ok(FileFormat::Delimited),
            "excel" | "xlsx" | "xlsm" | "xls" | "xlsb" | "ods" | "spreadsheet" => {
                Ok(FileFormat::Spreadsheet)
            }
            other => Err(AppError::Load(format!("Unsupported format '{}'", other))),
        }
    }

    pub fn from_file_name(name: &str) -> Result<Self> {
        let extension = name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .ok_or_else(|| AppError::Load(format!("Cannot detect format of '{}'", name)))?;
        match extension.as_str() {
            "csv" | "tsv" | "txt" | "psv" => Ok(FileFormat::Delimited),
            "xlsx" | "xlsm" | "xls" | "xlsb" | "ods" => Ok(FileFormat::Spreadsheet),
            other => Err(AppError::Load(format!("Unsupported file extension '.{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub format: Option<FileFormat>,
    pub file_name: Option<String>,
    pub encoding: Option<String>,
    pub sheet: Option<SheetSelection>,
    pub auto_detect_types: bool,
}

impl LoadOptions {
    fn resolve_format(&self) -> Result<FileFormat> {
        match (self.format, self.file_name.as_deref()) {
            (Some(format), _) => Ok(format),
            (None, Some(name)) => FileFormat::from_file_name(name),
            (None, None) => Err(AppError::Load(
                "Either a format or a file name is required".to_string(),
            )),
        }
    }
}

pub struct DataLoader {
    default_encoding: String,
}

impl Default for DataLoader {
    fn default() -> Self {
        Self::new("utf-8")
    }
}

impl DataLoader {
    pub fn new(default_encoding: impl Into<String>) -> Self {
        Self {
            default_encoding: default_encoding.into(),
        }
    }

    /// Loads, strips blank rows and columns, and optionally coerces text columns.
    pub fn load(&self, bytes: &[u8], options: &LoadOptions) -> Result<DataFrame> {
        let df = match options.resolve_format()? {
            FileFormat::Delimited => self.load_csv(bytes, options.encoding.as_deref())?,
            FileFormat::Spreadsheet => self.load_excel(bytes, options.sheet.as_ref())?,
        };
        if options.auto_detect_types {
            auto_detect_types(&df)
        } else {
            Ok(df)
        }
    }

    pub fn load_csv(&self, bytes: &[u8], encoding: Option<&str>) -> Result<DataFrame> {
        let encoding = encoding.unwrap_or(&self.default_encoding);
        info!("Loading delimited text ({} bytes, encoding {})", bytes.len(), encoding);
        let text = decode(bytes, encoding)?;

        let mut chosen = None;
        for &separator in DELIMITERS.iter() {
            match parse_delimited(&text, separator) {
                Ok(df) if df.width() > 1 => {
                    debug!("Separator {:?} produced {} columns", separator as char, df.width());
                    chosen = Some(df);
                    break;
                }
                Ok(_) => debug!("Separator {:?} produced a single column", separator as char),
                Err(e) => debug!("Separator {:?} failed: {}", separator as char, e),
            }
        }

        let df = match chosen {
            Some(df) => df,
            None => {
                warn!("No separator produced more than one column, falling back to ','");
                parse_delimited(&text, DELIMITERS[0])?
            }
        };
        finish_load(df)
    }

    pub fn load_excel(&self, bytes: &[u8], sheet: Option<&SheetSelection>) -> Result<DataFrame> {
        info!("Loading workbook ({} bytes)", bytes.len());
        let df = excel::read_sheet(bytes, sheet)?;
        finish_load(df)
    }

    pub fn list_sheets(&self, bytes: &[u8]) -> Result<Vec<String>> {
        excel::sheet_names(bytes)
    }
}

/// Decodes raw bytes with the given label; a byte-order mark is dropped.
pub fn decode(bytes: &[u8], label: &str) -> Result<String> {
    let normalized = label.trim().to_ascii_lowercase();
    let encoding = match normalized.as_str() {
        "utf-8-sig" | "utf8-sig" => Some(encoding_rs::UTF_8),
        other => Encoding::for_label(other.as_bytes()),
    }
    .ok_or_else(|| AppError::invalid("encoding", format!("unknown encoding '{}'", label)))?;

    let (text, actual, had_errors) = encoding.decode(bytes);
    if had_errors {
        return Err(AppError::Load(format!(
            "File is not valid {} text; try another encoding",
            actual.name()
        )));
    }
    Ok(text.into_owned())
}

/// Column types are inferred from every row, so a late float widens an
/// integer column instead of failing the parse.
pub fn parse_delimited(text: &str, separator: u8) -> Result<DataFrame> {
    CsvReader::new(Cursor::new(text.as_bytes().to_vec()))
        .has_header(true)
        .with_separator(separator)
        .infer_schema(None)
        .finish()
        .map_err(|e| AppError::Load(format!("Failed to parse delimited text: {}", e)))
}

fn finish_load(df: DataFrame) -> Result<DataFrame> {
    let cleaned = drop_empty(&df)?;
    if cleaned.width() == 0 || cleaned.height() == 0 {
        return Err(AppError::Load("No data found after removing empty rows and columns".to_string()));
    }
    info!(
        "Loaded {} rows x {} columns ({} rows and {} columns were empty)",
        cleaned.height(),
        cleaned.width(),
        df.height() - cleaned.height(),
        df.width() - cleaned.width()
    );
    Ok(cleaned)
}

/// Removes rows that are missing in every column, then columns missing in
/// every row.
pub fn drop_empty(df: &DataFrame) -> Result<DataFrame> {
    let masks = df
        .get_columns()
        .iter()
        .map(missing_mask)
        .collect::<Result<Vec<_>>>()?;
    let keep_rows: Vec<bool> = (0..df.height())
        .map(|row| masks.iter().any(|mask| !mask[row]))
        .collect();
    let rows_kept = filter_rows(df, &keep_rows)?;

    let mut keep_columns = Vec::with_capacity(rows_kept.width());
    for series in rows_kept.get_columns() {
        if missing_count(series)? < series.len() {
            keep_columns.push(series.name());
        }
    }
    Ok(rows_kept.select(keep_columns)?)
}

/// Tries numeric then datetime parsing on every text column.
pub fn auto_detect_types(df: &DataFrame) -> Result<DataFrame> {
    let mut out = df.clone();
    for series in df.get_columns() {
        if series.dtype() != &DataType::String {
            continue;
        }
        let name = series.name();
        let converted = match coerce_text(&text_values(series)?) {
            Coerced::Integer(values) => Series::new(name, values),
            Coerced::Float(values) => Series::new(name, values),
            Coerced::Datetime(values) => Series::new(name, values)
                .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))?,
            Coerced::Unchanged => continue,
        };
        debug!("Column {} converted to {}", name, converted.dtype());
        out.with_column(converted)?;
    }
    Ok(out)
}

pub fn validate(df: &DataFrame) -> Result<QualityReport> {
    let mut column_types = TypeCounts::default();
    let mut missing_values = 0;
    for series in df.get_columns() {
        column_types.record(column_kind(series));
        missing_values += missing_count(series)?;
    }

    Ok(QualityReport {
        total_rows: df.height(),
        total_columns: df.width(),
        missing_values,
        duplicate_rows: duplicate_row_count(df)?,
        column_types,
        memory_usage_mb: memory_usage_mb(df),
    })
}

/// Seeded uniform subsample without replacement; rows keep their relative order.
pub fn sample(df: &DataFrame, size: usize, seed: u64) -> Result<DataFrame> {
    if df.height() <= size {
        return Ok(df.clone());
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let picked = rand::seq::index::sample(&mut rng, df.height(), size);
    let mut keep = vec![false; df.height()];
    for index in picked.iter() {
        keep[index] = true;
    }
    filter_rows(df, &keep)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loader() -> DataLoader {
        DataLoader::default()
    }

    #[test]
    fn semicolon_files_are_probed() {
        let data = b"a;b;c\n1;2;3\n4;5;6\n";
        let probed = loader().load_csv(data, None).unwrap();
        let direct = parse_delimited(std::str::from_utf8(data).unwrap(), b';').unwrap();
        assert_eq!(probed.width(), 3);
        assert!(probed.equals_missing(&direct));
    }

    #[test]
    fn tab_and_pipe_files_are_probed() {
        assert_eq!(loader().load_csv(b"a\tb\n1\t2\n", None).unwrap().width(), 2);
        assert_eq!(loader().load_csv(b"a|b\n1|2\n", None).unwrap().width(), 2);
    }

    #[test]
    fn single_column_falls_back_to_comma() {
        let df = loader().load_csv(b"only\n1\n2\n", None).unwrap();
        assert_eq!(df.width(), 1);
        assert_eq!(df.height(), 2);
    }

    #[test]
    fn blank_rows_and_columns_are_stripped() {
        let data = b"a,b,empty\n1,x,\n,,\n3,y,\n";
        let df = loader().load_csv(data, None).unwrap();
        assert_eq!(df.get_column_names(), vec!["a", "b"]);
        assert_eq!(df.height(), 2);
        assert_eq!(df.column("a").unwrap().i64().unwrap().get(1), Some(3));
    }

    #[test]
    fn late_float_widens_integer_column() {
        let mut data = String::from("id,amount\n");
        for i in 0..1500 {
            data.push_str(&format!("{},{}\n", i, i * 2));
        }
        data.push_str("1500,2.5\n");

        let df = loader().load_csv(data.as_bytes(), None).unwrap();
        assert_eq!(df.shape(), (1501, 2));
        let amount = df.column("amount").unwrap();
        assert_eq!(amount.dtype(), &DataType::Float64);
        assert_eq!(amount.f64().unwrap().get(1500), Some(2.5));
        assert_eq!(amount.f64().unwrap().get(3), Some(6.0));
        assert_eq!(df.column("id").unwrap().dtype(), &DataType::Int64);
    }

    fn spreadsheet(sheet: Option<SheetSelection>) -> LoadOptions {
        LoadOptions {
            format: Some(FileFormat::Spreadsheet),
            sheet,
            ..Default::default()
        }
    }

    #[test]
    fn spreadsheet_blanks_are_stripped() {
        let mut workbook = rust_xlsxwriter::Workbook::new();
        let sheet = workbook.add_worksheet().set_name("Raw").unwrap();
        sheet.write_string(0, 0, "city").unwrap();
        sheet.write_string(0, 2, "visits").unwrap();
        sheet.write_string(1, 0, "Oslo").unwrap();
        sheet.write_number(1, 2, 7.0).unwrap();
        sheet.write_string(3, 0, "Lima").unwrap();
        sheet.write_number(3, 2, 30.0).unwrap();
        let bytes = workbook.save_to_buffer().unwrap();

        let df = loader()
            .load(&bytes, &spreadsheet(Some(SheetSelection::Name("Raw".into()))))
            .unwrap();
        assert_eq!(df.get_column_names(), vec!["city", "visits"]);
        assert_eq!(df.height(), 2);
        assert_eq!(df.column("city").unwrap().str().unwrap().get(1), Some("Lima"));
        assert_eq!(df.column("visits").unwrap().i64().unwrap().get(1), Some(30));
    }

    #[test]
    fn excel_export_reloads_identically() {
        let df = df!(
            "city" => &["Zürich", "Oslo", "Lima"],
            "visits" => &[12i64, 7, 30],
            "rating" => &[Some(4.5), None, Some(3.25)],
            "open" => &[true, false, true]
        )
        .unwrap();
        let bytes = crate::services::export::to_excel(&df).unwrap();
        let reloaded = loader().load(&bytes, &spreadsheet(None)).unwrap();
        assert!(reloaded.equals_missing(&df));

        let by_index = loader()
            .load(&bytes, &spreadsheet(Some(SheetSelection::Index(0))))
            .unwrap();
        assert!(by_index.equals_missing(&df));
    }

    #[test]
    fn gbk_text_decodes() {
        let (bytes, _, _) = encoding_rs::GBK.encode("名称,数量\n苹果,3\n");
        let df = loader().load_csv(&bytes, Some("gbk")).unwrap();
        assert_eq!(df.get_column_names(), vec!["名称", "数量"]);
        assert_eq!(df.column("名称").unwrap().str().unwrap().get(0), Some("苹果"));
    }

    #[test]
    fn wrong_encoding_is_a_load_error() {
        let (bytes, _, _) = encoding_rs::GBK.encode("名称,数量\n苹果,3\n");
        let err = loader().load_csv(&bytes, Some("utf-8")).unwrap_err();
        assert!(matches!(err, AppError::Load(_)));
        let err = loader().load_csv(b"a,b\n1,2\n", Some("klingon")).unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));
    }

    #[test]
    fn bom_is_stripped() {
        let df = loader().load_csv("\u{feff}a,b\n1,2\n".as_bytes(), Some("utf-8-sig")).unwrap();
        assert_eq!(df.get_column_names(), vec!["a", "b"]);
    }

    #[test]
    fn header_only_file_is_empty() {
        assert!(matches!(loader().load_csv(b"a,b\n", None), Err(AppError::Load(_))));
    }

    #[test]
    fn format_detection() {
        assert_eq!(FileFormat::from_file_name("data.CSV").unwrap(), FileFormat::Delimited);
        assert_eq!(FileFormat::from_file_name("book.xlsx").unwrap(), FileFormat::Spreadsheet);
        assert!(FileFormat::from_file_name("notes.pdf").is_err());
        assert_eq!(FileFormat::parse("excel").unwrap(), FileFormat::Spreadsheet);
    }

    #[test]
    fn auto_detect_converts_whole_columns_only() {
        let df = df!(
            "num" => &[Some("1"), Some("2"), None],
            "when" => &[Some("2024-01-01"), Some("2024-02-01"), Some("2024-03-01")],
            "mixed" => &[Some("1"), Some("x"), Some("3")]
        )
        .unwrap();
        let out = auto_detect_types(&df).unwrap();
        assert_eq!(out.column("num").unwrap().dtype(), &DataType::Int64);
        assert!(matches!(out.column("when").unwrap().dtype(), DataType::Datetime(_, _)));
        assert_eq!(out.column("mixed").unwrap().dtype(), &DataType::String);
        assert_eq!(out.get_column_names(), vec!["num", "when", "mixed"]);
    }

    #[test]
    fn validation_report_counts() {
        let df = df!(
            "k" => &["A", "A", "B"],
            "v" => &[Some(1i64), Some(1), None]
        )
        .unwrap();
        let report = validate(&df).unwrap();
        assert_eq!(report.total_rows, 3);
        assert_eq!(report.total_columns, 2);
        assert_eq!(report.missing_values, 1);
        assert_eq!(report.duplicate_rows, 1);
        assert_eq!(report.column_types.numeric_columns, 1);
        assert_eq!(report.column_types.text_columns, 1);
    }

    #[test]
    fn sampling_is_seeded() {
        let values: Vec<i64> = (0..100).collect();
        let df = df!("v" => values).unwrap();
        let a = sample(&df, 10, 42).unwrap();
        let b = sample(&df, 10, 42).unwrap();
        assert_eq!(a.height(), 10);
        assert!(a.equals(&b));
        assert_eq!(sample(&df, 500, 1).unwrap().height(), 100);
    }
}
