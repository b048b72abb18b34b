use polars::prelude::*;

use sheet_dashboard::error::AppError;
use sheet_dashboard::services::export::{self, ExportFormat, ExportOptions};
use sheet_dashboard::services::loader::{self, DataLoader, FileFormat, LoadOptions};
use sheet_dashboard::services::processor::{
    DataProcessor, EncodingMethod, MissingStrategy, OutlierMethod,
};
use sheet_dashboard::services::profiler;
use sheet_dashboard::session::{Operation, Session};

fn csv_options() -> LoadOptions {
    LoadOptions {
        format: Some(FileFormat::Delimited),
        ..Default::default()
    }
}

#[test]
fn semicolon_file_matches_direct_parse() {
    let data = b"region;units;price\nNorth;3;9.5\nSouth;4;7.25\n";
    let probed = DataLoader::default().load(data, &csv_options()).unwrap();
    let direct = loader::parse_delimited(std::str::from_utf8(data).unwrap(), b';').unwrap();
    assert_eq!(probed.width(), 3);
    assert!(probed.equals_missing(&direct));
}

#[test]
fn blank_rows_and_columns_are_stripped() {
    let data = b"a,b,c\n1,,x\n,,\n2,,y\n";
    let df = DataLoader::default().load(data, &csv_options()).unwrap();
    assert_eq!(df.get_column_names(), vec!["a", "c"]);
    assert_eq!(df.height(), 2);
    assert_eq!(df.column("a").unwrap().i64().unwrap().get(1), Some(2));
}

#[test]
fn mean_fill_leaves_no_gaps() {
    let df = df!("v" => &[Some(1.0), Some(2.0), None, Some(4.0)]).unwrap();
    let out = DataProcessor::new()
        .handle_missing(&df, MissingStrategy::Mean)
        .unwrap();
    let v = out.column("v").unwrap();
    assert_eq!(v.null_count(), 0);
    let filled = v.f64().unwrap().get(2).unwrap();
    assert!((filled - 7.0 / 3.0).abs() < 1e-9);
}

#[test]
fn duplicate_removal_keeps_first_and_is_idempotent() {
    let df = df!(
        "k" => &["A", "A", "B"],
        "n" => &[1i64, 1, 2]
    )
    .unwrap();
    let processor = DataProcessor::new();
    let once = processor.remove_duplicates(&df, None).unwrap();
    let twice = processor.remove_duplicates(&once, None).unwrap();
    assert_eq!(once.height(), 2);
    assert_eq!(once.column("k").unwrap().str().unwrap().get(0), Some("A"));
    assert!(once.equals_missing(&twice));
}

#[test]
fn iqr_drops_the_far_value() {
    let df = df!("x" => &[1.0, 2.0, 3.0, 4.0, 100.0]).unwrap();
    let out = DataProcessor::new()
        .remove_outliers(&df, None, OutlierMethod::Iqr)
        .unwrap();
    let kept: Vec<f64> = out.column("x").unwrap().f64().unwrap().into_no_null_iter().collect();
    assert_eq!(kept, vec![1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn csv_export_reloads_identically() {
    let df = df!(
        "city" => &["Zürich", "Oslo", "Lima"],
        "visits" => &[12i64, 7, 30],
        "rating" => &[Some(4.5), None, Some(3.25)]
    )
    .unwrap();
    let bytes = export::to_csv(&df).unwrap();
    let reloaded = DataLoader::default().load(&bytes, &csv_options()).unwrap();
    assert_eq!(reloaded.shape(), df.shape());
    assert!(reloaded.equals_missing(&df));
}

#[test]
fn export_file_honours_subset() {
    let df = df!("a" => &[1i64, 2, 3], "b" => &["x", "y", "z"]).unwrap();
    let options = ExportOptions {
        rows: Some((1, 3)),
        columns: Some(vec!["b".to_string()]),
    };
    let file = export::export(&df, ExportFormat::Csv, &options).unwrap();
    assert!(file.file_name.ends_with(".csv"));
    let reloaded = DataLoader::default().load(&file.bytes, &csv_options()).unwrap();
    assert_eq!(reloaded.shape(), (2, 1));
}

#[test]
fn constant_columns_are_flagged() {
    let df = df!(
        "same" => &[7i64, 7, 7],
        "varies" => &[7i64, 7, 8]
    )
    .unwrap();
    let issues = profiler::detect_quality_issues(&df).unwrap();
    assert_eq!(issues.constant_columns, vec!["same".to_string()]);
}

#[test]
fn one_hot_rows_sum_to_one() {
    let df = df!(
        "id" => &[1i64, 2, 3, 4],
        "color" => &["red", "green", "blue", "red"]
    )
    .unwrap();
    let columns = vec!["color".to_string()];
    let out = DataProcessor::new()
        .encode(&df, Some(&columns), EncodingMethod::OneHot)
        .unwrap();
    assert_eq!(out.width(), df.width() - 1 + 3);
    assert!(out.column("color").is_err());

    let indicators = ["color_blue", "color_green", "color_red"];
    for row in 0..out.height() {
        let sum: i32 = indicators
            .iter()
            .map(|name| out.column(name).unwrap().i32().unwrap().get(row).unwrap())
            .sum();
        assert_eq!(sum, 1);
    }
}

#[test]
fn failed_step_keeps_the_working_table() {
    let mut session = Session::new();
    session.set_raw(df!("t" => &["a", "b"], "n" => &[1i64, 2]).unwrap());
    let before = session.current().unwrap().clone();

    let err = session
        .apply(&Operation::RemoveOutliers {
            columns: Some(vec!["t".to_string()]),
            method: "iqr".to_string(),
        })
        .unwrap_err();
    assert!(matches!(err, AppError::Validation { .. }));
    assert!(session.current().unwrap().equals_missing(&before));
}
