use polars::prelude::*;
use rayon::prelude::*;
use smallvec::SmallVec;
use std::collections::BTreeMap;

use crate::error::Result;
use crate::models::{
    BasicInfo, ColumnKind, ColumnProfile, DataProfile, DuplicateStats, MissingValueStats,
    NumericProfile, NumericSummary, QualityIssues, Statistics, TypeCounts, SAMPLE_SIZE,
};
use crate::services::frame::{
    cell_keys, column_kind, duplicate_row_count, memory_usage_mb, missing_count, numeric_values,
    present, unique_count,
};
use crate::services::stats;

const HIGH_MISSING_RATIO: f64 = 0.5;
const HIGH_CARDINALITY_RATIO: f64 = 0.8;

fn numeric_summary(series: &Series) -> Result<NumericSummary> {
    let values = present(&numeric_values(series)?);
    let sorted = stats::sorted(&values);
    Ok(NumericSummary {
        count: values.len(),
        mean: stats::mean(&values),
        std: stats::sample_std(&values),
        min: sorted.first().copied(),
        q25: stats::quantile(&sorted, 0.25),
        median: stats::quantile(&sorted, 0.5),
        q75: stats::quantile(&sorted, 0.75),
        max: sorted.last().copied(),
    })
}

pub fn calculate_statistics(df: &DataFrame) -> Result<Statistics> {
    let rows = df.height();
    let mut data_types = TypeCounts::default();
    let mut total_missing = 0;
    let mut columns_with_missing = 0;
    let mut numeric = BTreeMap::new();

    for series in df.get_columns() {
        let kind = column_kind(series);
        data_types.record(kind);
        let missing = missing_count(series)?;
        total_missing += missing;
        if missing > 0 {
            columns_with_missing += 1;
        }
        if kind == ColumnKind::Numeric {
            numeric.insert(series.name().to_string(), numeric_summary(series)?);
        }
    }

    let duplicate_rows = duplicate_row_count(df)?;
    tracing::debug!(
        "Statistics over {} rows: {} missing cells, {} duplicate rows",
        rows,
        total_missing,
        duplicate_rows
    );

    Ok(Statistics {
        basic_info: BasicInfo {
            total_rows: rows,
            total_columns: df.width(),
            memory_usage_mb: memory_usage_mb(df),
        },
        data_types,
        missing_values: MissingValueStats {
            total_missing,
            columns_with_missing,
            missing_percentage: stats::percentage(total_missing, rows * df.width()),
        },
        duplicates: DuplicateStats {
            duplicate_rows,
            duplicate_percentage: stats::percentage(duplicate_rows, rows),
        },
        numeric_summary: (!numeric.is_empty()).then_some(numeric),
    })
}

pub fn detect_quality_issues(df: &DataFrame) -> Result<QualityIssues> {
    let rows = df.height();
    let mut issues = QualityIssues::default();

    let columns = df.get_columns();
    let mut keys = Vec::with_capacity(columns.len());
    for series in columns {
        let name = series.name().to_string();
        let missing = missing_count(series)?;
        let unique = unique_count(series)?;

        if rows > 0 && missing as f64 / rows as f64 > HIGH_MISSING_RATIO {
            issues.high_missing_columns.push(name.clone());
        }
        if column_kind(series) == ColumnKind::Text
            && rows > 0
            && unique as f64 / rows as f64 > HIGH_CARDINALITY_RATIO
        {
            issues.high_cardinality_columns.push(name.clone());
        }
        if unique <= 1 {
            issues.constant_columns.push(name);
        }
        keys.push(cell_keys(series)?);
    }

    for i in 0..columns.len() {
        for j in (i + 1)..columns.len() {
            if columns[i].dtype() == columns[j].dtype() && keys[i] == keys[j] {
                issues
                    .duplicate_columns
                    .push((columns[i].name().to_string(), columns[j].name().to_string()));
            }
        }
    }

    tracing::info!(
        "Quality check: {} high-missing, {} high-cardinality, {} constant, {} duplicate pairs",
        issues.high_missing_columns.len(),
        issues.high_cardinality_columns.len(),
        issues.constant_columns.len(),
        issues.duplicate_columns.len()
    );
    Ok(issues)
}

fn column_profile(series: &Series) -> Result<ColumnProfile> {
    let kind = column_kind(series);
    let keys = cell_keys(series)?;
    let null_count = missing_count(series)?;
    let sample_values: SmallVec<[String; SAMPLE_SIZE]> =
        keys.iter().flatten().take(SAMPLE_SIZE).cloned().collect();

    let mut profile = ColumnProfile {
        name: series.name().to_string(),
        dtype: series.dtype().to_string(),
        kind,
        non_null_count: series.len() - null_count,
        null_count,
        unique_count: unique_count(series)?,
        memory_usage: series.estimated_size(),
        sample_values,
        numeric: None,
        most_frequent: None,
        frequency: None,
    };

    match kind {
        ColumnKind::Numeric => {
            let values = present(&numeric_values(series)?);
            profile.numeric = Some(NumericProfile {
                mean: stats::mean(&values),
                std: stats::sample_std(&values),
                min: stats::min(&values),
                max: stats::max(&values),
                median: stats::median(&values),
            });
        }
        ColumnKind::Text | ColumnKind::Categorical => {
            let present: Vec<String> = keys.into_iter().flatten().collect();
            let mode = stats::mode_ord(&present);
            profile.frequency = Some(mode.as_ref().map_or(0, |(_, count)| *count));
            profile.most_frequent = mode.map(|(value, _)| value);
        }
        _ => {}
    }
    Ok(profile)
}

pub fn generate_profile(df: &DataFrame) -> Result<DataProfile> {
    tracing::info!("Profiling {} columns x {} rows", df.width(), df.height());
    let statistics = calculate_statistics(df)?;
    let quality_issues = detect_quality_issues(df)?;
    let column_profiles = df
        .get_columns()
        .par_iter()
        .map(column_profile)
        .collect::<Result<Vec<_>>>()?;

    Ok(DataProfile {
        statistics,
        quality_issues,
        column_profiles,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> DataFrame {
        df!(
            "id" => &[1i64, 2, 3, 4],
            "copy" => &[1i64, 2, 3, 4],
            "flag" => &["y", "y", "y", "y"],
            "name" => &[Some("ann"), Some("bob"), Some("cy"), Some("dee")],
            "sparse" => &[Some(1.0), None, None, Some(f64::NAN)]
        )
        .unwrap()
    }

    #[test]
    fn statistics_summarise_counts_and_numbers() {
        let stats = calculate_statistics(&frame()).unwrap();
        assert_eq!(stats.basic_info.total_rows, 4);
        assert_eq!(stats.data_types.numeric_columns, 3);
        assert_eq!(stats.data_types.text_columns, 2);
        assert_eq!(stats.missing_values.total_missing, 3);
        assert_eq!(stats.missing_values.columns_with_missing, 1);
        assert_eq!(stats.missing_values.missing_percentage, 15.0);
        assert_eq!(stats.duplicates.duplicate_rows, 0);

        let summary = &stats.numeric_summary.unwrap()["id"];
        assert_eq!(summary.count, 4);
        assert_eq!(summary.mean, Some(2.5));
        assert_eq!(summary.q25, Some(1.75));
        assert_eq!(summary.max, Some(4.0));
    }

    #[test]
    fn statistics_without_numbers_omit_summary() {
        let df = df!("t" => &["a"]).unwrap();
        assert!(calculate_statistics(&df).unwrap().numeric_summary.is_none());
    }

    #[test]
    fn quality_issues_are_classified() {
        let issues = detect_quality_issues(&frame()).unwrap();
        assert_eq!(issues.high_missing_columns, vec!["sparse".to_string()]);
        assert_eq!(issues.high_cardinality_columns, vec!["name".to_string()]);
        assert_eq!(issues.constant_columns, vec!["flag".to_string(), "sparse".to_string()]);
        assert_eq!(
            issues.duplicate_columns,
            vec![("id".to_string(), "copy".to_string())]
        );
    }

    #[test]
    fn second_distinct_value_is_not_constant() {
        let df = df!("c" => &[5i64, 5, 5, 6]).unwrap();
        assert!(detect_quality_issues(&df).unwrap().constant_columns.is_empty());
    }

    #[test]
    fn profile_covers_every_column() {
        let profile = generate_profile(&frame()).unwrap();
        assert_eq!(profile.column_profiles.len(), 5);

        let id = &profile.column_profiles[0];
        assert_eq!(id.name, "id");
        assert_eq!(id.numeric.as_ref().unwrap().median, Some(2.5));
        assert_eq!(id.sample_values.as_slice(), ["1", "2", "3"]);

        let flag = &profile.column_profiles[2];
        assert_eq!(flag.most_frequent.as_deref(), Some("y"));
        assert_eq!(flag.frequency, Some(4));
        assert!(flag.numeric.is_none());

        let sparse = &profile.column_profiles[4];
        assert_eq!(sparse.null_count, 3);
        assert_eq!(sparse.non_null_count, 1);
    }
}
