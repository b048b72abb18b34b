use polars::prelude::DataType;
use serde::Serialize;
use smallvec::SmallVec;
use std::collections::BTreeMap;

pub const SAMPLE_SIZE: usize = 3;

/// Coarse column classification used by every report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    Numeric,
    Text,
    Datetime,
    Boolean,
    Categorical,
    Other,
}

impl ColumnKind {
    pub fn of(dtype: &DataType) -> Self {
        match dtype {
            DataType::String => ColumnKind::Text,
            DataType::Boolean => ColumnKind::Boolean,
            DataType::Categorical(..) => ColumnKind::Categorical,
            dt if dt.is_numeric() => ColumnKind::Numeric,
            dt if dt.is_temporal() => ColumnKind::Datetime,
            _ => ColumnKind::Other,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TypeCounts {
    pub numeric_columns: usize,
    pub text_columns: usize,
    pub datetime_columns: usize,
    pub boolean_columns: usize,
    pub categorical_columns: usize,
    pub other_columns: usize,
}

impl TypeCounts {
    pub fn record(&mut self, kind: ColumnKind) {
        match kind {
            ColumnKind::Numeric => self.numeric_columns += 1,
            ColumnKind::Text => self.text_columns += 1,
            ColumnKind::Datetime => self.datetime_columns += 1,
            ColumnKind::Boolean => self.boolean_columns += 1,
            ColumnKind::Categorical => self.categorical_columns += 1,
            ColumnKind::Other => self.other_columns += 1,
        }
    }
}

/// Snapshot produced right after a load; recomputed on every request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityReport {
    pub total_rows: usize,
    pub total_columns: usize,
    pub missing_values: usize,
    pub duplicate_rows: usize,
    pub column_types: TypeCounts,
    pub memory_usage_mb: f64,
}

/// count / mean / std / min / quartiles / max of one numeric column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NumericSummary {
    pub count: usize,
    pub mean: Option<f64>,
    pub std: Option<f64>,
    pub min: Option<f64>,
    #[serde(rename = "25%")]
    pub q25: Option<f64>,
    #[serde(rename = "50%")]
    pub median: Option<f64>,
    #[serde(rename = "75%")]
    pub q75: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BasicInfo {
    pub total_rows: usize,
    pub total_columns: usize,
    pub memory_usage_mb: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissingValueStats {
    pub total_missing: usize,
    pub columns_with_missing: usize,
    pub missing_percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateStats {
    pub duplicate_rows: usize,
    pub duplicate_percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statistics {
    pub basic_info: BasicInfo,
    pub data_types: TypeCounts,
    pub missing_values: MissingValueStats,
    pub duplicates: DuplicateStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub numeric_summary: Option<BTreeMap<String, NumericSummary>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QualityIssues {
    pub high_missing_columns: Vec<String>,
    pub high_cardinality_columns: Vec<String>,
    pub constant_columns: Vec<String>,
    pub duplicate_columns: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NumericProfile {
    pub mean: Option<f64>,
    pub std: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub median: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnProfile {
    pub name: String,
    pub dtype: String,
    pub kind: ColumnKind,
    pub non_null_count: usize,
    pub null_count: usize,
    pub unique_count: usize,
    pub memory_usage: usize,
    pub sample_values: SmallVec<[String; SAMPLE_SIZE]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub numeric: Option<NumericProfile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub most_frequent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataProfile {
    pub statistics: Statistics,
    pub quality_issues: QualityIssues,
    pub column_profiles: Vec<ColumnProfile>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use polars::prelude::TimeUnit;

    #[test]
    fn kinds_follow_dtype() {
        assert_eq!(ColumnKind::of(&DataType::Int64), ColumnKind::Numeric);
        assert_eq!(ColumnKind::of(&DataType::Float32), ColumnKind::Numeric);
        assert_eq!(ColumnKind::of(&DataType::String), ColumnKind::Text);
        assert_eq!(ColumnKind::of(&DataType::Boolean), ColumnKind::Boolean);
        assert_eq!(ColumnKind::of(&DataType::Date), ColumnKind::Datetime);
        assert_eq!(
            ColumnKind::of(&DataType::Datetime(TimeUnit::Milliseconds, None)),
            ColumnKind::Datetime
        );
    }

    #[test]
    fn summary_uses_describe_keys() {
        let summary = NumericSummary {
            count: 1,
            mean: Some(1.0),
            std: None,
            min: Some(1.0),
            q25: Some(1.0),
            median: Some(1.0),
            q75: Some(1.0),
            max: Some(1.0),
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert!(json.get("25%").is_some());
        assert!(json.get("50%").is_some());
        assert!(json["std"].is_null());
    }
}
