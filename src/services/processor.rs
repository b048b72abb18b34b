use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::models::ColumnKind;
use crate::services::frame::{
    column_kind, duplicate_mask, filter_rows, missing_count, missing_mask, numeric_column_names,
    numeric_values, present, text_values,
};
use crate::services::stats;

const IQR_FACTOR: f64 = 1.5;
const Z_THRESHOLD: f64 = 3.0;
/// Share of the value range the lowest count-derived edge is pushed down by.
const EDGE_ADJUSTMENT: f64 = 0.001;
const MAX_BINS: usize = 10_000;

fn method_key(raw: &str) -> String {
    raw.trim()
        .to_ascii_lowercase()
        .chars()
        .filter(|c| !matches!(c, '-' | '_' | ' '))
        .collect()
}

fn unknown_method(raw: &str, expected: &[&str]) -> AppError {
    AppError::invalid(
        "method",
        format!("unknown method '{}', expected one of: {}", raw, expected.join(", ")),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingStrategy {
    Drop,
    Mean,
    Median,
    Mode,
}

impl FromStr for MissingStrategy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match method_key(s).as_str() {
            "drop" => Ok(MissingStrategy::Drop),
            "mean" => Ok(MissingStrategy::Mean),
            "median" => Ok(MissingStrategy::Median),
            "mode" => Ok(MissingStrategy::Mode),
            _ => Err(unknown_method(s, &["drop", "mean", "median", "mode"])),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutlierMethod {
    Iqr,
    ZScore,
}

impl FromStr for OutlierMethod {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match method_key(s).as_str() {
            "iqr" => Ok(OutlierMethod::Iqr),
            "zscore" => Ok(OutlierMethod::ZScore),
            _ => Err(unknown_method(s, &["iqr", "zscore"])),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalingMethod {
    Standard,
    MinMax,
}

impl FromStr for ScalingMethod {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match method_key(s).as_str() {
            "standard" => Ok(ScalingMethod::Standard),
            "minmax" => Ok(ScalingMethod::MinMax),
            _ => Err(unknown_method(s, &["standard", "minmax"])),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EncodingMethod {
    Label,
    OneHot,
}

impl FromStr for EncodingMethod {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match method_key(s).as_str() {
            "label" => Ok(EncodingMethod::Label),
            "onehot" => Ok(EncodingMethod::OneHot),
            _ => Err(unknown_method(s, &["label", "onehot"])),
        }
    }
}

/// Either a number of equal-width bins or explicit ascending boundaries.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Bins {
    Count(usize),
    Edges(Vec<f64>),
}

impl Bins {
    fn validate(&self) -> Result<usize> {
        let count = match self {
            Bins::Count(0) => return Err(AppError::invalid("bins", "bin count must be at least 1")),
            Bins::Count(n) => *n,
            Bins::Edges(edges) if edges.len() < 2 => {
                return Err(AppError::invalid("bins", "at least two bin edges are required"))
            }
            Bins::Edges(edges) => {
                if edges.iter().any(|e| !e.is_finite()) {
                    return Err(AppError::invalid("bins", "bin edges must be finite"));
                }
                if edges.windows(2).any(|w| w[0] >= w[1]) {
                    return Err(AppError::invalid("bins", "bin edges must increase monotonically"));
                }
                edges.len() - 1
            }
        };
        if count > MAX_BINS {
            return Err(AppError::invalid(
                "bins",
                format!("{} bins requested, at most {} allowed", count, MAX_BINS),
            ));
        }
        Ok(count)
    }

    /// Edges over the given values; `None` when a count is requested for an
    /// empty column.
    fn edges(&self, values: &[f64]) -> Option<Vec<f64>> {
        match self {
            Bins::Edges(edges) => Some(edges.clone()),
            Bins::Count(n) => {
                let (mut lo, mut hi) = (stats::min(values)?, stats::max(values)?);
                if lo == hi {
                    let pad = if lo == 0.0 { EDGE_ADJUSTMENT } else { lo.abs() * EDGE_ADJUSTMENT };
                    lo -= pad;
                    hi += pad;
                    Some(linspace(lo, hi, *n))
                } else {
                    let mut edges = linspace(lo, hi, *n);
                    edges[0] -= (hi - lo) * EDGE_ADJUSTMENT;
                    Some(edges)
                }
            }
        }
    }
}

fn linspace(lo: f64, hi: f64, bins: usize) -> Vec<f64> {
    let step = (hi - lo) / bins as f64;
    (0..=bins)
        .map(|i| if i == bins { hi } else { lo + step * i as f64 })
        .collect()
}

/// Right-closed intervals; the lowest one also includes its left edge.
fn bin_index(edges: &[f64], value: f64) -> Option<usize> {
    let first = *edges.first()?;
    let last = *edges.last()?;
    if value < first || value > last {
        return None;
    }
    if value == first {
        return Some(0);
    }
    Some(edges.partition_point(|edge| *edge < value) - 1)
}

fn format_edge(value: f64) -> String {
    let rounded = (value * 1000.0).round() / 1000.0;
    if rounded == 0.0 {
        "0".to_string()
    } else {
        rounded.to_string()
    }
}

fn interval_labels(edges: &[f64]) -> Vec<String> {
    edges
        .windows(2)
        .enumerate()
        .map(|(i, w)| {
            let open = if i == 0 { '[' } else { '(' };
            format!("{}{}, {}]", open, format_edge(w[0]), format_edge(w[1]))
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum ScalerParams {
    Standard { mean: f64, scale: f64 },
    MinMax { min: f64, max: f64 },
}

impl ScalerParams {
    fn fit(method: ScalingMethod, values: &[f64]) -> Option<Self> {
        match method {
            ScalingMethod::Standard => {
                let mean = stats::mean(values)?;
                let std = stats::population_std(values)?;
                let scale = if std == 0.0 { 1.0 } else { std };
                Some(ScalerParams::Standard { mean, scale })
            }
            ScalingMethod::MinMax => Some(ScalerParams::MinMax {
                min: stats::min(values)?,
                max: stats::max(values)?,
            }),
        }
    }

    pub fn transform(&self, value: f64) -> f64 {
        match *self {
            ScalerParams::Standard { mean, scale } => (value - mean) / scale,
            ScalerParams::MinMax { min, max } => {
                let range = max - min;
                if range == 0.0 {
                    0.0
                } else {
                    (value - min) / range
                }
            }
        }
    }
}

/// Sorted distinct values; a value's code is its position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LabelEncoder {
    pub classes: Vec<String>,
}

impl LabelEncoder {
    fn fit(values: &[Option<String>]) -> Self {
        let classes: BTreeSet<&String> = values.iter().flatten().collect();
        Self {
            classes: classes.into_iter().cloned().collect(),
        }
    }

    pub fn code(&self, value: &str) -> Option<i64> {
        self.classes
            .binary_search_by(|class| class.as_str().cmp(value))
            .ok()
            .map(|index| index as i64)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FittedParams {
    pub scalers: BTreeMap<String, ScalerParams>,
    pub encoders: BTreeMap<String, LabelEncoder>,
}

enum Fence {
    Closed { lower: f64, upper: f64 },
    ZScore { mean: f64, std: f64 },
}

impl Fence {
    fn fit(method: OutlierMethod, values: &[f64]) -> Option<Self> {
        match method {
            OutlierMethod::Iqr => {
                let sorted = stats::sorted(values);
                let q1 = stats::quantile(&sorted, 0.25)?;
                let q3 = stats::quantile(&sorted, 0.75)?;
                let iqr = q3 - q1;
                Some(Fence::Closed {
                    lower: q1 - IQR_FACTOR * iqr,
                    upper: q3 + IQR_FACTOR * iqr,
                })
            }
            OutlierMethod::ZScore => {
                let mean = stats::mean(values)?;
                let std = stats::sample_std(values).filter(|s| *s > 0.0)?;
                Some(Fence::ZScore { mean, std })
            }
        }
    }

    fn admits(&self, value: f64) -> bool {
        match *self {
            Fence::Closed { lower, upper } => value >= lower && value <= upper,
            Fence::ZScore { mean, std } => ((value - mean) / std).abs() < Z_THRESHOLD,
        }
    }
}

fn fill_numeric(series: &Series, fill: f64) -> Result<Series> {
    let filled: Vec<Option<f64>> = numeric_values(series)?
        .into_iter()
        .map(|v| v.or(Some(fill)))
        .collect();
    let out = Series::new(series.name(), filled);
    if series.dtype().is_integer() && fill.fract() == 0.0 {
        Ok(out.cast(series.dtype())?)
    } else {
        Ok(out)
    }
}

/// Fills with the most frequent value; `None` when the column has no values.
fn fill_mode(series: &Series) -> Result<Option<Series>> {
    let name = series.name();
    let dtype = series.dtype();
    match column_kind(series) {
        ColumnKind::Numeric => {
            let values = present(&numeric_values(series)?);
            stats::mode_f64(&values)
                .map(|(mode, _)| fill_numeric(series, mode))
                .transpose()
        }
        ColumnKind::Datetime => {
            let physical = series.to_physical_repr().cast(&DataType::Int64)?;
            let values: Vec<Option<i64>> = physical.i64()?.into_iter().collect();
            let present: Vec<i64> = values.iter().flatten().copied().collect();
            let Some((mode, _)) = stats::mode_ord(&present) else {
                return Ok(None);
            };
            let filled: Vec<Option<i64>> = values.into_iter().map(|v| v.or(Some(mode))).collect();
            let out = Series::new(name, filled)
                .cast(&dtype.to_physical())?
                .cast(dtype)?;
            Ok(Some(out))
        }
        ColumnKind::Boolean => {
            let values: Vec<Option<bool>> = series.bool()?.into_iter().collect();
            let present: Vec<bool> = values.iter().flatten().copied().collect();
            let Some((mode, _)) = stats::mode_ord(&present) else {
                return Ok(None);
            };
            let filled: Vec<Option<bool>> = values.into_iter().map(|v| v.or(Some(mode))).collect();
            Ok(Some(Series::new(name, filled)))
        }
        ColumnKind::Text | ColumnKind::Categorical => {
            let values = text_values(series)?;
            let present: Vec<String> = values.iter().flatten().cloned().collect();
            let Some((mode, _)) = stats::mode_ord(&present) else {
                return Ok(None);
            };
            let filled: Vec<Option<String>> = values
                .into_iter()
                .map(|v| v.or_else(|| Some(mode.clone())))
                .collect();
            Ok(Some(Series::new(name, filled).cast(dtype)?))
        }
        ColumnKind::Other => Ok(None),
    }
}

fn categorical_column_names(df: &DataFrame) -> Vec<String> {
    df.get_columns()
        .iter()
        .filter(|s| matches!(column_kind(s), ColumnKind::Text | ColumnKind::Categorical))
        .map(|s| s.name().to_string())
        .collect()
}

fn not_numeric(name: &str) -> AppError {
    AppError::invalid("columns", format!("column '{}' is not numeric", name))
}

/// Cleaning transforms. Every operation returns a new frame; the processor
/// only remembers the parameters fitted by `normalize` and label `encode`.
#[derive(Debug, Clone, Default)]
pub struct DataProcessor {
    scalers: BTreeMap<String, ScalerParams>,
    encoders: BTreeMap<String, LabelEncoder>,
}

impl DataProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scaler(&self, column: &str) -> Option<&ScalerParams> {
        self.scalers.get(column)
    }

    pub fn encoder(&self, column: &str) -> Option<&LabelEncoder> {
        self.encoders.get(column)
    }

    pub fn fitted(&self) -> FittedParams {
        FittedParams {
            scalers: self.scalers.clone(),
            encoders: self.encoders.clone(),
        }
    }

    pub fn handle_missing(&self, df: &DataFrame, strategy: MissingStrategy) -> Result<DataFrame> {
        info!("Handling missing values with {:?} on {} rows", strategy, df.height());

        if strategy == MissingStrategy::Drop {
            let masks = df
                .get_columns()
                .iter()
                .map(missing_mask)
                .collect::<Result<Vec<_>>>()?;
            let keep: Vec<bool> = (0..df.height())
                .map(|row| masks.iter().all(|mask| !mask[row]))
                .collect();
            let out = filter_rows(df, &keep)?;
            info!("Dropped {} rows with missing values", df.height() - out.height());
            return Ok(out);
        }

        let mut out = df.clone();
        for series in df.get_columns() {
            if missing_count(series)? == 0 {
                continue;
            }
            let numeric = column_kind(series) == ColumnKind::Numeric;
            let filled = match strategy {
                MissingStrategy::Mean | MissingStrategy::Median if numeric => {
                    let values = present(&numeric_values(series)?);
                    let center = if strategy == MissingStrategy::Mean {
                        stats::mean(&values)
                    } else {
                        stats::median(&values)
                    };
                    center.map(|c| fill_numeric(series, c)).transpose()?
                }
                _ => fill_mode(series)?,
            };
            match filled {
                Some(column) => {
                    debug!("Filled missing values in {}", series.name());
                    out.with_column(column)?;
                }
                None => warn!("Column {} has no values to fill from, left unfilled", series.name()),
            }
        }
        Ok(out)
    }

    pub fn remove_duplicates(&self, df: &DataFrame, subset: Option<&[String]>) -> Result<DataFrame> {
        let columns: Vec<&str> = match subset {
            Some([]) => {
                return Err(AppError::invalid("subset", "subset must name at least one column"));
            }
            Some(names) => {
                for name in names {
                    if df.column(name).is_err() {
                        return Err(AppError::invalid(
                            "subset",
                            format!("column '{}' not found", name),
                        ));
                    }
                }
                names.iter().map(String::as_str).collect()
            }
            None => df.get_column_names(),
        };

        let keep: Vec<bool> = duplicate_mask(df, &columns)?.into_iter().map(|d| !d).collect();
        let out = filter_rows(df, &keep)?;
        info!("Removed {} duplicate rows", df.height() - out.height());
        Ok(out)
    }

    /// Filters column by column, each bound computed on the rows that survived
    /// the previous columns.
    pub fn remove_outliers(
        &self,
        df: &DataFrame,
        columns: Option<&[String]>,
        method: OutlierMethod,
    ) -> Result<DataFrame> {
        let targets = columns
            .map(<[String]>::to_vec)
            .unwrap_or_else(|| numeric_column_names(df));

        let mut current = df.clone();
        for name in &targets {
            let Ok(series) = current.column(name) else {
                warn!("Column {} not found, skipping outlier removal", name);
                continue;
            };
            if column_kind(series) != ColumnKind::Numeric {
                return Err(not_numeric(name));
            }
            let values = numeric_values(series)?;
            let Some(fence) = Fence::fit(method, &present(&values)) else {
                debug!("Column {} has no usable spread, nothing removed", name);
                continue;
            };
            let keep: Vec<bool> = values
                .iter()
                .map(|v| v.map_or(false, |x| fence.admits(x)))
                .collect();
            current = filter_rows(&current, &keep)?;
        }

        info!(
            "Outlier removal ({:?}) kept {} of {} rows",
            method,
            current.height(),
            df.height()
        );
        Ok(current)
    }

    pub fn normalize(
        &mut self,
        df: &DataFrame,
        columns: Option<&[String]>,
        method: ScalingMethod,
    ) -> Result<DataFrame> {
        let targets = columns
            .map(<[String]>::to_vec)
            .unwrap_or_else(|| numeric_column_names(df));

        let mut out = df.clone();
        let mut fitted = Vec::with_capacity(targets.len());
        for name in &targets {
            let Ok(series) = df.column(name) else {
                warn!("Column {} not found, skipping normalization", name);
                continue;
            };
            if column_kind(series) != ColumnKind::Numeric {
                return Err(not_numeric(name));
            }
            let values = numeric_values(series)?;
            let Some(params) = ScalerParams::fit(method, &present(&values)) else {
                warn!("Column {} has no values, skipping normalization", name);
                continue;
            };
            let scaled: Vec<Option<f64>> = values
                .iter()
                .map(|v| v.map(|x| params.transform(x)))
                .collect();
            out.with_column(Series::new(name.as_str(), scaled))?;
            fitted.push((name.clone(), params));
        }

        info!("Normalized {} columns with {:?}", fitted.len(), method);
        self.scalers.extend(fitted);
        Ok(out)
    }

    pub fn encode(
        &mut self,
        df: &DataFrame,
        columns: Option<&[String]>,
        method: EncodingMethod,
    ) -> Result<DataFrame> {
        let targets: Vec<String> = columns
            .map(<[String]>::to_vec)
            .unwrap_or_else(|| categorical_column_names(df))
            .into_iter()
            .filter(|name| {
                let found = df.column(name).is_ok();
                if !found {
                    warn!("Column {} not found, skipping encoding", name);
                }
                found
            })
            .collect();

        match method {
            EncodingMethod::Label => {
                let mut out = df.clone();
                let mut fitted = Vec::with_capacity(targets.len());
                for name in &targets {
                    let values = text_values(df.column(name)?)?;
                    let encoder = LabelEncoder::fit(&values);
                    let codes: Vec<Option<i64>> = values
                        .iter()
                        .map(|v| v.as_deref().and_then(|s| encoder.code(s)))
                        .collect();
                    debug!("Column {} has {} classes", name, encoder.classes.len());
                    out.with_column(Series::new(name.as_str(), codes))?;
                    fitted.push((name.clone(), encoder));
                }
                info!("Label-encoded {} columns", fitted.len());
                self.encoders.extend(fitted);
                Ok(out)
            }
            EncodingMethod::OneHot => {
                let mut taken: HashSet<String> = df
                    .get_column_names()
                    .into_iter()
                    .filter(|name| !targets.iter().any(|t| t == name))
                    .map(str::to_string)
                    .collect();
                let mut indicators = Vec::new();
                for name in &targets {
                    let values = text_values(df.column(name)?)?;
                    let classes: BTreeSet<&String> = values.iter().flatten().collect();
                    for class in classes {
                        let indicator = format!("{}_{}", name, class);
                        if !taken.insert(indicator.clone()) {
                            return Err(AppError::invalid(
                                "columns",
                                format!("indicator column '{}' already exists", indicator),
                            ));
                        }
                        let flags: Vec<i32> = values
                            .iter()
                            .map(|v| i32::from(v.as_ref() == Some(class)))
                            .collect();
                        indicators.push(Series::new(&indicator, flags));
                    }
                }

                let mut out = df.clone();
                for name in &targets {
                    out = out.drop(name)?;
                }
                let added = indicators.len();
                for indicator in indicators {
                    out.with_column(indicator)?;
                }
                info!("One-hot encoded {} columns into {} indicators", targets.len(), added);
                Ok(out)
            }
        }
    }

    /// Adds `<column>_binned`; an absent column leaves the frame unchanged.
    pub fn create_bins(
        &self,
        df: &DataFrame,
        column: &str,
        bins: &Bins,
        labels: Option<&[String]>,
    ) -> Result<DataFrame> {
        let Ok(series) = df.column(column) else {
            warn!("Column {} not found, binning skipped", column);
            return Ok(df.clone());
        };
        if column_kind(series) != ColumnKind::Numeric {
            return Err(AppError::invalid(
                "column",
                format!("column '{}' is not numeric", column),
            ));
        }

        let bin_count = bins.validate()?;
        if let Some(labels) = labels {
            if labels.len() != bin_count {
                return Err(AppError::invalid(
                    "labels",
                    format!("{} labels given for {} bins", labels.len(), bin_count),
                ));
            }
        }

        let values = numeric_values(series)?;
        let binned: Vec<Option<String>> = match bins.edges(&present(&values)) {
            Some(edges) => {
                let names = match labels {
                    Some(labels) => labels.to_vec(),
                    None => interval_labels(&edges),
                };
                values
                    .iter()
                    .map(|v| {
                        v.and_then(|x| bin_index(&edges, x))
                            .map(|i| names[i].clone())
                    })
                    .collect()
            }
            None => vec![None; values.len()],
        };

        let mut out = df.clone();
        out.with_column(Series::new(&format!("{}_binned", column), binned))?;
        info!("Binned {} into {} bins", column, bin_count);
        Ok(out)
    }
}
