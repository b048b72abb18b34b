//! Plotly-compatible figure builders. Each builder validates the column roles
//! it is given and returns a `Figure` that serialises to `{data, layout}`.

use polars::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::debug;

use crate::error::{AppError, Result};
use crate::models::ColumnKind;
use crate::services::frame::{
    column_json, column_kind, numeric_column_names, numeric_values, present, require_column,
    text_values,
};
use crate::services::stats;

const DEFAULT_HEIGHT: u32 = 500;
const TALL_HEIGHT: u32 = 600;
const PANEL_HEIGHT: u32 = 300;
const DEFAULT_HISTOGRAM_BINS: usize = 30;
const PATH_SEPARATOR: &str = "/";

#[derive(Debug, Clone, Serialize)]
pub struct Figure {
    pub data: Vec<Trace>,
    pub layout: Layout,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Trace {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<Vec<JsonValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<Vec<JsonValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub z: Option<Vec<Vec<Option<f64>>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r: Option<Vec<Option<f64>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub theta: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<JsonValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parents: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<JsonValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<Vec<Dimension>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nbinsx: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fill: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stackgroup: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub textinfo: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub textposition: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub texttemplate: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branchvalues: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub colorscale: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reversescale: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zmin: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zmax: Option<f64>,
    #[serde(rename = "box", skip_serializing_if = "Option::is_none")]
    pub box_options: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marker: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xaxis: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yaxis: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Dimension {
    pub label: String,
    pub values: Vec<JsonValue>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Title {
    pub text: String,
}

impl Title {
    fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Axis {
    pub title: Title,
}

#[derive(Debug, Clone, Serialize)]
pub struct Grid {
    pub rows: usize,
    pub columns: usize,
    pub pattern: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct Layout {
    pub title: Title,
    pub height: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub showlegend: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xaxis: Option<Axis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yaxis: Option<Axis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub polar: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grid: Option<Grid>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<JsonValue>,
}

impl Layout {
    fn new(title: String, height: u32) -> Self {
        Self {
            title: Title::new(title),
            height,
            showlegend: None,
            xaxis: None,
            yaxis: None,
            polar: None,
            grid: None,
            annotations: Vec::new(),
        }
    }

    fn axes(mut self, x: &str, y: &str) -> Self {
        self.xaxis = Some(Axis { title: Title::new(x) });
        self.yaxis = Some(Axis { title: Title::new(y) });
        self
    }

    fn legend(mut self, show: bool) -> Self {
        self.showlegend = Some(show);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PanelKind {
    Scatter,
    Bar,
    Line,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PanelSpec {
    #[serde(rename = "type", default = "default_panel_kind")]
    pub kind: PanelKind,
    pub x: String,
    pub y: String,
    pub title: Option<String>,
}

fn default_panel_kind() -> PanelKind {
    PanelKind::Scatter
}

fn default_histogram_bins() -> usize {
    DEFAULT_HISTOGRAM_BINS
}

/// One variant per chart kind, tagged by `kind`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChartRequest {
    Bar {
        x: String,
        y: String,
        color: Option<String>,
        title: Option<String>,
    },
    Line {
        x: String,
        y: String,
        color: Option<String>,
        title: Option<String>,
    },
    Scatter {
        x: String,
        y: String,
        color: Option<String>,
        size: Option<String>,
        title: Option<String>,
    },
    Pie {
        names: String,
        values: String,
        title: Option<String>,
    },
    Histogram {
        column: String,
        #[serde(default = "default_histogram_bins")]
        bins: usize,
        title: Option<String>,
    },
    Box {
        y: String,
        x: Option<String>,
        title: Option<String>,
    },
    Heatmap {
        title: Option<String>,
    },
    Area {
        x: String,
        y: String,
        color: Option<String>,
        title: Option<String>,
    },
    Radar {
        columns: Vec<String>,
        group: Option<String>,
        title: Option<String>,
    },
    Violin {
        y: String,
        x: Option<String>,
        title: Option<String>,
    },
    Sunburst {
        path: Vec<String>,
        values: String,
        title: Option<String>,
    },
    Treemap {
        path: Vec<String>,
        values: String,
        title: Option<String>,
    },
    ParallelCoordinates {
        columns: Vec<String>,
        color: Option<String>,
        title: Option<String>,
    },
    Dashboard {
        charts: Vec<PanelSpec>,
    },
}

pub fn render(df: &DataFrame, request: &ChartRequest) -> Result<Figure> {
    debug!("Rendering {:?}", request);
    match request {
        ChartRequest::Bar { x, y, color, title } => {
            bar_chart(df, x, y, color.as_deref(), title.as_deref())
        }
        ChartRequest::Line { x, y, color, title } => {
            line_chart(df, x, y, color.as_deref(), title.as_deref())
        }
        ChartRequest::Scatter { x, y, color, size, title } => {
            scatter_plot(df, x, y, color.as_deref(), size.as_deref(), title.as_deref())
        }
        ChartRequest::Pie { names, values, title } => {
            pie_chart(df, names, values, title.as_deref())
        }
        ChartRequest::Histogram { column, bins, title } => {
            histogram(df, column, *bins, title.as_deref())
        }
        ChartRequest::Box { y, x, title } => box_plot(df, y, x.as_deref(), title.as_deref()),
        ChartRequest::Heatmap { title } => heatmap(df, title.as_deref()),
        ChartRequest::Area { x, y, color, title } => {
            area_chart(df, x, y, color.as_deref(), title.as_deref())
        }
        ChartRequest::Radar { columns, group, title } => {
            radar_chart(df, columns, group.as_deref(), title.as_deref())
        }
        ChartRequest::Violin { y, x, title } => {
            violin_plot(df, y, x.as_deref(), title.as_deref())
        }
        ChartRequest::Sunburst { path, values, title } => {
            sunburst_chart(df, path, values, title.as_deref())
        }
        ChartRequest::Treemap { path, values, title } => {
            treemap(df, path, values, title.as_deref())
        }
        ChartRequest::ParallelCoordinates { columns, color, title } => {
            parallel_coordinates(df, columns, color.as_deref(), title.as_deref())
        }
        ChartRequest::Dashboard { charts } => dashboard(df, charts),
    }
}

fn title_or(title: Option<&str>, default: impl FnOnce() -> String) -> String {
    title.map(str::to_string).unwrap_or_else(default)
}

fn numeric_column<'a>(df: &'a DataFrame, parameter: &str, name: &str) -> Result<&'a Series> {
    let series = require_column(df, parameter, name)?;
    if column_kind(series) != ColumnKind::Numeric {
        return Err(AppError::invalid(
            parameter,
            format!("column '{}' is not numeric", name),
        ));
    }
    Ok(series)
}

fn pick(values: &[JsonValue], rows: &[usize]) -> Vec<JsonValue> {
    rows.iter().map(|&row| values[row].clone()).collect()
}

/// Row indices per distinct value of `color`, in order of first appearance.
/// Rows with a missing group value are left out.
fn groups(df: &DataFrame, color: Option<&str>, parameter: &str) -> Result<Vec<(Option<String>, Vec<usize>)>> {
    let Some(name) = color else {
        return Ok(vec![(None, (0..df.height()).collect())]);
    };
    let keys = text_values(require_column(df, parameter, name)?)?;
    let mut order: Vec<(Option<String>, Vec<usize>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for (row, key) in keys.into_iter().enumerate() {
        let Some(key) = key else { continue };
        let slot = *index.entry(key.clone()).or_insert_with(|| {
            order.push((Some(key), Vec::new()));
            order.len() - 1
        });
        order[slot].1.push(row);
    }
    Ok(order)
}

fn nulls_last<T>(a: &Option<T>, b: &Option<T>, cmp: impl Fn(&T, &T) -> Ordering) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => cmp(a, b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Stable ascending row order over one column, missing values last.
fn sorted_rows(series: &Series) -> Result<Vec<usize>> {
    let mut rows: Vec<usize> = (0..series.len()).collect();
    match column_kind(series) {
        ColumnKind::Numeric => {
            let values = numeric_values(series)?;
            rows.sort_by(|&a, &b| nulls_last(&values[a], &values[b], f64::total_cmp));
        }
        ColumnKind::Datetime => {
            let physical = series.to_physical_repr().cast(&DataType::Int64)?;
            let values: Vec<Option<i64>> = physical.i64()?.into_iter().collect();
            rows.sort_by(|&a, &b| nulls_last(&values[a], &values[b], Ord::cmp));
        }
        _ => {
            let values = text_values(series)?;
            rows.sort_by(|&a, &b| nulls_last(&values[a], &values[b], Ord::cmp));
        }
    }
    Ok(rows)
}

/// Sums `value` over the distinct combinations of `keys`, in first-seen order.
fn sum_by(df: &DataFrame, keys: &[&str], value: &str) -> Result<DataFrame> {
    let lf = keys
        .iter()
        .fold(df.clone().lazy(), |lf, key| lf.filter(col(key).is_not_null()));
    let by: Vec<Expr> = keys.iter().map(|key| col(key)).collect();
    Ok(lf.group_by_stable(by).agg([col(value).sum()]).collect()?)
}

fn xy_traces(
    df: &DataFrame,
    x: &str,
    y: &str,
    color: Option<&str>,
    rows: &[usize],
    template: Trace,
) -> Result<Vec<Trace>> {
    let xs = column_json(require_column(df, "x", x)?)?;
    let ys = column_json(require_column(df, "y", y)?)?;
    let mut traces = Vec::new();
    for (name, members) in groups(df, color, "color")? {
        let selected: Vec<usize> = rows.iter().copied().filter(|r| members.binary_search(r).is_ok()).collect();
        traces.push(Trace {
            name,
            x: Some(pick(&xs, &selected)),
            y: Some(pick(&ys, &selected)),
            ..template.clone()
        });
    }
    Ok(traces)
}

pub fn bar_chart(df: &DataFrame, x: &str, y: &str, color: Option<&str>, title: Option<&str>) -> Result<Figure> {
    let title = title_or(title, || format!("{} by {}", y, x));
    let x_series = require_column(df, "x", x)?;
    require_column(df, "y", y)?;

    let data = if column_kind(x_series) == ColumnKind::Numeric && color.is_none() {
        numeric_column(df, "y", y)?;
        let grouped = sum_by(df, &[x], y)?;
        vec![Trace {
            kind: "bar",
            x: Some(column_json(grouped.column(x)?)?),
            y: Some(column_json(grouped.column(y)?)?),
            ..Trace::default()
        }]
    } else {
        let rows: Vec<usize> = (0..df.height()).collect();
        xy_traces(df, x, y, color, &rows, Trace { kind: "bar", ..Trace::default() })?
    };

    Ok(Figure {
        data,
        layout: Layout::new(title, DEFAULT_HEIGHT).axes(x, y).legend(color.is_some()),
    })
}

pub fn line_chart(df: &DataFrame, x: &str, y: &str, color: Option<&str>, title: Option<&str>) -> Result<Figure> {
    let title = title_or(title, || format!("{} over {}", y, x));
    let rows = sorted_rows(require_column(df, "x", x)?)?;
    let template = Trace {
        kind: "scatter",
        mode: Some("lines+markers"),
        ..Trace::default()
    };
    Ok(Figure {
        data: xy_traces(df, x, y, color, &rows, template)?,
        layout: Layout::new(title, DEFAULT_HEIGHT).axes(x, y).legend(color.is_some()),
    })
}

pub fn area_chart(df: &DataFrame, x: &str, y: &str, color: Option<&str>, title: Option<&str>) -> Result<Figure> {
    let title = title_or(title, || format!("{} over {} (area)", y, x));
    let rows = sorted_rows(require_column(df, "x", x)?)?;
    let template = Trace {
        kind: "scatter",
        mode: Some("lines"),
        stackgroup: Some("one"),
        ..Trace::default()
    };
    Ok(Figure {
        data: xy_traces(df, x, y, color, &rows, template)?,
        layout: Layout::new(title, DEFAULT_HEIGHT).axes(x, y).legend(color.is_some()),
    })
}

pub fn scatter_plot(
    df: &DataFrame,
    x: &str,
    y: &str,
    color: Option<&str>,
    size: Option<&str>,
    title: Option<&str>,
) -> Result<Figure> {
    let title = title_or(title, || format!("{} vs {}", y, x));
    let sizes = match size {
        Some(name) => Some(column_json(numeric_column(df, "size", name)?)?),
        None => None,
    };
    let template = Trace {
        kind: "scatter",
        mode: Some("markers"),
        ..Trace::default()
    };
    let mut data = Vec::new();
    for (name, members) in groups(df, color, "color")? {
        let mut trace = xy_traces(df, x, y, None, &members, template.clone())?.remove(0);
        trace.name = name;
        if let Some(sizes) = &sizes {
            trace.marker = Some(json!({ "size": pick(sizes, &members), "sizemode": "area" }));
        }
        data.push(trace);
    }
    debug!("Scatter over {} rows in {} groups", df.height(), data.len());
    Ok(Figure {
        data,
        layout: Layout::new(title, DEFAULT_HEIGHT).axes(x, y).legend(color.is_some()),
    })
}

pub fn pie_chart(df: &DataFrame, names: &str, values: &str, title: Option<&str>) -> Result<Figure> {
    let title = title_or(title, || format!("Distribution of {}", names));
    require_column(df, "names", names)?;
    numeric_column(df, "values", values)?;
    let grouped = sum_by(df, &[names], values)?;
    Ok(Figure {
        data: vec![Trace {
            kind: "pie",
            labels: Some(column_json(grouped.column(names)?)?),
            values: Some(column_json(grouped.column(values)?)?),
            textinfo: Some("percent+label"),
            textposition: Some("inside"),
            ..Trace::default()
        }],
        layout: Layout::new(title, DEFAULT_HEIGHT),
    })
}

pub fn histogram(df: &DataFrame, column: &str, bins: usize, title: Option<&str>) -> Result<Figure> {
    if bins == 0 {
        return Err(AppError::invalid("bins", "bin count must be at least 1"));
    }
    let title = title_or(title, || format!("Distribution of {}", column));
    let series = require_column(df, "column", column)?;
    Ok(Figure {
        data: vec![Trace {
            kind: "histogram",
            x: Some(column_json(series)?),
            nbinsx: Some(bins),
            ..Trace::default()
        }],
        layout: Layout::new(title, DEFAULT_HEIGHT).axes(column, "Count"),
    })
}

fn distribution(
    df: &DataFrame,
    kind: &'static str,
    y: &str,
    x: Option<&str>,
    title: String,
    box_options: Option<JsonValue>,
) -> Result<Figure> {
    let ys = column_json(numeric_column(df, "y", y)?)?;
    let xs = match x {
        Some(name) => Some(column_json(require_column(df, "x", name)?)?),
        None => None,
    };
    Ok(Figure {
        data: vec![Trace {
            kind,
            x: xs,
            y: Some(ys),
            box_options,
            ..Trace::default()
        }],
        layout: Layout::new(title, DEFAULT_HEIGHT).axes(x.unwrap_or(""), y),
    })
}

pub fn box_plot(df: &DataFrame, y: &str, x: Option<&str>, title: Option<&str>) -> Result<Figure> {
    let title = title_or(title, || format!("{} box plot", y));
    distribution(df, "box", y, x, title, None)
}

pub fn violin_plot(df: &DataFrame, y: &str, x: Option<&str>, title: Option<&str>) -> Result<Figure> {
    let title = title_or(title, || format!("{} violin plot", y));
    distribution(df, "violin", y, x, title, Some(json!({ "visible": true })))
}

/// Pearson correlation of every numeric column pair.
pub fn heatmap(df: &DataFrame, title: Option<&str>) -> Result<Figure> {
    let title = title_or(title, || "Correlation heatmap".to_string());
    let names = numeric_column_names(df);
    if names.is_empty() {
        return Err(AppError::invalid(
            "columns",
            "no numeric columns available for a correlation heatmap",
        ));
    }
    let columns = names
        .iter()
        .map(|name| numeric_values(df.column(name)?))
        .collect::<Result<Vec<_>>>()?;
    let z: Vec<Vec<Option<f64>>> = columns
        .iter()
        .map(|a| columns.iter().map(|b| stats::pearson(a, b)).collect())
        .collect();

    let axis: Vec<JsonValue> = names.iter().map(|n| JsonValue::String(n.clone())).collect();
    Ok(Figure {
        data: vec![Trace {
            kind: "heatmap",
            x: Some(axis.clone()),
            y: Some(axis),
            z: Some(z),
            colorscale: Some("RdBu"),
            reversescale: Some(true),
            zmin: Some(-1.0),
            zmax: Some(1.0),
            texttemplate: Some("%{z:.2f}"),
            ..Trace::default()
        }],
        layout: Layout::new(title, TALL_HEIGHT),
    })
}

/// Mean of each column per group; the polygon is closed by repeating the
/// first axis.
pub fn radar_chart(df: &DataFrame, columns: &[String], group: Option<&str>, title: Option<&str>) -> Result<Figure> {
    let title = title_or(title, || "Radar chart".to_string());
    let Some(first) = columns.first() else {
        return Err(AppError::invalid("columns", "at least one column is required"));
    };
    let values = columns
        .iter()
        .map(|name| numeric_values(numeric_column(df, "columns", name)?))
        .collect::<Result<Vec<_>>>()?;

    let mut theta = columns.to_vec();
    theta.push(first.clone());

    let mut data = Vec::new();
    for (name, rows) in groups(df, group, "group")? {
        let mut r: Vec<Option<f64>> = values
            .iter()
            .map(|column| {
                let selected: Vec<f64> = rows.iter().filter_map(|&row| column[row]).collect();
                stats::mean(&selected)
            })
            .collect();
        r.push(r[0]);
        data.push(Trace {
            kind: "scatterpolar",
            name: Some(name.unwrap_or_else(|| "Data".to_string())),
            r: Some(r),
            theta: Some(theta.clone()),
            fill: Some("toself"),
            ..Trace::default()
        });
    }

    let radial_max = values
        .iter()
        .filter_map(|column| stats::max(&present(column)))
        .fold(0.0_f64, f64::max);
    let mut layout = Layout::new(title, DEFAULT_HEIGHT).legend(true);
    layout.polar = Some(json!({ "radialaxis": { "visible": true, "range": [0.0, radial_max] } }));
    Ok(Figure { data, layout })
}

struct Hierarchy {
    ids: Vec<String>,
    labels: Vec<JsonValue>,
    parents: Vec<String>,
    values: Vec<f64>,
}

/// Node per distinct path prefix, valued by the sum of its leaves.
fn hierarchy(df: &DataFrame, path: &[String], values: &str) -> Result<Hierarchy> {
    if path.is_empty() {
        return Err(AppError::invalid("path", "at least one path column is required"));
    }
    numeric_column(df, "values", values)?;
    for name in path {
        require_column(df, "path", name)?;
    }
    let keys: Vec<&str> = path.iter().map(String::as_str).collect();
    let grouped = sum_by(df, &keys, values)?;

    let levels = path
        .iter()
        .map(|name| text_values(grouped.column(name)?))
        .collect::<Result<Vec<_>>>()?;
    let sums = numeric_values(grouped.column(values)?)?;

    let mut tree = Hierarchy {
        ids: Vec::new(),
        labels: Vec::new(),
        parents: Vec::new(),
        values: Vec::new(),
    };
    let mut index: HashMap<String, usize> = HashMap::new();
    for (row, sum) in sums.iter().enumerate() {
        let mut parent = String::new();
        for level in &levels {
            let label = level[row].clone().unwrap_or_default();
            let id = if parent.is_empty() {
                label.clone()
            } else {
                format!("{}{}{}", parent, PATH_SEPARATOR, label)
            };
            let slot = *index.entry(id.clone()).or_insert_with(|| {
                tree.ids.push(id.clone());
                tree.labels.push(JsonValue::String(label));
                tree.parents.push(parent.clone());
                tree.values.push(0.0);
                tree.ids.len() - 1
            });
            tree.values[slot] += sum.unwrap_or(0.0);
            parent = id;
        }
    }
    Ok(tree)
}

fn hierarchical(df: &DataFrame, kind: &'static str, path: &[String], values: &str, title: String) -> Result<Figure> {
    let tree = hierarchy(df, path, values)?;
    Ok(Figure {
        data: vec![Trace {
            kind,
            ids: Some(tree.ids),
            labels: Some(tree.labels),
            parents: Some(tree.parents),
            values: Some(tree.values.into_iter().map(JsonValue::from).collect()),
            branchvalues: Some("total"),
            ..Trace::default()
        }],
        layout: Layout::new(title, TALL_HEIGHT),
    })
}

pub fn sunburst_chart(df: &DataFrame, path: &[String], values: &str, title: Option<&str>) -> Result<Figure> {
    let title = title_or(title, || "Sunburst chart".to_string());
    hierarchical(df, "sunburst", path, values, title)
}

pub fn treemap(df: &DataFrame, path: &[String], values: &str, title: Option<&str>) -> Result<Figure> {
    let title = title_or(title, || "Treemap".to_string());
    hierarchical(df, "treemap", path, values, title)
}

pub fn parallel_coordinates(
    df: &DataFrame,
    columns: &[String],
    color: Option<&str>,
    title: Option<&str>,
) -> Result<Figure> {
    let title = title_or(title, || "Parallel coordinates".to_string());
    if columns.is_empty() {
        return Err(AppError::invalid("columns", "at least one column is required"));
    }
    let dimensions = columns
        .iter()
        .map(|name| {
            Ok(Dimension {
                label: name.clone(),
                values: column_json(numeric_column(df, "columns", name)?)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let line = match color {
        Some(name) => Some(json!({ "color": column_json(numeric_column(df, "color", name)?)? })),
        None => None,
    };
    Ok(Figure {
        data: vec![Trace {
            kind: "parcoords",
            dimensions: Some(dimensions),
            line,
            ..Trace::default()
        }],
        layout: Layout::new(title, TALL_HEIGHT),
    })
}

/// Grid shape for `n` panels: one row for up to two, 2x2 up to four,
/// otherwise rows of three.
pub fn grid_shape(n: usize) -> (usize, usize) {
    match n {
        0..=2 => (1, n.max(1)),
        3..=4 => (2, 2),
        _ => ((n + 2) / 3, 3),
    }
}

fn axis_ref(prefix: &str, index: usize) -> String {
    if index == 0 {
        prefix.to_string()
    } else {
        format!("{}{}", prefix, index + 1)
    }
}

pub fn dashboard(df: &DataFrame, charts: &[PanelSpec]) -> Result<Figure> {
    if charts.is_empty() {
        return Err(AppError::invalid("charts", "at least one chart is required"));
    }
    let (rows, columns) = grid_shape(charts.len());

    let mut data = Vec::with_capacity(charts.len());
    let mut annotations = Vec::with_capacity(charts.len());
    for (i, spec) in charts.iter().enumerate() {
        let xs = column_json(require_column(df, "x", &spec.x)?)?;
        let ys = column_json(require_column(df, "y", &spec.y)?)?;
        let (kind, mode) = match spec.kind {
            PanelKind::Scatter => ("scatter", Some("markers")),
            PanelKind::Bar => ("bar", None),
            PanelKind::Line => ("scatter", Some("lines")),
        };
        let xaxis = axis_ref("x", i);
        let yaxis = axis_ref("y", i);
        let title = spec.title.clone().unwrap_or_else(|| format!("Chart {}", i + 1));
        annotations.push(json!({
            "text": title,
            "xref": format!("{} domain", xaxis),
            "yref": format!("{} domain", yaxis),
            "x": 0.5,
            "y": 1.0,
            "yanchor": "bottom",
            "showarrow": false,
        }));
        data.push(Trace {
            kind,
            mode,
            x: Some(xs),
            y: Some(ys),
            xaxis: Some(xaxis),
            yaxis: Some(yaxis),
            ..Trace::default()
        });
    }

    let mut layout = Layout::new("Data analysis dashboard".to_string(), PANEL_HEIGHT * rows as u32)
        .legend(false);
    layout.grid = Some(Grid {
        rows,
        columns,
        pattern: "independent",
    });
    layout.annotations = annotations;
    Ok(Figure { data, layout })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sales() -> DataFrame {
        df!(
            "region" => &["north", "south", "north", "east"],
            "city" => &["a", "b", "c", "d"],
            "units" => &[1i64, 2, 1, 3],
            "revenue" => &[10.0, 20.0, 30.0, 40.0],
            "cost" => &[5.0, 10.0, 15.0, 20.0]
        )
        .unwrap()
    }

    fn to_json(figure: &Figure) -> JsonValue {
        serde_json::to_value(figure).unwrap()
    }

    #[test]
    fn numeric_bar_axis_is_summed() {
        let figure = bar_chart(&sales(), "units", "revenue", None, None).unwrap();
        let json = to_json(&figure);
        assert_eq!(json["data"][0]["type"], "bar");
        assert_eq!(json["data"][0]["x"], json!([1, 2, 3]));
        assert_eq!(json["data"][0]["y"], json!([40.0, 20.0, 40.0]));
        assert_eq!(json["layout"]["title"]["text"], "revenue by units");
        assert_eq!(json["layout"]["showlegend"], false);
    }

    #[test]
    fn colored_bar_splits_traces() {
        let figure = bar_chart(&sales(), "city", "revenue", Some("region"), None).unwrap();
        let names: Vec<_> = figure.data.iter().map(|t| t.name.clone().unwrap()).collect();
        assert_eq!(names, vec!["north", "south", "east"]);
        assert_eq!(figure.data[0].x.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn line_chart_sorts_by_x() {
        let df = df!("t" => &[3i64, 1, 2], "v" => &[30.0, 10.0, 20.0]).unwrap();
        let figure = line_chart(&df, "t", "v", None, None).unwrap();
        assert_eq!(figure.data[0].x.as_ref().unwrap(), &vec![json!(1), json!(2), json!(3)]);
        assert_eq!(figure.data[0].y.as_ref().unwrap(), &vec![json!(10.0), json!(20.0), json!(30.0)]);
    }

    #[test]
    fn pie_aggregates_by_name() {
        let figure = pie_chart(&sales(), "region", "revenue", None).unwrap();
        let json = to_json(&figure);
        assert_eq!(json["data"][0]["labels"], json!(["north", "south", "east"]));
        assert_eq!(json["data"][0]["values"], json!([40.0, 20.0, 40.0]));
    }

    #[test]
    fn heatmap_needs_numbers() {
        let figure = heatmap(&sales(), None).unwrap();
        let z = figure.data[0].z.as_ref().unwrap();
        assert_eq!(z.len(), 3);
        assert!((z[1][2].unwrap() - 1.0).abs() < 1e-12);

        let text = df!("t" => &["a"]).unwrap();
        assert!(matches!(heatmap(&text, None), Err(AppError::Validation { .. })));
    }

    #[test]
    fn radar_closes_polygon() {
        let columns = vec!["revenue".to_string(), "cost".to_string()];
        let figure = radar_chart(&sales(), &columns, Some("region"), None).unwrap();
        assert_eq!(figure.data.len(), 3);
        let north = &figure.data[0];
        assert_eq!(north.r.as_ref().unwrap(), &vec![Some(20.0), Some(10.0), Some(20.0)]);
        assert_eq!(north.theta.as_ref().unwrap(), &vec!["revenue", "cost", "revenue"]);
        let json = to_json(&figure);
        assert_eq!(json["layout"]["polar"]["radialaxis"]["range"], json!([0.0, 40.0]));
    }

    #[test]
    fn treemap_builds_parent_links() {
        let path = vec!["region".to_string(), "city".to_string()];
        let figure = treemap(&sales(), &path, "revenue", None).unwrap();
        let trace = &figure.data[0];
        let ids = trace.ids.as_ref().unwrap();
        let parents = trace.parents.as_ref().unwrap();
        let north = ids.iter().position(|id| id == "north").unwrap();
        let north_c = ids.iter().position(|id| id == "north/c").unwrap();
        assert_eq!(parents[north], "");
        assert_eq!(parents[north_c], "north");
        assert_eq!(trace.values.as_ref().unwrap()[north], json!(40.0));
    }

    #[test]
    fn dashboard_layout_follows_panel_count() {
        assert_eq!(grid_shape(1), (1, 1));
        assert_eq!(grid_shape(2), (1, 2));
        assert_eq!(grid_shape(4), (2, 2));
        assert_eq!(grid_shape(5), (2, 3));
        assert_eq!(grid_shape(7), (3, 3));

        let panels: Vec<PanelSpec> = serde_json::from_value(json!([
            {"x": "units", "y": "revenue"},
            {"type": "bar", "x": "region", "y": "cost", "title": "Cost"},
            {"type": "line", "x": "units", "y": "cost"}
        ]))
        .unwrap();
        let figure = dashboard(&sales(), &panels).unwrap();
        assert_eq!(figure.layout.height, 600);
        assert_eq!(figure.data[2].xaxis.as_deref(), Some("x3"));
        assert_eq!(figure.layout.annotations[1]["text"], "Cost");
    }

    #[test]
    fn requests_dispatch_and_validate_columns() {
        let request: ChartRequest =
            serde_json::from_value(json!({"kind": "histogram", "column": "revenue"})).unwrap();
        let figure = render(&sales(), &request).unwrap();
        assert_eq!(figure.data[0].nbinsx, Some(30));

        let request: ChartRequest =
            serde_json::from_value(json!({"kind": "scatter", "x": "nope", "y": "cost"})).unwrap();
        let err = render(&sales(), &request).unwrap_err();
        assert!(matches!(err, AppError::Validation { ref parameter, .. } if parameter == "x"));
    }
}
