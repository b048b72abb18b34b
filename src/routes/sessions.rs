use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{with_session, Preview, DEFAULT_PREVIEW_ROWS};
use crate::{
    error::{AppError, Result},
    models::{DataProfile, QualityIssues, QualityReport, Statistics},
    services::{
        chart::{self, ChartRequest, Figure},
        excel::SheetSelection,
        export::{self, ExportFormat, ExportOptions},
        loader::{self, DataLoader, FileFormat, LoadOptions},
        processor::FittedParams,
        profiler,
    },
    session::Operation,
    AppState,
};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sessions", post(create_session))
        .route("/sessions/:id", delete(delete_session))
        .route("/sessions/:id/sheets", post(list_sheets))
        .route("/sessions/:id/upload", post(upload))
        .route("/sessions/:id/preview", get(preview))
        .route("/sessions/:id/quality", get(quality))
        .route("/sessions/:id/statistics", get(statistics))
        .route("/sessions/:id/issues", get(issues))
        .route("/sessions/:id/profile", get(profile))
        .route("/sessions/:id/process", post(process))
        .route("/sessions/:id/reset", post(reset))
        .route("/sessions/:id/sample", post(sample))
        .route("/sessions/:id/fitted", get(fitted))
        .route("/sessions/:id/chart", post(render_chart))
        .route("/sessions/:id/export", get(export_table))
}

#[derive(Debug, Serialize)]
pub struct SessionCreated {
    session_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct UploadQuery {
    file_name: Option<String>,
    format: Option<String>,
    encoding: Option<String>,
    sheet: Option<String>,
    #[serde(default)]
    auto_detect_types: bool,
}

impl UploadQuery {
    fn into_options(self) -> Result<LoadOptions> {
        Ok(LoadOptions {
            format: self.format.as_deref().map(FileFormat::parse).transpose()?,
            file_name: self.file_name,
            encoding: self.encoding,
            sheet: self.sheet.as_deref().map(SheetSelection::parse),
            auto_detect_types: self.auto_detect_types,
        })
    }
}

/// `raw=true` reads the loaded table instead of the processed one.
#[derive(Debug, Default, Deserialize)]
pub struct TableQuery {
    #[serde(default)]
    raw: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct PreviewQuery {
    rows: Option<usize>,
    #[serde(default)]
    raw: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct SampleQuery {
    size: Option<usize>,
    seed: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ExportQuery {
    format: Option<String>,
    start: Option<usize>,
    end: Option<usize>,
    /// Comma separated column names.
    columns: Option<String>,
}

impl ExportQuery {
    fn options(&self) -> ExportOptions {
        let rows = match (self.start, self.end) {
            (None, None) => None,
            (start, end) => Some((start.unwrap_or(0), end.unwrap_or(usize::MAX))),
        };
        let columns = self.columns.as_ref().map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect()
        });
        ExportOptions { rows, columns }
    }
}

fn check_size(state: &AppState, body: &Bytes) -> Result<()> {
    if body.is_empty() {
        return Err(AppError::Load("Uploaded file is empty".to_string()));
    }
    if body.len() > state.config.max_file_size {
        tracing::error!(
            "Rejected upload of {} bytes (limit {})",
            body.len(),
            state.config.max_file_size
        );
        return Err(AppError::Load(format!(
            "File of {} bytes exceeds the limit of {} bytes",
            body.len(),
            state.config.max_file_size
        )));
    }
    Ok(())
}

async fn create_session(State(state): State<Arc<AppState>>) -> (StatusCode, Json<SessionCreated>) {
    let session_id = state.sessions.create();
    (StatusCode::CREATED, Json(SessionCreated { session_id }))
}

async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.sessions.remove(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_sheets(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Vec<String>>> {
    check_size(&state, &body)?;
    let data_loader = DataLoader::new(state.config.default_encoding.clone());
    let names = with_session(&state, &id, move |_| data_loader.list_sheets(&body)).await?;
    Ok(Json(names))
}

async fn upload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> Result<Json<QualityReport>> {
    let start = std::time::Instant::now();
    check_size(&state, &body)?;
    let options = query.into_options()?;
    tracing::info!(
        "Loading {} bytes into session {} (file {:?})",
        body.len(),
        id,
        options.file_name
    );

    let data_loader = DataLoader::new(state.config.default_encoding.clone());
    let report = with_session(&state, &id, move |session| {
        let df = data_loader.load(&body, &options)?;
        let report = loader::validate(&df)?;
        session.set_raw(df);
        Ok(report)
    })
    .await?;

    tracing::info!(
        "Loaded {} rows x {} columns in {:?}",
        report.total_rows,
        report.total_columns,
        start.elapsed()
    );
    Ok(Json(report))
}

async fn preview(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<PreviewQuery>,
) -> Result<Json<Preview>> {
    let rows = query.rows.unwrap_or(DEFAULT_PREVIEW_ROWS);
    let preview = with_session(&state, &id, move |session| {
        Preview::of(session.table(query.raw)?, rows)
    })
    .await?;
    Ok(Json(preview))
}

async fn quality(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<TableQuery>,
) -> Result<Json<QualityReport>> {
    let report = with_session(&state, &id, move |session| {
        loader::validate(session.table(query.raw)?)
    })
    .await?;
    Ok(Json(report))
}

async fn statistics(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<TableQuery>,
) -> Result<Json<Statistics>> {
    let stats = with_session(&state, &id, move |session| {
        profiler::calculate_statistics(session.table(query.raw)?)
    })
    .await?;
    Ok(Json(stats))
}

async fn issues(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<TableQuery>,
) -> Result<Json<QualityIssues>> {
    let issues = with_session(&state, &id, move |session| {
        profiler::detect_quality_issues(session.table(query.raw)?)
    })
    .await?;
    Ok(Json(issues))
}

async fn profile(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<TableQuery>,
) -> Result<Json<DataProfile>> {
    let profile = with_session(&state, &id, move |session| {
        profiler::generate_profile(session.table(query.raw)?)
    })
    .await?;
    Ok(Json(profile))
}

async fn process(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(operation): Json<Operation>,
) -> Result<Json<QualityReport>> {
    tracing::info!("Session {}: {:?}", id, operation);
    let report = with_session(&state, &id, move |session| {
        loader::validate(session.apply(&operation)?)
    })
    .await?;
    Ok(Json(report))
}

async fn reset(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<QualityReport>> {
    let report = with_session(&state, &id, |session| {
        session.reset();
        loader::validate(session.current()?)
    })
    .await?;
    Ok(Json(report))
}

async fn sample(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<SampleQuery>,
) -> Result<Json<QualityReport>> {
    let size = query.size.unwrap_or(state.config.sample_size);
    let seed = query.seed.unwrap_or(state.config.sample_seed);
    if size == 0 {
        return Err(AppError::invalid("size", "sample size must be positive"));
    }
    let report = with_session(&state, &id, move |session| {
        loader::validate(session.sample(size, seed)?)
    })
    .await?;
    Ok(Json(report))
}

async fn fitted(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<FittedParams>> {
    let params = with_session(&state, &id, |session| Ok(session.processor().fitted())).await?;
    Ok(Json(params))
}

async fn render_chart(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<ChartRequest>,
) -> Result<Json<Figure>> {
    let figure = with_session(&state, &id, move |session| {
        chart::render(session.current()?, &request)
    })
    .await?;
    Ok(Json(figure))
}

async fn export_table(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ExportQuery>,
) -> Result<Response> {
    let format: ExportFormat = query.format.as_deref().unwrap_or("csv").parse()?;
    let options = query.options();
    let file = with_session(&state, &id, move |session| {
        export::export(session.current()?, format, &options)
    })
    .await?;

    let disposition = format!("attachment; filename=\"{}\"", file.file_name);
    Ok((
        [
            (header::CONTENT_TYPE, file.content_type.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        file.bytes,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::services::processor::Bins;

    const CSV: &[u8] = b"city;age;score\nOslo;34;1.5\nLima;;2.5\nOslo;34;1.5\nRome;71;\n";

    fn state() -> Arc<AppState> {
        Arc::new(AppState::new(Config::default()))
    }

    async fn loaded(state: &Arc<AppState>) -> String {
        let Json(created) = create_session(State(state.clone())).await.1;
        let query = UploadQuery {
            file_name: Some("people.csv".into()),
            ..Default::default()
        };
        upload(
            State(state.clone()),
            Path(created.session_id.clone()),
            Query(query),
            Bytes::from_static(CSV),
        )
        .await
        .unwrap();
        created.session_id
    }

    #[tokio::test]
    async fn upload_reports_quality() {
        let state = state();
        let id = loaded(&state).await;
        let Json(report) = quality(State(state.clone()), Path(id), Query(TableQuery::default()))
            .await
            .unwrap();
        assert_eq!(report.total_rows, 4);
        assert_eq!(report.total_columns, 3);
        assert_eq!(report.missing_values, 2);
        assert_eq!(report.duplicate_rows, 1);
    }

    #[tokio::test]
    async fn empty_upload_is_rejected() {
        let state = state();
        let id = state.sessions.create();
        let err = upload(
            State(state.clone()),
            Path(id),
            Query(UploadQuery {
                format: Some("csv".into()),
                ..Default::default()
            }),
            Bytes::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Load(_)));
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let err = preview(
            State(state()),
            Path("missing".into()),
            Query(PreviewQuery::default()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn operations_chain_and_reset() {
        let state = state();
        let id = loaded(&state).await;

        let Json(report) = process(
            State(state.clone()),
            Path(id.clone()),
            Json(Operation::RemoveDuplicates { subset: None }),
        )
        .await
        .unwrap();
        assert_eq!(report.total_rows, 3);

        let Json(report) = process(
            State(state.clone()),
            Path(id.clone()),
            Json(Operation::HandleMissing { method: "drop".into() }),
        )
        .await
        .unwrap();
        assert_eq!(report.total_rows, 1);

        let Json(raw) = preview(
            State(state.clone()),
            Path(id.clone()),
            Query(PreviewQuery { rows: None, raw: true }),
        )
        .await
        .unwrap();
        assert_eq!(raw.total_rows, 4);

        let Json(report) = reset(State(state.clone()), Path(id)).await.unwrap();
        assert_eq!(report.total_rows, 4);
    }

    #[tokio::test]
    async fn fitted_parameters_follow_normalize() {
        let state = state();
        let id = loaded(&state).await;
        process(
            State(state.clone()),
            Path(id.clone()),
            Json(Operation::Normalize {
                columns: Some(vec!["age".into()]),
                method: "min-max".into(),
            }),
        )
        .await
        .unwrap();
        let Json(params) = fitted(State(state.clone()), Path(id)).await.unwrap();
        let body = serde_json::to_value(&params).unwrap();
        assert_eq!(body["scalers"]["age"]["method"], "minmax");
        assert_eq!(body["scalers"]["age"]["min"], 34.0);
    }

    #[tokio::test]
    async fn bad_bins_are_a_validation_error() {
        let state = state();
        let id = loaded(&state).await;
        let err = process(
            State(state.clone()),
            Path(id),
            Json(Operation::CreateBins {
                column: "age".into(),
                bins: Bins::Count(0),
                labels: None,
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Validation { ref parameter, .. } if parameter == "bins"));
    }

    #[tokio::test]
    async fn export_sets_download_headers() {
        let state = state();
        let id = loaded(&state).await;
        let response = export_table(
            State(state.clone()),
            Path(id),
            Query(ExportQuery {
                format: Some("json".into()),
                columns: Some("city, age".into()),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
        let disposition = response.headers()[header::CONTENT_DISPOSITION].to_str().unwrap();
        assert!(disposition.starts_with("attachment; filename=\"data_export_"));
        assert!(disposition.ends_with(".json\""));
    }

    #[tokio::test]
    async fn sample_is_seeded() {
        let state = state();
        let id = loaded(&state).await;
        let Json(report) = sample(
            State(state.clone()),
            Path(id),
            Query(SampleQuery { size: Some(2), seed: Some(7) }),
        )
        .await
        .unwrap();
        assert_eq!(report.total_rows, 2);
    }

    #[tokio::test]
    async fn chart_renders_from_current_table() {
        let state = state();
        let id = loaded(&state).await;
        let Json(figure) = render_chart(
            State(state.clone()),
            Path(id),
            Json(ChartRequest::Histogram {
                column: "age".into(),
                bins: 5,
                title: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(figure.data.len(), 1);
    }

    #[tokio::test]
    async fn deleted_session_is_gone() {
        let state = state();
        let id = state.sessions.create();
        assert_eq!(
            delete_session(State(state.clone()), Path(id.clone())).await.unwrap(),
            StatusCode::NO_CONTENT
        );
        assert!(delete_session(State(state), Path(id)).await.is_err());
    }
}
