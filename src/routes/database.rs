use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{with_session, Preview, DEFAULT_PREVIEW_ROWS};
use crate::{
    error::Result,
    models::QualityReport,
    services::{
        db_connector::{ColumnStats, ConnectParams, DatabaseInfo, DbConnection, IfExists, TableSchema},
        loader,
    },
    AppState,
};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sessions/:id/db", delete(close))
        .route("/sessions/:id/db/connect", post(connect))
        .route("/sessions/:id/db/info", get(info))
        .route("/sessions/:id/db/tables", get(list_tables))
        .route("/sessions/:id/db/tables/:table", delete(drop_table))
        .route("/sessions/:id/db/tables/:table/schema", get(schema))
        .route("/sessions/:id/db/tables/:table/count", get(count))
        .route(
            "/sessions/:id/db/tables/:table/columns/:column/stats",
            get(column_stats),
        )
        .route("/sessions/:id/db/load", post(load_table))
        .route("/sessions/:id/db/query", post(run_query))
        .route("/sessions/:id/db/write", post(write_table))
        .route("/sessions/:id/db/backup", post(backup_table))
}

#[derive(Debug, Deserialize)]
pub struct LoadTableRequest {
    table: String,
    limit: Option<usize>,
    filter: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    sql: String,
    rows: Option<usize>,
    /// Replace the session table with the result.
    #[serde(default)]
    load: bool,
}

#[derive(Debug, Deserialize)]
pub struct WriteRequest {
    table: String,
    #[serde(default)]
    if_exists: IfExists,
}

#[derive(Debug, Deserialize)]
pub struct BackupRequest {
    table: String,
    backup: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RowCount {
    table: String,
    row_count: i64,
}

#[derive(Debug, Serialize)]
pub struct WriteResult {
    table: String,
    rows_written: usize,
}

#[derive(Debug, Serialize)]
pub struct BackupResult {
    table: String,
    backup: String,
}

fn default_backup_name(table: &str) -> String {
    format!("{}_backup_{}", table, chrono::Local::now().format("%Y%m%d_%H%M%S"))
}

async fn connect(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(params): Json<ConnectParams>,
) -> Result<Json<DatabaseInfo>> {
    let info = with_session(&state, &id, move |session| {
        let connection = DbConnection::connect(&params)?;
        let info = connection.database_info()?;
        session.set_connection(connection)?;
        Ok(info)
    })
    .await?;
    tracing::info!("Session {} connected to {}", id, info.database);
    Ok(Json(info))
}

async fn close(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<StatusCode> {
    with_session(&state, &id, |session| session.close_connection()).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn info(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DatabaseInfo>> {
    let info = with_session(&state, &id, |session| session.connection()?.database_info()).await?;
    Ok(Json(info))
}

async fn list_tables(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<String>>> {
    let tables = with_session(&state, &id, |session| session.connection()?.list_tables()).await?;
    Ok(Json(tables))
}

async fn schema(
    State(state): State<Arc<AppState>>,
    Path((id, table)): Path<(String, String)>,
) -> Result<Json<TableSchema>> {
    let schema = with_session(&state, &id, move |session| {
        session.connection()?.table_schema(&table)
    })
    .await?;
    Ok(Json(schema))
}

async fn count(
    State(state): State<Arc<AppState>>,
    Path((id, table)): Path<(String, String)>,
) -> Result<Json<RowCount>> {
    let count = with_session(&state, &id, move |session| {
        let row_count = session.connection()?.row_count(&table)?;
        Ok(RowCount { table, row_count })
    })
    .await?;
    Ok(Json(count))
}

async fn column_stats(
    State(state): State<Arc<AppState>>,
    Path((id, table, column)): Path<(String, String, String)>,
) -> Result<Json<ColumnStats>> {
    let stats = with_session(&state, &id, move |session| {
        session.connection()?.column_stats(&table, &column)
    })
    .await?;
    Ok(Json(stats))
}

async fn drop_table(
    State(state): State<Arc<AppState>>,
    Path((id, table)): Path<(String, String)>,
) -> Result<StatusCode> {
    with_session(&state, &id, move |session| session.connection()?.drop_table(&table)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn load_table(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<LoadTableRequest>,
) -> Result<Json<QualityReport>> {
    let report = with_session(&state, &id, move |session| {
        let df = session.connection()?.load_table(
            &request.table,
            request.limit,
            request.filter.as_deref(),
        )?;
        let report = loader::validate(&df)?;
        session.set_raw(df);
        Ok(report)
    })
    .await?;
    Ok(Json(report))
}

async fn run_query(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<Preview>> {
    let preview = with_session(&state, &id, move |session| {
        let df = session.connection()?.run_query(&request.sql)?;
        let preview = Preview::of(&df, request.rows.unwrap_or(DEFAULT_PREVIEW_ROWS))?;
        if request.load {
            session.set_raw(df);
        }
        Ok(preview)
    })
    .await?;
    Ok(Json(preview))
}

async fn write_table(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<WriteRequest>,
) -> Result<Json<WriteResult>> {
    let result = with_session(&state, &id, move |session| {
        let df = session.current()?.clone();
        let rows_written =
            session
                .connection_mut()?
                .write_table(&df, &request.table, request.if_exists)?;
        Ok(WriteResult {
            table: request.table,
            rows_written,
        })
    })
    .await?;
    Ok(Json(result))
}

async fn backup_table(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<BackupRequest>,
) -> Result<Json<BackupResult>> {
    let result = with_session(&state, &id, move |session| {
        let backup = request
            .backup
            .unwrap_or_else(|| default_backup_name(&request.table));
        session.connection()?.backup_table(&request.table, &backup)?;
        Ok(BackupResult {
            table: request.table,
            backup,
        })
    })
    .await?;
    Ok(Json(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::AppError;
    use polars::df;
    use polars::prelude::NamedFrom;

    fn memory_params() -> ConnectParams {
        serde_json::from_str(r#"{"kind": "sqlite", "database": ":memory:"}"#).unwrap()
    }

    async fn connected() -> (Arc<AppState>, String) {
        let state = Arc::new(AppState::new(Config::default()));
        let id = state.sessions.create();
        state.sessions.get(&id).unwrap().lock().set_raw(
            df!(
                "name" => &["ann", "bob", "cy"],
                "score" => &[Some(1.5), None, Some(3.0)]
            )
            .unwrap(),
        );
        connect(State(state.clone()), Path(id.clone()), Json(memory_params()))
            .await
            .unwrap();
        (state, id)
    }

    async fn write(state: &Arc<AppState>, id: &str, table: &str) -> usize {
        let request = WriteRequest {
            table: table.into(),
            if_exists: IfExists::Fail,
        };
        let Json(result) = write_table(State(state.clone()), Path(id.into()), Json(request))
            .await
            .unwrap();
        result.rows_written
    }

    #[tokio::test]
    async fn write_then_inspect_table() {
        let (state, id) = connected().await;
        assert_eq!(write(&state, &id, "people").await, 3);

        let Json(tables) = list_tables(State(state.clone()), Path(id.clone())).await.unwrap();
        assert_eq!(tables, vec!["people".to_string()]);

        let Json(rows) = count(State(state.clone()), Path((id.clone(), "people".into())))
            .await
            .unwrap();
        assert_eq!(rows.row_count, 3);

        let Json(stats) = column_stats(
            State(state.clone()),
            Path((id.clone(), "people".into(), "score".into())),
        )
        .await
        .unwrap();
        assert_eq!(stats.null_count, 1);

        let Json(layout) = schema(State(state.clone()), Path((id, "people".into())))
            .await
            .unwrap();
        assert_eq!(layout.columns.len(), 2);
    }

    #[tokio::test]
    async fn query_can_replace_session_table() {
        let (state, id) = connected().await;
        write(&state, &id, "people").await;

        let request = QueryRequest {
            sql: "SELECT name FROM people WHERE score IS NOT NULL".into(),
            rows: None,
            load: true,
        };
        let Json(preview) = run_query(State(state.clone()), Path(id.clone()), Json(request))
            .await
            .unwrap();
        assert_eq!(preview.total_rows, 2);

        let session = state.sessions.get(&id).unwrap();
        let guard = session.lock();
        assert_eq!(guard.raw().unwrap().width(), 1);
    }

    #[tokio::test]
    async fn load_and_backup_tables() {
        let (state, id) = connected().await;
        write(&state, &id, "people").await;

        let request = LoadTableRequest {
            table: "people".into(),
            limit: Some(2),
            filter: None,
        };
        let Json(report) = load_table(State(state.clone()), Path(id.clone()), Json(request))
            .await
            .unwrap();
        assert_eq!(report.total_rows, 2);

        let Json(backup) = backup_table(
            State(state.clone()),
            Path(id.clone()),
            Json(BackupRequest {
                table: "people".into(),
                backup: None,
            }),
        )
        .await
        .unwrap();
        assert!(backup.backup.starts_with("people_backup_"));

        drop_table(State(state.clone()), Path((id.clone(), "people".into())))
            .await
            .unwrap();
        let Json(details) = info(State(state.clone()), Path(id)).await.unwrap();
        assert_eq!(details.tables, vec![backup.backup]);
    }

    #[tokio::test]
    async fn second_write_without_replace_fails() {
        let (state, id) = connected().await;
        write(&state, &id, "people").await;
        let request = WriteRequest {
            table: "people".into(),
            if_exists: IfExists::Fail,
        };
        let err = write_table(State(state), Path(id), Json(request))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Query(_)));
    }

    #[test]
    fn database_calls_need_a_connection() {
        tokio_test::block_on(async {
            let state = Arc::new(AppState::new(Config::default()));
            let id = state.sessions.create();
            let err = list_tables(State(state.clone()), Path(id.clone()))
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::Connection(_)));

            connect(State(state.clone()), Path(id.clone()), Json(memory_params()))
                .await
                .unwrap();
            assert_eq!(
                close(State(state.clone()), Path(id.clone())).await.unwrap(),
                StatusCode::NO_CONTENT
            );
            assert!(close(State(state), Path(id)).await.is_err());
        });
    }

    #[tokio::test]
    async fn unsupported_backend_is_a_connection_error() {
        let state = Arc::new(AppState::new(Config::default()));
        let id = state.sessions.create();
        let params: ConnectParams =
            serde_json::from_str(r#"{"kind": "postgresql", "host": "db", "database": "sales"}"#)
                .unwrap();
        let err = connect(State(state), Path(id), Json(params)).await.unwrap_err();
        assert!(matches!(err, AppError::Connection(_)));
    }
}
