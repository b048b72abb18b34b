use axum::{http::Method, routing::get, Router};
use polars::prelude::DataFrame;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

use crate::error::{AppError, Result};
use crate::models::ColumnKind;
use crate::services::frame::{column_kind, table_rows};
use crate::session::Session;
use crate::AppState;

pub mod database;
pub mod sessions;

pub const DEFAULT_PREVIEW_ROWS: usize = 10;

pub fn routes() -> Router<Arc<AppState>> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any)
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/health", get(health_check))
        .merge(sessions::routes())
        .merge(database::routes())
        .layer(cors)
}

async fn health_check() -> &'static str {
    "OK"
}

#[derive(Debug, Serialize)]
pub struct ColumnHeader {
    pub name: String,
    pub dtype: String,
    pub kind: ColumnKind,
}

/// First rows of a table plus its column layout.
#[derive(Debug, Serialize)]
pub struct Preview {
    pub total_rows: usize,
    pub columns: Vec<ColumnHeader>,
    pub rows: Vec<Vec<JsonValue>>,
}

impl Preview {
    pub fn of(df: &DataFrame, limit: usize) -> Result<Self> {
        Ok(Preview {
            total_rows: df.height(),
            columns: df
                .get_columns()
                .iter()
                .map(|series| ColumnHeader {
                    name: series.name().to_string(),
                    dtype: series.dtype().to_string(),
                    kind: column_kind(series),
                })
                .collect(),
            rows: table_rows(df, limit)?,
        })
    }
}

/// Runs `f` on the locked session from the blocking pool; table work is CPU bound.
pub(crate) async fn with_session<T, F>(state: &AppState, id: &str, f: F) -> Result<T>
where
    F: FnOnce(&mut Session) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let session = state.sessions.get(id)?;
    tokio::task::spawn_blocking(move || {
        let mut guard = session.lock();
        f(&mut guard)
    })
    .await
    .map_err(|e| {
        tracing::error!("Session worker failed: {}", e);
        AppError::Internal(format!("worker task failed: {}", e))
    })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use polars::df;
    use polars::prelude::NamedFrom;

    #[test]
    fn preview_limits_rows_and_describes_columns() {
        let df = df!("a" => &[1i64, 2, 3], "b" => &["x", "y", "z"]).unwrap();
        let preview = Preview::of(&df, 2).unwrap();
        assert_eq!(preview.total_rows, 3);
        assert_eq!(preview.rows.len(), 2);
        assert_eq!(preview.columns[1].kind, ColumnKind::Text);
        assert_eq!(preview.rows[1][1], JsonValue::String("y".into()));
    }

    #[tokio::test]
    async fn health_reports_ok() {
        assert_eq!(health_check().await, "OK");
    }
}
