use axum::{
    response::{IntoResponse, Response},
    http::StatusCode,
};
use serde_json::json;
use axum::Json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Load error: {0}")]
    Load(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Invalid value for '{parameter}': {message}")]
    Validation { parameter: String, message: String },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("No data loaded")]
    NoData,

    #[error("Export error: {0}")]
    Export(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DataFrame error: {0}")]
    DataFrame(#[from] polars::error::PolarsError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn invalid(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::Validation {
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            AppError::Load(_) => "load",
            AppError::Connection(_) => "connection",
            AppError::Query(_) => "query",
            AppError::Validation { .. } => "validation",
            AppError::SessionNotFound(_) => "session_not_found",
            AppError::NoData => "no_data",
            AppError::Export(_) => "export",
            AppError::Io(_) => "io",
            AppError::DataFrame(_) => "dataframe",
            AppError::Internal(_) => "internal",
        }
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Export(err.to_string())
    }
}

impl From<calamine::Error> for AppError {
    fn from(err: calamine::Error) -> Self {
        AppError::Load(format!("Failed to read workbook: {}", err))
    }
}

impl From<rust_xlsxwriter::XlsxError> for AppError {
    fn from(err: rust_xlsxwriter::XlsxError) -> Self {
        AppError::Export(format!("Failed to write workbook: {}", err))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Load(_) => StatusCode::BAD_REQUEST,
            AppError::Query(_) => StatusCode::BAD_REQUEST,
            AppError::Validation { .. } => StatusCode::BAD_REQUEST,
            AppError::Connection(_) => StatusCode::BAD_GATEWAY,
            AppError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            AppError::NoData => StatusCode::NOT_FOUND,
            AppError::Export(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::DataFrame(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string(),
            "kind": self.kind(),
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_names_parameter() {
        let err = AppError::invalid("method", "expected one of standard, minmax");
        assert_eq!(
            err.to_string(),
            "Invalid value for 'method': expected one of standard, minmax"
        );
    }

    #[test]
    fn status_codes_follow_error_kind() {
        assert_eq!(AppError::NoData.into_response().status(), StatusCode::NOT_FOUND);
        assert_eq!(
            AppError::Connection("refused".into()).into_response().status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            AppError::Load("bad bytes".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
    }
}
