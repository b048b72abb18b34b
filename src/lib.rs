use axum::{extract::DefaultBodyLimit, Router};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod routes;
pub mod services;
pub mod session;

use session::SessionStore;

// Application state
pub struct AppState {
    pub config: config::Config,
    pub sessions: SessionStore,
}

impl AppState {
    pub fn new(config: config::Config) -> Self {
        let sessions = SessionStore::new(
            config.max_sessions,
            Duration::from_secs(config.session_idle_secs),
        );
        Self { config, sessions }
    }
}

pub fn app(state: Arc<AppState>) -> Router {
    let body_limit = state.config.max_file_size;
    Router::new()
        .merge(routes::routes())
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
