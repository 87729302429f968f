pub mod backend;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod pool;
pub mod prompt;
pub mod relay;
pub mod router;
pub mod sse;
pub mod state;

use axum::{
    routing::{get, post},
    Router,
};
use config::{Config, ConfigError};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Builds the HTTP client and every configured backend. Background tasks
/// started here stop when `shutdown` is cancelled.
pub fn build_state(config: &Config, shutdown: &CancellationToken) -> Result<state::AppState, ConfigError> {
    let client = config.http.build_client()?;
    let backends = backend::build_backends(config, &client, shutdown)?;
    let state = state::AppState::new(backends, config.relay_buffer);
    info!(
        backends = %state.router.backend_names().join(","),
        relay_buffer = state.relay_buffer,
        "fallback router configured"
    );
    Ok(state)
}

pub fn build_app(state: state::AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::metrics))
        .route("/v1/models", get(handlers::list_models))
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .with_state(state)
}
