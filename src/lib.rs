pub mod batcher;
pub mod broadcaster;
pub mod buffer;
pub mod errors;
pub mod handlers;
pub mod identity;
pub mod irc;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod processor;
pub mod sse;
pub mod state;
pub mod store;

use axum::{routing::get, Router};

pub use state::{AppConfig, AppState};

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::metrics))
        .route("/live", get(sse::live_stream))
        .route("/api/messages", get(handlers::recent_messages))
        .route("/api/channels", get(handlers::list_channels))
        .route("/api/users", get(handlers::list_users))
        .with_state(state)
}
