use axum::{
    extract::{Query, State},
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::{
    errors::AppError,
    irc::ClientHealth,
    models::{Channel, StoredMessage, User},
    pipeline::PipelineStatsSnapshot,
    state::AppState,
    store::{ChannelRepo, MessageRepo, UserRepo},
};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub irc: Option<ClientHealth>,
    pub pipeline: PipelineStatsSnapshot,
    pub archive: ArchiveHealth,
    pub live: LiveHealth,
}

#[derive(Debug, Serialize)]
pub struct ArchiveHealth {
    pub messages: i64,
    pub channels: i64,
    pub enabled_channels: i64,
    pub users: i64,
}

#[derive(Debug, Serialize)]
pub struct LiveHealth {
    pub enabled: bool,
    pub clients: usize,
    pub latest_cursor: i64,
}

pub async fn healthz(
    State(state): State<AppState>,
) -> Result<Json<HealthResponse>, AppError> {
    let archive = ArchiveHealth {
        messages: state.store.message_count().await?,
        channels: state.store.channel_count().await?,
        enabled_channels: state.store.enabled_channel_count().await?,
        users: state.store.user_count().await?,
    };

    Ok(Json(HealthResponse {
        status: "ok",
        irc: state.irc.as_ref().map(|client| client.health()),
        pipeline: state.pipeline.stats().snapshot(),
        archive,
        live: LiveHealth {
            enabled: state.sse.enabled,
            clients: state.broadcaster.subscriber_count(),
            latest_cursor: state.broadcaster.latest_cursor(),
        },
    }))
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(error) => AppError::Internal(format!("metrics render failed: {error}")).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    #[serde(default)]
    pub after_id: i64,
    pub limit: Option<usize>,
}

/// Polling fallback for clients without a live stream.
pub async fn recent_messages(
    State(state): State<AppState>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<Vec<StoredMessage>>, AppError> {
    let cap = state.broadcaster.config().max_backfill;
    let limit = query.limit.unwrap_or(100).clamp(1, cap.max(1));
    let messages = state
        .store
        .get_global_after_id(query.after_id.max(0), limit)
        .await?;
    Ok(Json(messages))
}

pub async fn list_channels(
    State(state): State<AppState>,
) -> Result<Json<Vec<Channel>>, AppError> {
    Ok(Json(state.store.list_channels().await?))
}

pub async fn list_users(State(state): State<AppState>) -> Result<Json<Vec<User>>, AppError> {
    Ok(Json(state.store.list_users().await?))
}
