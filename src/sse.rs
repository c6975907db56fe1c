use std::{convert::Infallible, env, sync::Arc, time::Duration};

use axum::{
    extract::{Query, State},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
};
use chrono::Utc;
use serde::Deserialize;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::warn;

use crate::{
    broadcaster::{Backfill, Broadcaster},
    errors::{self, AppError},
    models::{ChannelTotal, LiveEvent, StatusState, UserTotal, View},
    state::AppState,
    store::{ChannelRepo, MessageStore, StoreError, UserRepo},
};

#[derive(Debug, Clone, Copy)]
pub struct SseConfig {
    pub enabled: bool,
    pub heartbeat: Duration,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            heartbeat: Duration::from_secs(30),
        }
    }
}

impl SseConfig {
    pub fn from_env() -> Self {
        let enabled = env::var("ENABLE_SSE")
            .ok()
            .map(|value| value != "0" && !value.eq_ignore_ascii_case("false"))
            .unwrap_or(true);
        let heartbeat_secs = env::var("SSE_HEARTBEAT_SEC")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(30);

        Self {
            enabled,
            heartbeat: Duration::from_secs(heartbeat_secs),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LiveQuery {
    pub view: String,
    #[serde(default)]
    pub after_id: i64,
    pub channel: Option<String>,
    pub user: Option<String>,
}

pub async fn live_stream(
    State(state): State<AppState>,
    Query(query): Query<LiveQuery>,
) -> Response {
    match build_stream(state, query) {
        Ok(response) => response,
        Err(error) => error.into_response(),
    }
}

fn build_stream(state: AppState, query: LiveQuery) -> Result<Response, AppError> {
    if !state.sse.enabled {
        return Err(AppError::Unavailable("live updates are disabled".to_owned()));
    }

    let view = View::parse(&query.view)
        .ok_or_else(|| AppError::BadRequest(format!("unknown view: {}", query.view)))?;
    let filter = match view {
        View::Channels => query.channel.clone(),
        View::UserProfile => Some(
            query
                .user
                .clone()
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| {
                    AppError::BadRequest("user filter is required for user_profile".to_owned())
                })?,
        ),
        _ => None,
    };
    let filter = filter.map(|value| crate::models::normalize_login(&value));

    let mut handle = state.broadcaster.subscribe(view, filter.clone());
    let client_gauge = state.metrics.sse_client_guard();
    let broadcaster = state.broadcaster.clone();
    let store = state.store.clone();
    let shutdown = state.shutdown.clone();
    let heartbeat_period = state.sse.heartbeat;
    let after_id = query.after_id.max(0);

    let outbound = async_stream::stream! {
        let _client_gauge = client_gauge;
        let mut last_message_id = 0i64;

        yield Ok::<Event, Infallible>(json_event(&LiveEvent::status(
            broadcaster.cursor_snapshot().await,
            StatusState::Connected,
        )));

        match initial_snapshot(&broadcaster, &store, view, filter.as_deref()).await {
            Ok(events) => {
                for event in events {
                    yield Ok(json_event(&event));
                }
            }
            Err(error) => {
                warn!(error = %error, view = view.as_str(), "initial snapshot failed");
                yield Ok(json_event(&LiveEvent::Status {
                    cursor: broadcaster.latest_cursor(),
                    state: StatusState::Error,
                    reason: Some("snapshot unavailable".to_owned()),
                    retry_after_ms: Some(5_000),
                }));
                return;
            }
        }

        if after_id > 0 {
            match broadcaster.backfill(after_id).await {
                Ok(Backfill::Events(events)) => {
                    for event in events {
                        last_message_id = last_message_id.max(event.cursor());
                        yield Ok(json_event(&event));
                    }
                }
                Ok(Backfill::Overflow) => {
                    yield Ok(json_event(&LiveEvent::fallback(
                        broadcaster.latest_cursor(),
                        "backlog too large",
                    )));
                }
                Err(error) => {
                    warn!(error = %error, after_id, "backfill failed");
                    yield Ok(json_event(&LiveEvent::Status {
                        cursor: broadcaster.latest_cursor(),
                        state: StatusState::Error,
                        reason: Some("backfill unavailable".to_owned()),
                        retry_after_ms: Some(5_000),
                    }));
                    return;
                }
            }
        }

        let mut heartbeat = interval_at(Instant::now() + heartbeat_period, heartbeat_period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe_event = handle.recv() => {
                    let Some(event) = maybe_event else {
                        break;
                    };

                    if handle.take_fallback_pending() {
                        yield Ok(json_event(&LiveEvent::fallback(
                            broadcaster.latest_cursor(),
                            "live updates degraded",
                        )));
                    }

                    // Backfill and live delivery may overlap for a moment;
                    // the monotonic cursor filter keeps delivery exactly-once.
                    if event.is_message {
                        if event.cursor <= last_message_id {
                            continue;
                        }
                        last_message_id = event.cursor;
                    }
                    yield Ok(Event::default().data(event.payload.as_ref()));
                }
                _ = heartbeat.tick() => {
                    yield Ok(Event::default()
                        .comment(format!("heartbeat {}", Utc::now().timestamp())));
                }
                _ = shutdown.cancelled() => {
                    yield Ok(json_event(&LiveEvent::Status {
                        cursor: broadcaster.latest_cursor(),
                        state: StatusState::Reconnecting,
                        reason: Some("server shutting down".to_owned()),
                        retry_after_ms: Some(2_000),
                    }));
                    break;
                }
            }
        }
    };

    let mut response = Sse::new(outbound).into_response();
    errors::apply_header(response.headers_mut(), "cache-control", "no-cache");
    errors::apply_header(response.headers_mut(), "x-accel-buffering", "no");
    Ok(response)
}

async fn initial_snapshot(
    broadcaster: &Broadcaster,
    store: &Arc<dyn MessageStore>,
    view: View,
    filter: Option<&str>,
) -> Result<Vec<LiveEvent>, StoreError> {
    let cursor = broadcaster.latest_cursor();
    match view {
        View::Home => Ok(vec![broadcaster.metrics_snapshot().await?]),
        View::Channels => {
            let Some(name) = filter else {
                return Ok(Vec::new());
            };
            Ok(store
                .get_channel(name)
                .await?
                .map(|channel| {
                    LiveEvent::channel_count(
                        cursor,
                        &ChannelTotal {
                            channel_id: channel.id,
                            channel_name: channel.name,
                            total_messages: channel.total_messages,
                            last_message_at: channel.last_message_at,
                        },
                    )
                })
                .into_iter()
                .collect())
        }
        View::UserProfile => {
            let Some(username) = filter else {
                return Ok(Vec::new());
            };
            Ok(store
                .get_user(username)
                .await?
                .map(|user| {
                    LiveEvent::user_profile(
                        cursor,
                        &UserTotal {
                            user_id: user.id,
                            username: user.username,
                            display_name: user.display_name,
                            total_messages: user.total_messages,
                            first_seen_at: user.first_seen_at,
                            last_seen_at: user.last_seen_at,
                        },
                    )
                })
                .into_iter()
                .collect())
        }
        View::Messages | View::Users => Ok(Vec::new()),
    }
}

fn json_event(event: &LiveEvent) -> Event {
    Event::default().data(event.to_json())
}
