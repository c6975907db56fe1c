use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lowercases a channel or user login and strips the IRC channel sigil.
/// Every lookup and every persisted row goes through this first.
pub fn normalize_login(name: &str) -> String {
    name.trim().trim_start_matches('#').to_ascii_lowercase()
}

#[derive(Debug, Clone)]
pub struct RawMessage {
    pub channel_name: String,
    pub username: String,
    pub display_name: String,
    pub text: String,
    pub tags: HashMap<String, String>,
    pub received_at: DateTime<Utc>,
}

impl RawMessage {
    pub fn new(
        channel_name: impl Into<String>,
        username: impl Into<String>,
        display_name: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            channel_name: normalize_login(&channel_name.into()),
            username: normalize_login(&username.into()),
            display_name: display_name.into(),
            text: text.into(),
            tags: HashMap::new(),
            received_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedMessage {
    pub channel_id: i64,
    pub user_id: i64,
    pub raw: RawMessage,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    pub id: i64,
    pub channel_id: i64,
    pub channel_name: String,
    pub user_id: i64,
    pub username: String,
    pub display_name: String,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    pub display_name: String,
    pub enabled: bool,
    pub retain_history_on_delete: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    pub total_messages: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub display_name: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub total_messages: i64,
}

/// Post-commit aggregate for one channel touched by a batch.
#[derive(Debug, Clone)]
pub struct ChannelTotal {
    pub channel_id: i64,
    pub channel_name: String,
    pub total_messages: i64,
    pub last_message_at: Option<DateTime<Utc>>,
}

/// Post-commit aggregate for one user touched by a batch.
#[derive(Debug, Clone)]
pub struct UserTotal {
    pub user_id: i64,
    pub username: String,
    pub display_name: String,
    pub total_messages: i64,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum View {
    Home,
    Messages,
    Channels,
    Users,
    UserProfile,
}

impl View {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "home" => Some(Self::Home),
            "messages" => Some(Self::Messages),
            "channels" => Some(Self::Channels),
            "users" => Some(Self::Users),
            "user_profile" => Some(Self::UserProfile),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Home => "home",
            Self::Messages => "messages",
            Self::Channels => "channels",
            Self::Users => "users",
            Self::UserProfile => "user_profile",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusState {
    Connected,
    Idle,
    Reconnecting,
    Fallback,
    Error,
}

/// Wire envelope for the live stream. Every variant carries `cursor`, the id
/// of the newest stored message observed at emission time, so clients can
/// resume and deduplicate across reconnects.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveEvent {
    Status {
        cursor: i64,
        state: StatusState,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_ms: Option<u64>,
    },
    Metrics {
        cursor: i64,
        total_messages: i64,
        total_channels: i64,
        total_users: i64,
    },
    Message {
        cursor: i64,
        id: i64,
        channel_id: i64,
        channel_name: String,
        user_id: i64,
        username: String,
        display_name: String,
        text: String,
        sent_at: DateTime<Utc>,
    },
    ChannelCount {
        cursor: i64,
        channel_id: i64,
        channel_name: String,
        total_messages: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_message_at: Option<DateTime<Utc>>,
    },
    UserCount {
        cursor: i64,
        user_id: i64,
        username: String,
        total_messages: i64,
    },
    UserProfile {
        cursor: i64,
        user_id: i64,
        username: String,
        display_name: String,
        total_messages: i64,
        first_seen_at: DateTime<Utc>,
        last_seen_at: DateTime<Utc>,
    },
}

impl LiveEvent {
    pub fn status(cursor: i64, state: StatusState) -> Self {
        Self::Status {
            cursor,
            state,
            reason: None,
            retry_after_ms: None,
        }
    }

    pub fn fallback(cursor: i64, reason: impl Into<String>) -> Self {
        Self::Status {
            cursor,
            state: StatusState::Fallback,
            reason: Some(reason.into()),
            retry_after_ms: None,
        }
    }

    pub fn message(stored: &StoredMessage) -> Self {
        Self::Message {
            cursor: stored.id,
            id: stored.id,
            channel_id: stored.channel_id,
            channel_name: stored.channel_name.clone(),
            user_id: stored.user_id,
            username: stored.username.clone(),
            display_name: stored.display_name.clone(),
            text: stored.text.clone(),
            sent_at: stored.sent_at,
        }
    }

    pub fn channel_count(cursor: i64, total: &ChannelTotal) -> Self {
        Self::ChannelCount {
            cursor,
            channel_id: total.channel_id,
            channel_name: total.channel_name.clone(),
            total_messages: total.total_messages,
            last_message_at: total.last_message_at,
        }
    }

    pub fn user_count(cursor: i64, total: &UserTotal) -> Self {
        Self::UserCount {
            cursor,
            user_id: total.user_id,
            username: total.username.clone(),
            total_messages: total.total_messages,
        }
    }

    pub fn user_profile(cursor: i64, total: &UserTotal) -> Self {
        Self::UserProfile {
            cursor,
            user_id: total.user_id,
            username: total.username.clone(),
            display_name: total.display_name.clone(),
            total_messages: total.total_messages,
            first_seen_at: total.first_seen_at,
            last_seen_at: total.last_seen_at,
        }
    }

    pub fn cursor(&self) -> i64 {
        match self {
            Self::Status { cursor, .. }
            | Self::Metrics { cursor, .. }
            | Self::Message { cursor, .. }
            | Self::ChannelCount { cursor, .. }
            | Self::UserCount { cursor, .. }
            | Self::UserProfile { cursor, .. } => *cursor,
        }
    }

    pub fn is_message(&self) -> bool {
        matches!(self, Self::Message { .. })
    }

    /// Wire form. An event is serialized once and the string is shared
    /// across every outbox it lands in.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|error| {
            serde_json::json!({
                "type": "status",
                "cursor": 0,
                "state": "error",
                "reason": format!("serialization error: {error}"),
            })
            .to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_lowercases_and_strips_sigil() {
        assert_eq!(normalize_login("#ForsenLOL"), "forsenlol");
        assert_eq!(normalize_login("  Nymn "), "nymn");
    }

    #[test]
    fn view_parse_rejects_unknown() {
        assert_eq!(View::parse("home"), Some(View::Home));
        assert_eq!(View::parse("user_profile"), Some(View::UserProfile));
        assert_eq!(View::parse("dashboard"), None);
    }

    #[test]
    fn live_event_envelope_carries_type_and_cursor() {
        let event = LiveEvent::status(7, StatusState::Connected);
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&event).expect("serialize status"))
                .expect("valid json");

        assert_eq!(json["type"], "status");
        assert_eq!(json["cursor"], 7);
        assert_eq!(json["state"], "connected");
        assert!(json.get("reason").is_none());
    }

    #[test]
    fn message_event_cursor_equals_id() {
        let stored = StoredMessage {
            id: 42,
            channel_id: 1,
            channel_name: "a".to_owned(),
            user_id: 2,
            username: "u".to_owned(),
            display_name: "U".to_owned(),
            text: "hi".to_owned(),
            sent_at: Utc::now(),
        };

        let event = LiveEvent::message(&stored);
        assert_eq!(event.cursor(), 42);
        assert!(event.is_message());
    }
}
