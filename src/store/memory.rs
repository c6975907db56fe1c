use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use tokio::{sync::Mutex, time::sleep};

use crate::{
    models::{Channel, ChannelTotal, ResolvedMessage, StoredMessage, User, UserTotal},
    store::{ChannelRepo, MessageRepo, StoreError, StoredBatch, UserRepo},
};

/// Reference store backing `main` and the test suites. A single async mutex
/// guards all tables, which gives the same single-writer semantics as an
/// embedded SQL file: `create_batch` is atomic, ids are strictly increasing,
/// and the aggregate counters are updated in the same critical section as
/// the insert.
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    write_delay: Option<Duration>,
    fail_batches: AtomicUsize,
}

#[derive(Default)]
struct MemoryInner {
    channels: HashMap<String, Channel>,
    channel_names_by_id: HashMap<i64, String>,
    users: HashMap<String, User>,
    usernames_by_id: HashMap<i64, String>,
    messages: Vec<StoredMessage>,
    next_channel_id: i64,
    next_user_id: i64,
    next_message_id: i64,
    batch_log: Vec<usize>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            inner: Mutex::new(MemoryInner::default()),
            write_delay: None,
            fail_batches: AtomicUsize::new(0),
        }
    }
}

impl MemoryStore {
    /// Holds the writer lock for `delay` on every batch, emulating a slow
    /// single-writer database for the backpressure scenarios.
    pub fn with_write_delay(delay: Duration) -> Self {
        Self {
            write_delay: Some(delay),
            ..Self::default()
        }
    }

    /// The next `count` calls to `create_batch` fail with `Unavailable`.
    pub fn fail_next_batches(&self, count: usize) {
        self.fail_batches.store(count, Ordering::SeqCst);
    }

    /// Sizes of successfully committed batches, in commit order.
    pub async fn recorded_batches(&self) -> Vec<usize> {
        self.inner.lock().await.batch_log.clone()
    }
}

#[async_trait]
impl ChannelRepo for MemoryStore {
    async fn get_or_create_channel(&self, name: &str) -> Result<Channel, StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(channel) = inner.channels.get(name) {
            return Ok(channel.clone());
        }

        let now = Utc::now();
        inner.next_channel_id += 1;
        let channel = Channel {
            id: inner.next_channel_id,
            name: name.to_owned(),
            display_name: name.to_owned(),
            enabled: true,
            retain_history_on_delete: false,
            created_at: now,
            updated_at: now,
            last_message_at: None,
            total_messages: 0,
        };
        inner
            .channel_names_by_id
            .insert(channel.id, channel.name.clone());
        inner.channels.insert(name.to_owned(), channel.clone());
        Ok(channel)
    }

    async fn get_channel(&self, name: &str) -> Result<Option<Channel>, StoreError> {
        Ok(self.inner.lock().await.channels.get(name).cloned())
    }

    async fn list_channels(&self) -> Result<Vec<Channel>, StoreError> {
        let inner = self.inner.lock().await;
        let mut channels = inner.channels.values().cloned().collect::<Vec<_>>();
        channels.sort_by_key(|channel| channel.id);
        Ok(channels)
    }

    async fn channel_count(&self) -> Result<i64, StoreError> {
        Ok(self.inner.lock().await.channels.len() as i64)
    }

    async fn enabled_channel_count(&self) -> Result<i64, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .channels
            .values()
            .filter(|channel| channel.enabled)
            .count() as i64)
    }
}

#[async_trait]
impl UserRepo for MemoryStore {
    async fn get_or_create_user(
        &self,
        username: &str,
        display_name: &str,
    ) -> Result<User, StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(user) = inner.users.get_mut(username) {
            if user.display_name != display_name && !display_name.is_empty() {
                user.display_name = display_name.to_owned();
            }
            return Ok(user.clone());
        }

        let now = Utc::now();
        inner.next_user_id += 1;
        let user = User {
            id: inner.next_user_id,
            username: username.to_owned(),
            display_name: if display_name.is_empty() {
                username.to_owned()
            } else {
                display_name.to_owned()
            },
            first_seen_at: now,
            last_seen_at: now,
            total_messages: 0,
        };
        inner.usernames_by_id.insert(user.id, user.username.clone());
        inner.users.insert(username.to_owned(), user.clone());
        Ok(user)
    }

    async fn get_user(&self, username: &str) -> Result<Option<User>, StoreError> {
        Ok(self.inner.lock().await.users.get(username).cloned())
    }

    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        let inner = self.inner.lock().await;
        let mut users = inner.users.values().cloned().collect::<Vec<_>>();
        users.sort_by_key(|user| user.id);
        Ok(users)
    }

    async fn user_count(&self) -> Result<i64, StoreError> {
        Ok(self.inner.lock().await.users.len() as i64)
    }
}

#[async_trait]
impl MessageRepo for MemoryStore {
    async fn create_batch(&self, batch: Vec<ResolvedMessage>) -> Result<StoredBatch, StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(delay) = self.write_delay {
            sleep(delay).await;
        }

        if self
            .fail_batches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
        {
            return Err(StoreError::Unavailable("injected batch failure".to_owned()));
        }

        // Resolve every referenced identity before the first mutation so the
        // batch commits as a unit or not at all.
        let mut identities = Vec::with_capacity(batch.len());
        for resolved in &batch {
            let channel_name = inner
                .channel_names_by_id
                .get(&resolved.channel_id)
                .cloned()
                .ok_or_else(|| {
                    StoreError::Constraint(format!("unknown channel id {}", resolved.channel_id))
                })?;
            let username = inner
                .usernames_by_id
                .get(&resolved.user_id)
                .cloned()
                .ok_or_else(|| {
                    StoreError::Constraint(format!("unknown user id {}", resolved.user_id))
                })?;
            identities.push((channel_name, username));
        }

        let mut stored = StoredBatch::default();
        let mut touched_channels = Vec::new();
        let mut touched_users = Vec::new();

        for (resolved, (channel_name, username)) in batch.iter().zip(identities) {
            inner.next_message_id += 1;
            let message = StoredMessage {
                id: inner.next_message_id,
                channel_id: resolved.channel_id,
                channel_name: channel_name.clone(),
                user_id: resolved.user_id,
                username: username.clone(),
                display_name: resolved.raw.display_name.clone(),
                text: resolved.raw.text.clone(),
                sent_at: resolved.raw.received_at,
            };

            let sent_at = message.sent_at;
            if let Some(channel) = inner.channels.get_mut(&channel_name) {
                channel.total_messages += 1;
                channel.last_message_at = Some(sent_at);
                channel.updated_at = sent_at;
            }
            if let Some(user) = inner.users.get_mut(&username) {
                user.total_messages += 1;
                user.last_seen_at = sent_at;
            }

            if !touched_channels.contains(&channel_name) {
                touched_channels.push(channel_name);
            }
            if !touched_users.contains(&username) {
                touched_users.push(username);
            }

            inner.messages.push(message.clone());
            stored.messages.push(message);
        }

        for name in touched_channels {
            let channel = &inner.channels[&name];
            stored.channel_totals.push(ChannelTotal {
                channel_id: channel.id,
                channel_name: channel.name.clone(),
                total_messages: channel.total_messages,
                last_message_at: channel.last_message_at,
            });
        }
        for username in touched_users {
            let user = &inner.users[&username];
            stored.user_totals.push(UserTotal {
                user_id: user.id,
                username: user.username.clone(),
                display_name: user.display_name.clone(),
                total_messages: user.total_messages,
                first_seen_at: user.first_seen_at,
                last_seen_at: user.last_seen_at,
            });
        }

        inner.batch_log.push(stored.messages.len());
        Ok(stored)
    }

    async fn get_global_after_id(
        &self,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .messages
            .iter()
            .filter(|message| message.id > after_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_global_latest_id(&self) -> Result<i64, StoreError> {
        Ok(self.inner.lock().await.next_message_id)
    }

    async fn message_count(&self) -> Result<i64, StoreError> {
        Ok(self.inner.lock().await.messages.len() as i64)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::models::RawMessage;

    fn resolved(channel_id: i64, user_id: i64, text: &str) -> ResolvedMessage {
        ResolvedMessage {
            channel_id,
            user_id,
            raw: RawMessage::new("a", "u", "U", text),
        }
    }

    #[tokio::test]
    async fn concurrent_first_sight_creates_exactly_one_channel() {
        let store = Arc::new(MemoryStore::default());

        let first = {
            let store = store.clone();
            tokio::spawn(async move { store.get_or_create_channel("forsen").await })
        };
        let second = {
            let store = store.clone();
            tokio::spawn(async move { store.get_or_create_channel("forsen").await })
        };

        let first = first.await.expect("first task").expect("first result");
        let second = second.await.expect("second task").expect("second result");

        assert_eq!(first.id, second.id);
        assert_eq!(store.channel_count().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn batch_assigns_increasing_ids_and_updates_counters() {
        let store = MemoryStore::default();
        let channel = store.get_or_create_channel("a").await.expect("channel");
        let user = store.get_or_create_user("u", "U").await.expect("user");

        let batch = vec![
            resolved(channel.id, user.id, "one"),
            resolved(channel.id, user.id, "two"),
        ];
        let stored = store.create_batch(batch).await.expect("batch");

        assert_eq!(stored.messages.len(), 2);
        assert!(stored.messages[0].id < stored.messages[1].id);
        assert_eq!(stored.channel_totals.len(), 1);
        assert_eq!(stored.channel_totals[0].total_messages, 2);
        assert_eq!(stored.user_totals[0].total_messages, 2);

        let refreshed = store
            .get_channel("a")
            .await
            .expect("lookup")
            .expect("channel exists");
        assert_eq!(refreshed.total_messages, 2);
        assert!(refreshed.last_message_at.is_some());
    }

    #[tokio::test]
    async fn injected_failure_rolls_back_nothing() {
        let store = MemoryStore::default();
        let channel = store.get_or_create_channel("a").await.expect("channel");
        let user = store.get_or_create_user("u", "U").await.expect("user");

        store.fail_next_batches(1);
        let error = store
            .create_batch(vec![resolved(channel.id, user.id, "lost")])
            .await
            .expect_err("injected failure");
        assert!(matches!(error, StoreError::Unavailable(_)));
        assert_eq!(store.message_count().await.expect("count"), 0);

        let stored = store
            .create_batch(vec![resolved(channel.id, user.id, "kept")])
            .await
            .expect("second batch");
        assert_eq!(stored.messages[0].id, 1);
    }

    #[tokio::test]
    async fn after_id_pagination_respects_cursor_and_limit() {
        let store = MemoryStore::default();
        let channel = store.get_or_create_channel("a").await.expect("channel");
        let user = store.get_or_create_user("u", "U").await.expect("user");

        let batch = (0..10)
            .map(|index| resolved(channel.id, user.id, &format!("m{index}")))
            .collect();
        store.create_batch(batch).await.expect("batch");

        let page = store.get_global_after_id(3, 4).await.expect("page");
        let ids = page.iter().map(|message| message.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![4, 5, 6, 7]);

        let empty = store.get_global_after_id(10, 5).await.expect("empty page");
        assert!(empty.is_empty());
    }
}
