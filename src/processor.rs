use std::{
    collections::HashMap,
    env,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::time::timeout;
use tracing::error;

use crate::{
    identity::IdentityCache,
    models::{ChannelTotal, RawMessage, ResolvedMessage, StoredMessage, UserTotal},
    store::{ChannelRepo, MessageRepo, MessageStore, StoreError, UserRepo},
};

/// One-way port the processor publishes through once a batch has committed.
/// Breaks the wiring cycle with the live fan-out: the broadcaster implements
/// this, the processor never names it.
pub trait EventSink: Send + Sync {
    fn message_stored(&self, message: &StoredMessage);
    fn channel_total_changed(&self, total: &ChannelTotal);
    fn user_total_changed(&self, total: &UserTotal);
}

/// Sink for wirings without live fan-out.
pub struct NullSink;

impl EventSink for NullSink {
    fn message_stored(&self, _message: &StoredMessage) {}
    fn channel_total_changed(&self, _total: &ChannelTotal) {}
    fn user_total_changed(&self, _total: &UserTotal) {}
}

const BATCH_WRITE_DEADLINE: Duration = Duration::from_secs(10);

pub struct Processor {
    store: Arc<dyn MessageStore>,
    sink: Arc<dyn EventSink>,
    channel_ids: IdentityCache,
    user_ids: IdentityCache,
    last_stored_id: AtomicI64,
}

impl Processor {
    pub fn new(store: Arc<dyn MessageStore>, sink: Arc<dyn EventSink>) -> Self {
        let capacity = env::var("IDENTITY_CACHE_SIZE")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(10_000);

        Self {
            store,
            sink,
            channel_ids: IdentityCache::new(capacity),
            user_ids: IdentityCache::new(capacity),
            last_stored_id: AtomicI64::new(0),
        }
    }

    /// Resolves identities for a batch, persists it atomically and publishes
    /// the stored rows plus refreshed aggregates. A failed batch leaves no
    /// partial state behind; the caller decides what to do with the loss.
    pub async fn process_batch(&self, batch: Vec<RawMessage>) -> Result<usize, StoreError> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut channel_ids: HashMap<String, i64> = HashMap::new();
        let mut user_ids: HashMap<String, i64> = HashMap::new();

        for message in &batch {
            if !channel_ids.contains_key(&message.channel_name) {
                let id = match self.channel_ids.get(&message.channel_name) {
                    Some(id) => id,
                    None => {
                        let channel = self
                            .store
                            .get_or_create_channel(&message.channel_name)
                            .await?;
                        self.channel_ids.put(&message.channel_name, channel.id);
                        channel.id
                    }
                };
                channel_ids.insert(message.channel_name.clone(), id);
            }

            if !user_ids.contains_key(&message.username) {
                let id = match self.user_ids.get(&message.username) {
                    Some(id) => id,
                    None => {
                        let user = self
                            .store
                            .get_or_create_user(&message.username, &message.display_name)
                            .await?;
                        self.user_ids.put(&message.username, user.id);
                        user.id
                    }
                };
                user_ids.insert(message.username.clone(), id);
            }
        }

        let resolved = batch
            .into_iter()
            .map(|raw| ResolvedMessage {
                channel_id: channel_ids[&raw.channel_name],
                user_id: user_ids[&raw.username],
                raw,
            })
            .collect::<Vec<_>>();

        let stored = match timeout(BATCH_WRITE_DEADLINE, self.store.create_batch(resolved)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(StoreError::Timeout(
                    "batch write deadline exceeded".to_owned(),
                ))
            }
        };

        for message in &stored.messages {
            self.enforce_monotonic(message.id);
            self.sink.message_stored(message);
        }
        for total in &stored.channel_totals {
            self.sink.channel_total_changed(total);
        }
        for total in &stored.user_totals {
            self.sink.user_total_changed(total);
        }

        Ok(stored.messages.len())
    }

    fn enforce_monotonic(&self, id: i64) {
        let previous = self.last_stored_id.load(Ordering::SeqCst);
        if id <= previous {
            // A cursor moving backwards means the id sequence is corrupt;
            // continuing would hand subscribers unusable resume points.
            error!(id, previous, "stored message id is not monotonic, aborting");
            std::process::abort();
        }
        self.last_stored_id.store(id, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::store::memory::MemoryStore;

    #[derive(Debug, PartialEq)]
    enum SinkEvent {
        Message(i64),
        Channel(String, i64),
        User(String, i64),
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<SinkEvent>>,
    }

    impl EventSink for RecordingSink {
        fn message_stored(&self, message: &StoredMessage) {
            self.events
                .lock()
                .expect("sink lock")
                .push(SinkEvent::Message(message.id));
        }

        fn channel_total_changed(&self, total: &ChannelTotal) {
            self.events.lock().expect("sink lock").push(SinkEvent::Channel(
                total.channel_name.clone(),
                total.total_messages,
            ));
        }

        fn user_total_changed(&self, total: &UserTotal) {
            self.events
                .lock()
                .expect("sink lock")
                .push(SinkEvent::User(total.username.clone(), total.total_messages));
        }
    }

    #[tokio::test]
    async fn batch_resolves_identities_once_and_preserves_order() {
        let store = Arc::new(MemoryStore::default());
        let sink = Arc::new(RecordingSink::default());
        let processor = Processor::new(store.clone(), sink.clone());

        let batch = vec![
            RawMessage::new("#A", "u", "U", "hi"),
            RawMessage::new("a", "v", "V", "ho"),
            RawMessage::new("a", "u", "U", "again"),
        ];
        let stored = processor.process_batch(batch).await.expect("batch stored");
        assert_eq!(stored, 3);

        assert_eq!(store.channel_count().await.expect("channels"), 1);
        assert_eq!(store.user_count().await.expect("users"), 2);

        let messages = store.get_global_after_id(0, 10).await.expect("messages");
        let ids = messages.iter().map(|message| message.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(messages[0].text, "hi");
        assert_eq!(messages[2].text, "again");

        let events = sink.events.lock().expect("sink lock");
        assert_eq!(
            *events,
            vec![
                SinkEvent::Message(1),
                SinkEvent::Message(2),
                SinkEvent::Message(3),
                SinkEvent::Channel("a".to_owned(), 3),
                SinkEvent::User("u".to_owned(), 2),
                SinkEvent::User("v".to_owned(), 1),
            ]
        );
    }

    #[tokio::test]
    async fn failed_batch_is_surfaced_and_leaves_no_events() {
        let store = Arc::new(MemoryStore::default());
        let sink = Arc::new(RecordingSink::default());
        let processor = Processor::new(store.clone(), sink.clone());

        store.fail_next_batches(1);
        let error = processor
            .process_batch(vec![RawMessage::new("a", "u", "U", "lost")])
            .await
            .expect_err("store failure should surface");
        assert!(matches!(error, StoreError::Unavailable(_)));
        assert_eq!(store.message_count().await.expect("count"), 0);
        assert!(sink.events.lock().expect("sink lock").is_empty());

        let stored = processor
            .process_batch(vec![RawMessage::new("a", "u", "U", "kept")])
            .await
            .expect("next batch stores");
        assert_eq!(stored, 1);
    }

    #[tokio::test]
    async fn aggregates_follow_commit_order_across_batches() {
        let store = Arc::new(MemoryStore::default());
        let sink = Arc::new(RecordingSink::default());
        let processor = Processor::new(store.clone(), sink.clone());

        processor
            .process_batch(vec![RawMessage::new("a", "u", "U", "1")])
            .await
            .expect("first batch");
        processor
            .process_batch(vec![RawMessage::new("a", "u", "U", "2")])
            .await
            .expect("second batch");

        let events = sink.events.lock().expect("sink lock");
        let channel_totals = events
            .iter()
            .filter_map(|event| match event {
                SinkEvent::Channel(_, total) => Some(*total),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(channel_totals, vec![1, 2]);
    }
}
