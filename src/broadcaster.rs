use std::{
    collections::HashMap,
    env,
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
    time::{sleep, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    metrics::AppMetrics,
    models::{ChannelTotal, LiveEvent, StoredMessage, UserTotal, View},
    processor::EventSink,
    store::{ChannelRepo, MessageRepo, MessageStore, StoreError, UserRepo},
};

#[derive(Debug, Clone, Copy)]
pub struct BroadcasterConfig {
    pub outbox_size: usize,
    pub max_backfill: usize,
    pub fallback_drops: u64,
    pub fallback_window: Duration,
    pub metrics_interval: Duration,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            outbox_size: 100,
            max_backfill: 500,
            fallback_drops: 10,
            fallback_window: Duration::from_secs(5),
            metrics_interval: Duration::from_secs(10),
        }
    }
}

impl BroadcasterConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            outbox_size: read_env("SSE_OUTBOX_SIZE", defaults.outbox_size),
            max_backfill: read_env("SSE_MAX_BACKFILL", defaults.max_backfill),
            fallback_drops: read_env("SSE_FALLBACK_DROPS", defaults.fallback_drops),
            fallback_window: Duration::from_secs(read_env(
                "SSE_FALLBACK_WINDOW_SECS",
                defaults.fallback_window.as_secs(),
            )),
            metrics_interval: Duration::from_secs(read_env(
                "SSE_METRICS_INTERVAL_SECS",
                defaults.metrics_interval.as_secs(),
            )),
        }
    }
}

fn read_env<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}

/// One serialized event in a client outbox. The payload is shared across
/// every subscription the event fans out to.
#[derive(Debug, Clone)]
pub struct QueuedEvent {
    pub cursor: i64,
    pub is_message: bool,
    pub payload: Arc<str>,
}

impl QueuedEvent {
    fn new(event: &LiveEvent) -> Self {
        Self {
            cursor: event.cursor(),
            is_message: event.is_message(),
            payload: event.to_json().into(),
        }
    }
}

struct Subscription {
    id: Uuid,
    view: View,
    filter: Option<String>,
    outbox: mpsc::Sender<QueuedEvent>,
    drops: Mutex<DropWindow>,
    fallback_pending: AtomicBool,
    connected_at: DateTime<Utc>,
}

struct DropWindow {
    window_started: Instant,
    drops: u64,
}

/// What a resubscribing client gets before live events.
pub enum Backfill {
    Events(Vec<LiveEvent>),
    /// The cap was hit; replaying a prefix this long is worse than telling
    /// the client to reload.
    Overflow,
}

/// Fans stored-message and counter events out to per-view subscriptions.
/// Each subscription owns a bounded outbox; a full outbox sheds the newest
/// event and keeps the client connected.
pub struct Broadcaster {
    subscriptions: RwLock<HashMap<Uuid, Arc<Subscription>>>,
    latest_cursor: AtomicI64,
    store: Arc<dyn MessageStore>,
    config: BroadcasterConfig,
    metrics: Arc<AppMetrics>,
}

impl Broadcaster {
    pub fn new(
        store: Arc<dyn MessageStore>,
        config: BroadcasterConfig,
        metrics: Arc<AppMetrics>,
    ) -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            latest_cursor: AtomicI64::new(0),
            store,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> BroadcasterConfig {
        self.config
    }

    pub fn latest_cursor(&self) -> i64 {
        self.latest_cursor.load(Ordering::SeqCst)
    }

    /// Latest cursor including anything stored before this process saw live
    /// traffic, so resume points handed out early are not stale zeros.
    pub async fn cursor_snapshot(&self) -> i64 {
        match self.store.get_global_latest_id().await {
            Ok(latest) => {
                self.latest_cursor.fetch_max(latest, Ordering::SeqCst);
            }
            Err(error) => warn!(error = %error, "latest id lookup failed"),
        }
        self.latest_cursor()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions
            .read()
            .expect("subscription map lock")
            .len()
    }

    pub fn subscribe(self: &Arc<Self>, view: View, filter: Option<String>) -> SubscriptionHandle {
        let (outbox, receiver) = mpsc::channel(self.config.outbox_size.max(1));
        let subscription = Arc::new(Subscription {
            id: Uuid::new_v4(),
            view,
            filter: filter.map(|value| crate::models::normalize_login(&value)),
            outbox,
            drops: Mutex::new(DropWindow {
                window_started: Instant::now(),
                drops: 0,
            }),
            fallback_pending: AtomicBool::new(false),
            connected_at: Utc::now(),
        });

        self.subscriptions
            .write()
            .expect("subscription map lock")
            .insert(subscription.id, subscription.clone());
        debug!(
            client_id = %subscription.id,
            view = view.as_str(),
            filter = subscription.filter.as_deref().unwrap_or(""),
            "live subscription registered"
        );

        SubscriptionHandle {
            broadcaster: self.clone(),
            subscription,
            receiver,
        }
    }

    fn unsubscribe(&self, id: Uuid) {
        if let Some(subscription) = self
            .subscriptions
            .write()
            .expect("subscription map lock")
            .remove(&id)
        {
            debug!(
                client_id = %subscription.id,
                connected_at = %subscription.connected_at,
                "live subscription removed"
            );
        }
    }

    /// Replays stored messages past the client's cursor, capped. Hitting the
    /// cap means the backlog is too large to replay inline.
    pub async fn backfill(&self, after_id: i64) -> Result<Backfill, StoreError> {
        let rows = self
            .store
            .get_global_after_id(after_id, self.config.max_backfill)
            .await?;
        if rows.len() >= self.config.max_backfill {
            self.metrics.observe_sse_fallback("backlog_too_large");
            return Ok(Backfill::Overflow);
        }
        Ok(Backfill::Events(
            rows.iter().map(LiveEvent::message).collect(),
        ))
    }

    pub async fn metrics_snapshot(&self) -> Result<LiveEvent, StoreError> {
        let total_messages = self.store.message_count().await?;
        let total_channels = self.store.channel_count().await?;
        let total_users = self.store.user_count().await?;
        Ok(LiveEvent::Metrics {
            cursor: self.latest_cursor(),
            total_messages,
            total_channels,
            total_users,
        })
    }

    /// Pushes a metrics refresh to home-view subscribers on a fixed cadence
    /// until shutdown.
    pub fn spawn_metrics_publisher(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sleep(self.config.metrics_interval) => {}
                    _ = shutdown.cancelled() => break,
                }

                let has_home_subscribers = {
                    let subscriptions = self.subscriptions.read().expect("subscription map lock");
                    subscriptions
                        .values()
                        .any(|subscription| subscription.view == View::Home)
                };
                if !has_home_subscribers {
                    continue;
                }

                match self.metrics_snapshot().await {
                    Ok(event) => {
                        let queued = QueuedEvent::new(&event);
                        let subscriptions =
                            self.subscriptions.read().expect("subscription map lock");
                        for subscription in subscriptions.values() {
                            if subscription.view == View::Home {
                                self.publish_to(subscription, queued.clone());
                            }
                        }
                    }
                    Err(error) => warn!(error = %error, "metrics snapshot failed"),
                }
            }
        })
    }

    fn publish_to(&self, subscription: &Subscription, event: QueuedEvent) {
        match subscription.outbox.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) => {
                // Shed the newest event, keep the client. Sustained shedding
                // flips the fallback flag the writer reports out-of-band.
                self.metrics.observe_sse_drop();
                let mut window = subscription.drops.lock().expect("drop window lock");
                let now = Instant::now();
                if now.duration_since(window.window_started) > self.config.fallback_window {
                    window.window_started = now;
                    window.drops = 0;
                }
                window.drops += 1;
                if window.drops >= self.config.fallback_drops {
                    subscription.fallback_pending.store(true, Ordering::SeqCst);
                    self.metrics.observe_sse_fallback("outbox_overflow");
                    window.drops = 0;
                    window.window_started = now;
                }
            }
        }
    }

    fn fan_out(&self, event_for: impl Fn(&Subscription) -> Option<QueuedEvent>) {
        let subscriptions = self.subscriptions.read().expect("subscription map lock");
        for subscription in subscriptions.values() {
            if let Some(event) = event_for(subscription) {
                self.publish_to(subscription, event);
            }
        }
    }
}

impl EventSink for Broadcaster {
    fn message_stored(&self, message: &StoredMessage) {
        self.latest_cursor.fetch_max(message.id, Ordering::SeqCst);
        let queued = QueuedEvent::new(&LiveEvent::message(message));
        self.fan_out(|subscription| match subscription.view {
            View::Home | View::Messages => Some(queued.clone()),
            View::UserProfile
                if subscription.filter.as_deref() == Some(message.username.as_str()) =>
            {
                Some(queued.clone())
            }
            _ => None,
        });
    }

    fn channel_total_changed(&self, total: &ChannelTotal) {
        let queued = QueuedEvent::new(&LiveEvent::channel_count(self.latest_cursor(), total));
        self.fan_out(|subscription| match subscription.view {
            View::Channels
                if subscription.filter.is_none()
                    || subscription.filter.as_deref() == Some(total.channel_name.as_str()) =>
            {
                Some(queued.clone())
            }
            _ => None,
        });
    }

    fn user_total_changed(&self, total: &UserTotal) {
        let cursor = self.latest_cursor();
        let count_event = QueuedEvent::new(&LiveEvent::user_count(cursor, total));
        let profile_event = QueuedEvent::new(&LiveEvent::user_profile(cursor, total));
        self.fan_out(|subscription| match subscription.view {
            View::Users => Some(count_event.clone()),
            View::UserProfile
                if subscription.filter.as_deref() == Some(total.username.as_str()) =>
            {
                Some(profile_event.clone())
            }
            _ => None,
        });
    }
}

/// Keeps the subscription registered for as long as the SSE writer holds it;
/// dropping it (client gone, write error, shutdown) unregisters.
pub struct SubscriptionHandle {
    broadcaster: Arc<Broadcaster>,
    subscription: Arc<Subscription>,
    receiver: mpsc::Receiver<QueuedEvent>,
}

impl SubscriptionHandle {
    pub async fn recv(&mut self) -> Option<QueuedEvent> {
        self.receiver.recv().await
    }

    /// True once per sustained-overflow episode.
    pub fn take_fallback_pending(&self) -> bool {
        self.subscription.fallback_pending.swap(false, Ordering::SeqCst)
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.broadcaster.unsubscribe(self.subscription.id);
    }
}
