pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Channel, ChannelTotal, ResolvedMessage, StoredMessage, User, UserTotal};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store timeout: {0}")]
    Timeout(String),
    #[error("constraint violated: {0}")]
    Constraint(String),
}

/// Result of one atomic batch insert: the stored rows in input order plus the
/// post-commit aggregates for every channel and user the batch touched.
#[derive(Debug, Default)]
pub struct StoredBatch {
    pub messages: Vec<StoredMessage>,
    pub channel_totals: Vec<ChannelTotal>,
    pub user_totals: Vec<UserTotal>,
}

#[async_trait]
pub trait ChannelRepo: Send + Sync {
    /// Idempotent under concurrency: a racing insert on the unique name
    /// index resolves to the existing row.
    async fn get_or_create_channel(&self, name: &str) -> Result<Channel, StoreError>;
    async fn get_channel(&self, name: &str) -> Result<Option<Channel>, StoreError>;
    async fn list_channels(&self) -> Result<Vec<Channel>, StoreError>;
    async fn channel_count(&self) -> Result<i64, StoreError>;
    async fn enabled_channel_count(&self) -> Result<i64, StoreError>;
}

#[async_trait]
pub trait UserRepo: Send + Sync {
    /// Idempotent under concurrency; refreshes the display name when it has
    /// changed since the row was created.
    async fn get_or_create_user(
        &self,
        username: &str,
        display_name: &str,
    ) -> Result<User, StoreError>;
    async fn get_user(&self, username: &str) -> Result<Option<User>, StoreError>;
    async fn list_users(&self) -> Result<Vec<User>, StoreError>;
    async fn user_count(&self) -> Result<i64, StoreError>;
}

#[async_trait]
pub trait MessageRepo: Send + Sync {
    /// Atomic: either every row in the batch is stored with a strictly
    /// increasing id and the aggregate counters are updated, or nothing is.
    async fn create_batch(&self, batch: Vec<ResolvedMessage>) -> Result<StoredBatch, StoreError>;
    async fn get_global_after_id(
        &self,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError>;
    async fn get_global_latest_id(&self) -> Result<i64, StoreError>;
    async fn message_count(&self) -> Result<i64, StoreError>;
}

/// Aggregate contract the core holds; a SQL-backed implementation plugs in
/// here without touching the pipeline.
pub trait MessageStore: ChannelRepo + UserRepo + MessageRepo {}

impl<T: ChannelRepo + UserRepo + MessageRepo> MessageStore for T {}
