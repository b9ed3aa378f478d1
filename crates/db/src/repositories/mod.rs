use async_trait::async_trait;
use thiserror::Error;

use salesrag_core::{
    BatchProgress, ChannelId, ChannelRecord, DiscoveredChannel, EntityMention, MessageId,
    MessageRecord, SkipReason, StatusSummary,
};

pub mod channel;
pub mod memory;
pub mod message;

pub use channel::SqlChannelRepository;
pub use memory::InMemoryIndexStore;
pub use message::SqlMessageRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

/// Durable view of discovered channels and their indexing lifecycle.
#[async_trait]
pub trait ChannelRepository: Send + Sync {
    /// Merge freshly discovered channels into the tracked set. Channels seen
    /// before keep their status and progress; only name/archived/private
    /// metadata is refreshed. Returns how many channels were new.
    async fn merge_discovered(
        &self,
        channels: &[DiscoveredChannel],
    ) -> Result<u64, RepositoryError>;

    /// Eligible channels for the next run: never-indexed ones first, then
    /// partial channels by oldest `last_indexed_at`.
    async fn next_batch(&self, limit: u32) -> Result<Vec<ChannelRecord>, RepositoryError>;

    /// Atomically move an eligible channel to `in_progress`. Returns `false`
    /// when another worker got there first or the channel is no longer
    /// eligible.
    async fn claim(&self, id: &ChannelId) -> Result<bool, RepositoryError>;

    /// Record the outcome of a finished batch (state, cursor, boundary).
    async fn finish_batch(
        &self,
        id: &ChannelId,
        progress: &BatchProgress,
    ) -> Result<(), RepositoryError>;

    async fn mark_skipped(
        &self,
        id: &ChannelId,
        reason: SkipReason,
    ) -> Result<(), RepositoryError>;

    /// Put every skipped channel back to `not_started`. Returns how many were
    /// reset.
    async fn reset_skipped(&self) -> Result<u64, RepositoryError>;

    /// Return `in_progress` channels to the eligible pool. A claim left
    /// behind by a crashed run is stale by the time the next run starts;
    /// channels with committed history resume as `partial`, untouched ones as
    /// `not_started`. Returns how many claims were released.
    async fn release_stale_claims(&self) -> Result<u64, RepositoryError>;

    async fn get(&self, id: &ChannelId) -> Result<Option<ChannelRecord>, RepositoryError>;

    async fn list_all(&self) -> Result<Vec<ChannelRecord>, RepositoryError>;

    async fn status_summary(&self) -> Result<StatusSummary, RepositoryError>;
}

/// Durable store for indexed messages.
#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn upsert(&self, message: &MessageRecord) -> Result<(), RepositoryError>;

    /// Commit one history page atomically: the message rows and the channel's
    /// cursor/boundary land in a single transaction, so an interrupted run
    /// never records progress past messages it did not persist.
    async fn commit_page(
        &self,
        channel_id: &ChannelId,
        messages: &[MessageRecord],
        cursor: Option<&str>,
        oldest_indexed_ts: Option<&str>,
    ) -> Result<(), RepositoryError>;

    async fn list_for_channel(
        &self,
        channel_id: &ChannelId,
    ) -> Result<Vec<MessageRecord>, RepositoryError>;

    /// Messages in the channel that belong to a thread, ordered by thread
    /// root then timestamp.
    async fn list_threaded(
        &self,
        channel_id: &ChannelId,
    ) -> Result<Vec<MessageRecord>, RepositoryError>;

    async fn set_thread_mentions(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        thread_mentions: &[EntityMention],
    ) -> Result<(), RepositoryError>;

    async fn count_for_channel(&self, channel_id: &ChannelId) -> Result<u64, RepositoryError>;
}
