use std::collections::BTreeMap;

use tokio::sync::RwLock;

use salesrag_core::chrono::Utc;
use salesrag_core::{
    BatchProgress, ChannelId, ChannelRecord, DiscoveredChannel, EntityMention, IndexState,
    MessageId, MessageRecord, SkipReason, StatusSummary,
};

use super::{ChannelRepository, MessageRepository, RepositoryError};

/// In-memory stand-in for both repositories, used by pipeline tests that do
/// not want a database.
#[derive(Default)]
pub struct InMemoryIndexStore {
    channels: RwLock<BTreeMap<String, ChannelRecord>>,
    messages: RwLock<BTreeMap<(String, String), MessageRecord>>,
}

#[async_trait::async_trait]
impl ChannelRepository for InMemoryIndexStore {
    async fn merge_discovered(
        &self,
        discovered: &[DiscoveredChannel],
    ) -> Result<u64, RepositoryError> {
        let mut channels = self.channels.write().await;
        let mut new_count = 0_u64;

        for channel in discovered {
            match channels.get_mut(&channel.id.0) {
                Some(existing) => {
                    existing.name = channel.name.clone();
                    existing.is_archived = channel.is_archived;
                    existing.is_private = channel.is_private;
                }
                None => {
                    channels.insert(
                        channel.id.0.clone(),
                        ChannelRecord {
                            id: channel.id.clone(),
                            name: channel.name.clone(),
                            is_archived: channel.is_archived,
                            is_private: channel.is_private,
                            state: IndexState::NotStarted,
                            skip_reason: None,
                            cursor: None,
                            oldest_indexed_ts: None,
                            last_indexed_at: None,
                            discovered_at: Utc::now(),
                        },
                    );
                    new_count += 1;
                }
            }
        }

        Ok(new_count)
    }

    async fn next_batch(&self, limit: u32) -> Result<Vec<ChannelRecord>, RepositoryError> {
        let channels = self.channels.read().await;
        let mut eligible: Vec<ChannelRecord> =
            channels.values().filter(|channel| channel.state.is_eligible()).cloned().collect();

        eligible.sort_by(|left, right| {
            let rank =
                |channel: &ChannelRecord| u8::from(channel.state != IndexState::NotStarted);
            rank(left)
                .cmp(&rank(right))
                .then(left.last_indexed_at.cmp(&right.last_indexed_at))
                .then(left.id.0.cmp(&right.id.0))
        });
        eligible.truncate(limit as usize);
        Ok(eligible)
    }

    async fn claim(&self, id: &ChannelId) -> Result<bool, RepositoryError> {
        let mut channels = self.channels.write().await;
        match channels.get_mut(&id.0) {
            Some(channel) if channel.state.is_eligible() => {
                channel.state = IndexState::InProgress;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finish_batch(
        &self,
        id: &ChannelId,
        progress: &BatchProgress,
    ) -> Result<(), RepositoryError> {
        let mut channels = self.channels.write().await;
        if let Some(channel) = channels.get_mut(&id.0) {
            channel.state = progress.state;
            channel.cursor = progress.cursor.clone();
            channel.oldest_indexed_ts = progress.oldest_indexed_ts.clone();
            channel.last_indexed_at = Some(progress.finished_at);
        }
        Ok(())
    }

    async fn mark_skipped(
        &self,
        id: &ChannelId,
        reason: SkipReason,
    ) -> Result<(), RepositoryError> {
        let mut channels = self.channels.write().await;
        if let Some(channel) = channels.get_mut(&id.0) {
            channel.state = IndexState::Skipped;
            channel.skip_reason = Some(reason);
        }
        Ok(())
    }

    async fn reset_skipped(&self) -> Result<u64, RepositoryError> {
        let mut channels = self.channels.write().await;
        let mut reset = 0_u64;
        for channel in channels.values_mut() {
            if channel.state == IndexState::Skipped {
                channel.state = IndexState::NotStarted;
                channel.skip_reason = None;
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn release_stale_claims(&self) -> Result<u64, RepositoryError> {
        let mut channels = self.channels.write().await;
        let mut released = 0_u64;
        for channel in channels.values_mut() {
            if channel.state == IndexState::InProgress {
                channel.state = if channel.oldest_indexed_ts.is_some() {
                    IndexState::Partial
                } else {
                    IndexState::NotStarted
                };
                released += 1;
            }
        }
        Ok(released)
    }

    async fn get(&self, id: &ChannelId) -> Result<Option<ChannelRecord>, RepositoryError> {
        let channels = self.channels.read().await;
        Ok(channels.get(&id.0).cloned())
    }

    async fn list_all(&self) -> Result<Vec<ChannelRecord>, RepositoryError> {
        let channels = self.channels.read().await;
        Ok(channels.values().cloned().collect())
    }

    async fn status_summary(&self) -> Result<StatusSummary, RepositoryError> {
        let channels = self.channels.read().await;
        let mut summary = StatusSummary::default();
        for channel in channels.values() {
            match channel.state {
                IndexState::NotStarted => summary.not_started += 1,
                IndexState::InProgress => summary.in_progress += 1,
                IndexState::Partial => summary.partial += 1,
                IndexState::Complete => summary.complete += 1,
                IndexState::Skipped => summary.skipped += 1,
            }
        }
        Ok(summary)
    }
}

#[async_trait::async_trait]
impl MessageRepository for InMemoryIndexStore {
    async fn upsert(&self, message: &MessageRecord) -> Result<(), RepositoryError> {
        let mut messages = self.messages.write().await;
        messages
            .insert((message.channel_id.0.clone(), message.id.0.clone()), message.clone());
        Ok(())
    }

    async fn commit_page(
        &self,
        channel_id: &ChannelId,
        page: &[MessageRecord],
        cursor: Option<&str>,
        oldest_indexed_ts: Option<&str>,
    ) -> Result<(), RepositoryError> {
        {
            let mut messages = self.messages.write().await;
            for message in page {
                messages.insert(
                    (message.channel_id.0.clone(), message.id.0.clone()),
                    message.clone(),
                );
            }
        }

        let mut channels = self.channels.write().await;
        if let Some(channel) = channels.get_mut(&channel_id.0) {
            channel.cursor = cursor.map(str::to_string);
            channel.oldest_indexed_ts = oldest_indexed_ts.map(str::to_string);
        }
        Ok(())
    }

    async fn list_for_channel(
        &self,
        channel_id: &ChannelId,
    ) -> Result<Vec<MessageRecord>, RepositoryError> {
        let messages = self.messages.read().await;
        Ok(messages
            .values()
            .filter(|message| message.channel_id == *channel_id)
            .cloned()
            .collect())
    }

    async fn list_threaded(
        &self,
        channel_id: &ChannelId,
    ) -> Result<Vec<MessageRecord>, RepositoryError> {
        let messages = self.messages.read().await;
        Ok(messages
            .values()
            .filter(|message| message.channel_id == *channel_id && message.in_thread())
            .cloned()
            .collect())
    }

    async fn set_thread_mentions(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        thread_mentions: &[EntityMention],
    ) -> Result<(), RepositoryError> {
        let mut messages = self.messages.write().await;
        if let Some(message) =
            messages.get_mut(&(channel_id.0.clone(), message_id.0.clone()))
        {
            message.thread_mentions = thread_mentions.to_vec();
        }
        Ok(())
    }

    async fn count_for_channel(&self, channel_id: &ChannelId) -> Result<u64, RepositoryError> {
        let messages = self.messages.read().await;
        Ok(messages.values().filter(|message| message.channel_id == *channel_id).count() as u64)
    }
}
