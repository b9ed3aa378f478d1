use std::sync::Arc;

use salesrag_core::chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use salesrag_core::config::IndexingConfig;
use salesrag_core::{
    BatchProgress, ChannelRecord, CrmDirectory, EntityCatalog, IndexState, SkipReason,
};
use salesrag_db::repositories::{ChannelRepository, MessageRepository};
use salesrag_slack::client::SlackGateway;
use salesrag_slack::gate::ApiGate;
use salesrag_vector::{Embedder, VectorIndex};

use crate::crm::ingest_crm_records;
use crate::discovery::discover_channels;
use crate::error::IndexError;
use crate::indexer::{IndexerSettings, MessageIndexer};
use crate::propagate::propagate_channel;

/// Per-run knobs; anything unset falls back to configured defaults.
#[derive(Clone, Copy, Debug, Default)]
pub struct RunRequest {
    pub max_channels: Option<u32>,
    pub page_budget: Option<u32>,
    pub lookback_days: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SkippedChannel {
    pub channel_id: String,
    pub name: String,
    pub reason: SkipReason,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub channels_discovered: u64,
    pub new_channels: u64,
    pub channels_processed: u64,
    pub channels_completed: u64,
    pub channels_partial: u64,
    pub channels_skipped: Vec<SkippedChannel>,
    /// Channels still eligible after this run.
    pub channels_remaining: u64,
    pub messages_indexed: u64,
    pub messages_propagated: u64,
    pub crm_records_ingested: u64,
    pub rate_limit_deferrals: u32,
}

/// One end-to-end indexing run: refresh the entity catalog, discover
/// channels, then claim/join/index/propagate channel by channel. A rate-limit
/// deferral stops the run; unprocessed channels stay eligible for the next
/// invocation.
pub struct IndexingRun {
    gate: Arc<ApiGate>,
    gateway: Arc<dyn SlackGateway>,
    channels: Arc<dyn ChannelRepository>,
    messages: Arc<dyn MessageRepository>,
    vector: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    crm: Arc<dyn CrmDirectory>,
    crm_ingestion: bool,
    config: IndexingConfig,
}

impl IndexingRun {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gate: Arc<ApiGate>,
        gateway: Arc<dyn SlackGateway>,
        channels: Arc<dyn ChannelRepository>,
        messages: Arc<dyn MessageRepository>,
        vector: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        crm: Arc<dyn CrmDirectory>,
        crm_ingestion: bool,
        config: IndexingConfig,
    ) -> Self {
        Self { gate, gateway, channels, messages, vector, embedder, crm, crm_ingestion, config }
    }

    pub async fn execute(&self, request: RunRequest) -> Result<RunSummary, IndexError> {
        let max_channels = request.max_channels.unwrap_or(self.config.default_max_channels);
        let page_budget = request.page_budget.unwrap_or(self.config.default_page_budget);
        let lookback_days = request.lookback_days.unwrap_or(self.config.default_lookback_days);
        let oldest_boundary = lookback_boundary(lookback_days);

        let mut summary = RunSummary::default();

        // Claims left behind by an interrupted run would otherwise stay out
        // of the eligible pool forever.
        let stale = self.channels.release_stale_claims().await?;
        if stale > 0 {
            warn!(
                event_name = "run.stale_claims_released",
                channels = stale,
                "released claims left by an interrupted run"
            );
        }

        let catalog = EntityCatalog::refresh(self.crm.as_ref()).await?;
        if self.crm_ingestion {
            summary.crm_records_ingested = ingest_crm_records(
                self.crm.as_ref(),
                self.embedder.as_ref(),
                self.vector.as_ref(),
            )
            .await?;
        }

        let discovery = discover_channels(
            &self.gate,
            self.gateway.as_ref(),
            self.channels.as_ref(),
            self.config.page_size,
        )
        .await?;
        summary.channels_discovered = discovery.discovered;
        summary.new_channels = discovery.new_channels;

        let indexer = MessageIndexer::new(
            self.gate.clone(),
            self.gateway.clone(),
            self.messages.clone(),
            self.vector.clone(),
            self.embedder.clone(),
            IndexerSettings {
                page_size: self.config.page_size,
                min_message_chars: self.config.min_message_chars,
            },
        );

        let batch = self.channels.next_batch(max_channels).await?;
        info!(
            event_name = "run.batch_selected",
            channels = batch.len(),
            max_channels,
            page_budget,
            lookback_days,
            "channel batch selected"
        );

        'channels: for channel in batch {
            if !self.channels.claim(&channel.id).await? {
                continue;
            }

            match self.gate.execute("conversations.join", || {
                self.gateway.join_channel(&channel.id.0)
            })
            .await
            {
                Ok(()) => {}
                Err(salesrag_slack::gate::GateError::Access(code)) => {
                    warn!(
                        event_name = "run.join_failed",
                        channel_id = %channel.id.0,
                        code = %code,
                        "could not join channel; skipping"
                    );
                    self.channels.mark_skipped(&channel.id, SkipReason::JoinFailed).await?;
                    summary.channels_skipped.push(SkippedChannel {
                        channel_id: channel.id.0.clone(),
                        name: channel.name.clone(),
                        reason: SkipReason::JoinFailed,
                    });
                    continue;
                }
                Err(salesrag_slack::gate::GateError::RateLimited { attempts, last_wait }) => {
                    self.release_claim(&channel).await?;
                    summary.rate_limit_deferrals += 1;
                    warn!(
                        event_name = "run.deferred",
                        channel_id = %channel.id.0,
                        attempts,
                        last_wait_secs = last_wait.as_secs(),
                        "rate limit budget spent on join; deferring run"
                    );
                    break 'channels;
                }
                Err(salesrag_slack::gate::GateError::Fatal(message)) => {
                    self.release_claim(&channel).await?;
                    return Err(IndexError::Fatal(message));
                }
            }

            match indexer
                .index_channel(&channel, &catalog, page_budget, oldest_boundary)
                .await
            {
                Ok(outcome) if outcome.deferred => {
                    self.release_claim(&channel).await?;
                    summary.channels_processed += 1;
                    summary.channels_partial += 1;
                    summary.messages_indexed += outcome.messages_indexed;
                    summary.rate_limit_deferrals += 1;
                    warn!(
                        event_name = "run.deferred",
                        channel_id = %channel.id.0,
                        messages_indexed = outcome.messages_indexed,
                        "rate limit budget spent mid-batch; deferring run"
                    );
                    break 'channels;
                }
                Ok(outcome) => {
                    let state =
                        if outcome.done { IndexState::Complete } else { IndexState::Partial };
                    self.channels
                        .finish_batch(
                            &channel.id,
                            &BatchProgress {
                                state,
                                cursor: outcome.next_cursor.clone(),
                                oldest_indexed_ts: outcome.oldest_indexed_ts.clone(),
                                finished_at: Utc::now(),
                            },
                        )
                        .await?;

                    summary.channels_processed += 1;
                    summary.messages_indexed += outcome.messages_indexed;
                    match state {
                        IndexState::Complete => summary.channels_completed += 1,
                        _ => summary.channels_partial += 1,
                    }

                    summary.messages_propagated += propagate_channel(
                        &channel.id,
                        self.messages.as_ref(),
                        self.vector.as_ref(),
                    )
                    .await?;
                }
                Err(IndexError::Access(code)) => {
                    warn!(
                        event_name = "run.access_denied",
                        channel_id = %channel.id.0,
                        code = %code,
                        "access denied mid-batch; skipping channel"
                    );
                    self.channels.mark_skipped(&channel.id, SkipReason::AccessDenied).await?;
                    summary.channels_skipped.push(SkippedChannel {
                        channel_id: channel.id.0.clone(),
                        name: channel.name.clone(),
                        reason: SkipReason::AccessDenied,
                    });
                }
                Err(other) => {
                    self.release_claim(&channel).await?;
                    return Err(other);
                }
            }
        }

        summary.channels_remaining = self.channels.status_summary().await?.remaining();

        info!(
            event_name = "run.finished",
            channels_processed = summary.channels_processed,
            channels_completed = summary.channels_completed,
            channels_remaining = summary.channels_remaining,
            messages_indexed = summary.messages_indexed,
            messages_propagated = summary.messages_propagated,
            rate_limit_deferrals = summary.rate_limit_deferrals,
            "indexing run finished"
        );

        Ok(summary)
    }

    /// Put a claimed channel back into the eligible pool with whatever
    /// progress its committed pages already recorded. A channel with no
    /// committed history returns to `not_started`; the rest resume as
    /// `partial`.
    async fn release_claim(&self, channel: &ChannelRecord) -> Result<(), IndexError> {
        let current = self.channels.get(&channel.id).await?;
        let (cursor, oldest_indexed_ts) = current
            .map(|record| (record.cursor, record.oldest_indexed_ts))
            .unwrap_or((channel.cursor.clone(), channel.oldest_indexed_ts.clone()));
        let state = if oldest_indexed_ts.is_some() {
            IndexState::Partial
        } else {
            IndexState::NotStarted
        };

        self.channels
            .finish_batch(
                &channel.id,
                &BatchProgress { state, cursor, oldest_indexed_ts, finished_at: Utc::now() },
            )
            .await?;
        Ok(())
    }
}

fn lookback_boundary(lookback_days: i64) -> Option<f64> {
    if lookback_days <= 0 {
        return None;
    }
    let boundary = Utc::now() - ChronoDuration::days(lookback_days);
    Some(boundary.timestamp() as f64)
}

#[cfg(test)]
mod tests {
    use super::lookback_boundary;

    #[test]
    fn non_positive_lookback_means_unbounded() {
        assert_eq!(lookback_boundary(0), None);
        assert_eq!(lookback_boundary(-5), None);
        assert!(lookback_boundary(90).is_some());
    }
}
