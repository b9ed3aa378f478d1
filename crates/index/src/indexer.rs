use std::sync::Arc;

use salesrag_core::chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use salesrag_core::{ChannelRecord, EntityCatalog, MessageId, MessageRecord};
use salesrag_db::repositories::MessageRepository;
use salesrag_slack::client::{RawMessage, SlackGateway};
use salesrag_slack::gate::{ApiGate, GateError};
use salesrag_vector::{doc_id, Embedder, EntryMetadata, Source, VectorEntry, VectorIndex};

use crate::error::IndexError;

#[derive(Clone, Copy, Debug)]
pub struct IndexerSettings {
    pub page_size: u32,
    pub min_message_chars: usize,
}

/// Outcome of one channel batch. `done` means end-of-history or the lookback
/// boundary was reached; otherwise `next_cursor` resumes the walk. `deferred`
/// means the rate-limit budget ran out mid-batch: the counts cover the pages
/// that committed before the wall, and the cursor stays at the last of them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub messages_seen: u64,
    pub messages_indexed: u64,
    pub next_cursor: Option<String>,
    pub oldest_indexed_ts: Option<String>,
    pub done: bool,
    pub deferred: bool,
}

/// Walks a channel's history backward page by page, filtering, annotating and
/// committing as it goes. Each page commits atomically (vector entries first,
/// then message rows plus cursor in one transaction), so an abort mid-batch
/// resumes from the last committed page.
pub struct MessageIndexer {
    gate: Arc<ApiGate>,
    gateway: Arc<dyn SlackGateway>,
    messages: Arc<dyn MessageRepository>,
    vector: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    settings: IndexerSettings,
}

impl MessageIndexer {
    pub fn new(
        gate: Arc<ApiGate>,
        gateway: Arc<dyn SlackGateway>,
        messages: Arc<dyn MessageRepository>,
        vector: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        settings: IndexerSettings,
    ) -> Self {
        Self { gate, gateway, messages, vector, embedder, settings }
    }

    pub async fn index_channel(
        &self,
        channel: &ChannelRecord,
        catalog: &EntityCatalog,
        page_budget: u32,
        oldest_boundary: Option<f64>,
    ) -> Result<BatchOutcome, IndexError> {
        let mut cursor = channel.cursor.clone();
        let mut oldest_indexed_ts = channel.oldest_indexed_ts.clone();
        let mut outcome = BatchOutcome::default();

        for page_number in 0..page_budget {
            let fetch = self
                .gate
                .execute("conversations.history", || {
                    self.gateway.fetch_history(
                        &channel.id.0,
                        cursor.as_deref(),
                        oldest_boundary,
                        self.settings.page_size,
                    )
                })
                .await;

            let page = match fetch {
                Ok(page) => page,
                // The pages already committed stay counted; the cursor was
                // last advanced by their commit, so resumption is exact.
                Err(GateError::RateLimited { attempts, last_wait }) => {
                    warn!(
                        event_name = "indexer.deferred",
                        channel_id = %channel.id.0,
                        attempts,
                        last_wait_secs = last_wait.as_secs(),
                        pages_committed = page_number,
                        "rate limit budget spent mid-batch; deferring channel"
                    );
                    outcome.deferred = true;
                    break;
                }
                Err(other) => return Err(other.into()),
            };

            outcome.messages_seen += page.messages.len() as u64;

            let mut records = Vec::new();
            for raw in &page.messages {
                if !eligible(raw, self.settings.min_message_chars) {
                    continue;
                }
                if let Some(record) = normalize(channel, raw, catalog) {
                    records.push(record);
                }
            }

            // Vector entries land before the page commit, so a crash between
            // the two can never record a cursor past unindexed documents.
            for record in &records {
                let embedding = self.embedder.embed(&record.text).await?;
                self.vector
                    .upsert(&VectorEntry {
                        doc_id: doc_id(Source::Slack, &channel.id.0, &record.id.0),
                        source: Source::Slack,
                        metadata: EntryMetadata {
                            channel_id: Some(channel.id.clone()),
                            channel_name: Some(channel.name.clone()),
                            author_id: Some(record.author_id.clone()),
                            ts: record.id.0.clone(),
                            in_thread: record.in_thread(),
                            mentions: record.thread_mentions.clone(),
                        },
                        content: record.text.clone(),
                        embedding,
                        indexed_at: record.indexed_at,
                    })
                    .await?;
            }

            // The processed boundary only ever moves backward in time.
            for raw in &page.messages {
                oldest_indexed_ts = older_ts(oldest_indexed_ts.take(), &raw.ts);
            }

            let page_done = page.next_cursor.is_none() || !page.has_more;
            let next_cursor = if page_done { None } else { page.next_cursor.clone() };

            self.messages
                .commit_page(
                    &channel.id,
                    &records,
                    next_cursor.as_deref(),
                    oldest_indexed_ts.as_deref(),
                )
                .await?;

            outcome.messages_indexed += records.len() as u64;
            cursor = next_cursor;

            debug!(
                event_name = "indexer.page_committed",
                channel_id = %channel.id.0,
                page = page_number + 1,
                kept = records.len(),
                seen = page.messages.len(),
                done = page_done,
                "history page committed"
            );

            if page_done {
                outcome.done = true;
                break;
            }
        }

        outcome.next_cursor = cursor;
        outcome.oldest_indexed_ts = oldest_indexed_ts;

        info!(
            event_name = "indexer.batch_finished",
            channel_id = %channel.id.0,
            channel_name = %channel.name,
            messages_indexed = outcome.messages_indexed,
            messages_seen = outcome.messages_seen,
            done = outcome.done,
            "channel batch finished"
        );

        Ok(outcome)
    }
}

/// Filter order: non-human author, then housekeeping subtypes, then minimum
/// length. Entity presence never filters a message.
fn eligible(raw: &RawMessage, min_chars: usize) -> bool {
    if raw.bot_id.is_some() || raw.user.is_none() {
        return false;
    }
    if matches!(raw.subtype.as_deref(), Some("channel_join" | "channel_leave")) {
        return false;
    }
    raw.text.trim().chars().count() >= min_chars
}

fn normalize(
    channel: &ChannelRecord,
    raw: &RawMessage,
    catalog: &EntityCatalog,
) -> Option<MessageRecord> {
    let posted_at = posted_at_from_ts(&raw.ts)?;
    let mentions = catalog.extract_mentions(&raw.text);

    Some(MessageRecord {
        channel_id: channel.id.clone(),
        id: MessageId(raw.ts.clone()),
        thread_ts: raw.thread_ts.clone(),
        author_id: raw.user.clone()?,
        text: raw.text.clone(),
        posted_at,
        thread_mentions: mentions.clone(),
        mentions,
        indexed_at: Utc::now(),
    })
}

fn posted_at_from_ts(ts: &str) -> Option<DateTime<Utc>> {
    let epoch = ts.parse::<f64>().ok()?;
    let secs = epoch.trunc() as i64;
    let nanos = (epoch.fract() * 1_000_000_000.0) as u32;
    DateTime::from_timestamp(secs, nanos)
}

fn older_ts(current: Option<String>, candidate: &str) -> Option<String> {
    let candidate_epoch = candidate.parse::<f64>().ok();
    match (&current, candidate_epoch) {
        (_, None) => current,
        (None, Some(_)) => Some(candidate.to_string()),
        (Some(existing), Some(candidate_epoch)) => {
            let existing_epoch = existing.parse::<f64>().unwrap_or(f64::MAX);
            if candidate_epoch < existing_epoch {
                Some(candidate.to_string())
            } else {
                current
            }
        }
    }
}
