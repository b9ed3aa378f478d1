use tracing::info;

use salesrag_core::thread::plan_updates;
use salesrag_core::ChannelId;
use salesrag_db::repositories::MessageRepository;
use salesrag_vector::{doc_id, Source, VectorIndex};

use crate::error::IndexError;

/// Backfill thread-level mentions across every multi-message thread in the
/// channel. Updates are metadata-only on the vector side, so nothing is
/// re-embedded. Running twice without new messages updates nothing the
/// second time.
pub async fn propagate_channel(
    channel_id: &ChannelId,
    messages: &dyn MessageRepository,
    vector: &dyn VectorIndex,
) -> Result<u64, IndexError> {
    let threaded = messages.list_threaded(channel_id).await?;
    let updates = plan_updates(&threaded);
    let update_count = updates.len() as u64;

    for update in updates {
        messages
            .set_thread_mentions(channel_id, &update.message_id, &update.thread_mentions)
            .await?;
        vector
            .update_mentions(
                &doc_id(Source::Slack, &channel_id.0, &update.message_id.0),
                &update.thread_mentions,
            )
            .await?;
    }

    if update_count > 0 {
        info!(
            event_name = "propagate.updated",
            channel_id = %channel_id.0,
            updated = update_count,
            "thread mentions propagated"
        );
    }

    Ok(update_count)
}
