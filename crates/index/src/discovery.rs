use tracing::info;

use salesrag_core::SkipReason;
use salesrag_db::repositories::ChannelRepository;
use salesrag_slack::client::SlackGateway;
use salesrag_slack::gate::ApiGate;

use crate::error::IndexError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DiscoverySummary {
    pub discovered: u64,
    pub new_channels: u64,
    pub archived_skipped: u64,
}

/// Walk the platform's channel listing and merge it into the tracked set.
/// Channels seen before keep their progress; archived channels go straight to
/// `skipped` so no batch wastes a join on them.
pub async fn discover_channels(
    gate: &ApiGate,
    gateway: &dyn SlackGateway,
    channels: &dyn ChannelRepository,
    page_size: u32,
) -> Result<DiscoverySummary, IndexError> {
    let mut summary = DiscoverySummary::default();
    let mut cursor: Option<String> = None;

    loop {
        let page = gate
            .execute("conversations.list", || gateway.list_channels(cursor.as_deref(), page_size))
            .await?;

        summary.discovered += page.channels.len() as u64;
        summary.new_channels += channels.merge_discovered(&page.channels).await?;

        for channel in &page.channels {
            if channel.is_archived {
                let record = channels.get(&channel.id).await?;
                if record.map(|record| record.state.is_eligible()).unwrap_or(false) {
                    channels.mark_skipped(&channel.id, SkipReason::Archived).await?;
                    summary.archived_skipped += 1;
                }
            }
        }

        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    info!(
        event_name = "discovery.completed",
        discovered = summary.discovered,
        new_channels = summary.new_channels,
        archived_skipped = summary.archived_skipped,
        "channel discovery finished"
    );

    Ok(summary)
}
