//! End-to-end pipeline scenarios over scripted gateways and in-memory stores.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use salesrag_core::config::IndexingConfig;
use salesrag_core::{
    ApplicationError, ChannelId, CrmDirectory, CrmRecord, DiscoveredChannel, EntityKind,
    EntityMention, IndexState,
};
use salesrag_db::repositories::{ChannelRepository, InMemoryIndexStore, MessageRepository};
use salesrag_index::{propagate_channel, IndexingRun, RunRequest};
use salesrag_slack::client::{ApiError, ChannelPage, HistoryPage, RawMessage, SlackGateway};
use salesrag_slack::gate::{ApiGate, BackoffPolicy, Sleeper};
use salesrag_vector::{doc_id, InMemoryVectorStore, Source, VectorIndex};

#[derive(Default)]
struct NoopSleeper;

#[async_trait]
impl Sleeper for NoopSleeper {
    async fn sleep(&self, _duration: Duration) {}
}

/// Gateway double: channel listing is static, history responses are scripted
/// in order, joins always succeed.
struct ScriptedGateway {
    channels: Vec<DiscoveredChannel>,
    history: Mutex<VecDeque<Result<HistoryPage, ApiError>>>,
}

impl ScriptedGateway {
    fn new(channels: Vec<DiscoveredChannel>) -> Self {
        Self { channels, history: Mutex::new(VecDeque::new()) }
    }

    fn script_history(&self, response: Result<HistoryPage, ApiError>) {
        self.history.lock().expect("script lock").push_back(response);
    }
}

#[async_trait]
impl SlackGateway for ScriptedGateway {
    async fn list_channels(
        &self,
        _cursor: Option<&str>,
        _limit: u32,
    ) -> Result<ChannelPage, ApiError> {
        Ok(ChannelPage { channels: self.channels.clone(), next_cursor: None })
    }

    async fn fetch_history(
        &self,
        _channel_id: &str,
        _cursor: Option<&str>,
        _oldest: Option<f64>,
        _limit: u32,
    ) -> Result<HistoryPage, ApiError> {
        self.history
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or_else(|| Ok(HistoryPage::default()))
    }

    async fn join_channel(&self, _channel_id: &str) -> Result<(), ApiError> {
        Ok(())
    }
}

struct ScriptedCrm {
    records: Vec<CrmRecord>,
}

#[async_trait]
impl CrmDirectory for ScriptedCrm {
    async fn records(&self, kind: EntityKind) -> Result<Vec<CrmRecord>, ApplicationError> {
        Ok(self.records.iter().filter(|record| record.kind == kind).cloned().collect())
    }
}

fn company(name: &str) -> CrmRecord {
    CrmRecord {
        id: format!("001-{name}"),
        kind: EntityKind::Company,
        name: name.to_string(),
        summary: format!("Account: {name}"),
    }
}

fn sales_channel(id: &str) -> DiscoveredChannel {
    DiscoveredChannel {
        id: ChannelId(id.to_string()),
        name: "sales".to_string(),
        is_archived: false,
        is_private: false,
    }
}

fn human(ts: &str, thread_ts: Option<&str>, text: &str) -> RawMessage {
    RawMessage {
        ts: ts.to_string(),
        thread_ts: thread_ts.map(str::to_owned),
        user: Some("U1".to_string()),
        bot_id: None,
        subtype: None,
        text: text.to_string(),
    }
}

fn page(messages: Vec<RawMessage>, next_cursor: Option<&str>) -> HistoryPage {
    HistoryPage {
        messages,
        has_more: next_cursor.is_some(),
        next_cursor: next_cursor.map(str::to_owned),
    }
}

struct Harness {
    gateway: Arc<ScriptedGateway>,
    store: Arc<InMemoryIndexStore>,
    vector: Arc<InMemoryVectorStore>,
    run: IndexingRun,
}

fn harness(gateway: ScriptedGateway, companies: Vec<CrmRecord>) -> Harness {
    let gateway = Arc::new(gateway);
    let store = Arc::new(InMemoryIndexStore::default());
    let vector = Arc::new(InMemoryVectorStore::default());
    let gate = Arc::new(ApiGate::with_sleeper(
        Duration::ZERO,
        BackoffPolicy::default(),
        Arc::new(NoopSleeper),
    ));

    let run = IndexingRun::new(
        gate,
        gateway.clone(),
        store.clone(),
        store.clone(),
        vector.clone(),
        Arc::new(salesrag_vector::HashEmbedder::default()),
        Arc::new(ScriptedCrm { records: companies }),
        false,
        IndexingConfig {
            min_call_spacing_secs: 0,
            backoff_base_secs: 60,
            max_rate_limit_attempts: 3,
            retry_hint_buffer_secs: 5,
            page_size: 100,
            default_page_budget: 10,
            default_max_channels: 10,
            default_lookback_days: 0,
            min_message_chars: 3,
        },
    );

    Harness { gateway, store, vector, run }
}

#[tokio::test]
async fn mixed_page_indexes_only_real_human_messages() {
    let gateway = ScriptedGateway::new(vec![sales_channel("C1")]);
    gateway.script_history(Ok(page(
        vec![
            human("1730000005.0000", None, "Acme demo went well, sending pricing"),
            RawMessage {
                bot_id: Some("B1".to_string()),
                user: None,
                ..human("1730000004.0000", None, "Daily standup reminder")
            },
            RawMessage {
                subtype: Some("channel_join".to_string()),
                ..human("1730000003.0000", None, "joined the channel")
            },
            human("1730000002.0000", None, "ok"),
            human("1730000001.0000", Some("1730000001.0000"), "kickoff thread for Acme"),
        ],
        None,
    )));

    let harness = harness(gateway, vec![company("Acme")]);
    let summary = harness.run.execute(RunRequest::default()).await.expect("run");

    assert_eq!(summary.messages_indexed, 2);
    assert_eq!(summary.channels_completed, 1);

    let channel = ChannelId("C1".to_string());
    let stored = harness.store.list_for_channel(&channel).await.expect("list");
    assert_eq!(stored.len(), 2);
    assert!(stored.iter().all(|message| message
        .mentions
        .contains(&EntityMention::new(EntityKind::Company, "Acme"))));
    assert_eq!(harness.vector.count(Some(Source::Slack)).await.expect("count"), 2);
}

#[tokio::test]
async fn one_hundred_twenty_messages_complete_across_three_runs() {
    let gateway = ScriptedGateway::new(vec![sales_channel("C1")]);
    let pages: Vec<Vec<RawMessage>> = (0..3)
        .map(|page_index| {
            let size = if page_index == 2 { 20 } else { 50 };
            (0..size)
                .map(|i| {
                    let ts = format!("17300000{:02}.{:04}", 99 - page_index * 30, size - i);
                    human(&ts, None, &format!("pipeline note number {i} for the Acme account"))
                })
                .collect()
        })
        .collect();

    gateway.script_history(Ok(page(pages[0].clone(), Some("cursor-2"))));
    gateway.script_history(Ok(page(pages[1].clone(), Some("cursor-3"))));
    gateway.script_history(Ok(page(pages[2].clone(), None)));

    let harness = harness(gateway, vec![company("Acme")]);
    let channel = ChannelId("C1".to_string());
    let request = RunRequest { page_budget: Some(1), ..RunRequest::default() };

    let first = harness.run.execute(request).await.expect("first run");
    assert_eq!(first.messages_indexed, 50);
    assert_eq!(first.channels_partial, 1);
    let record = harness.store.get(&channel).await.expect("get").expect("exists");
    assert_eq!(record.state, IndexState::Partial);
    assert_eq!(record.cursor.as_deref(), Some("cursor-2"));

    let second = harness.run.execute(request).await.expect("second run");
    assert_eq!(second.messages_indexed, 50);

    let third = harness.run.execute(request).await.expect("third run");
    assert_eq!(third.messages_indexed, 20);
    assert_eq!(third.channels_completed, 1);

    let record = harness.store.get(&channel).await.expect("get").expect("exists");
    assert_eq!(record.state, IndexState::Complete);
    assert_eq!(record.cursor, None);

    // No page replayed, no message dropped.
    assert_eq!(harness.store.count_for_channel(&channel).await.expect("count"), 120);
    assert_eq!(harness.vector.count(Some(Source::Slack)).await.expect("count"), 120);

    // A completed channel is not selected again.
    let idle = harness.run.execute(request).await.expect("idle run");
    assert_eq!(idle.channels_processed, 0);
    assert_eq!(idle.channels_remaining, 0);
}

#[tokio::test]
async fn rate_limited_page_defers_with_cursor_at_last_committed_page() {
    let gateway = ScriptedGateway::new(vec![sales_channel("C1")]);
    gateway.script_history(Ok(page(
        vec![human("1730000009.0000", None, "first page of history")],
        Some("cursor-2"),
    )));
    // The gate retries three times before giving up; all three hit the wall.
    for _ in 0..3 {
        gateway.script_history(Err(ApiError::RateLimited { retry_after: None }));
    }

    let harness = harness(gateway, Vec::new());
    let channel = ChannelId("C1".to_string());
    let request = RunRequest { page_budget: Some(5), ..RunRequest::default() };

    let summary = harness.run.execute(request).await.expect("run");
    assert_eq!(summary.rate_limit_deferrals, 1);
    assert_eq!(summary.messages_indexed, 1);

    let record = harness.store.get(&channel).await.expect("get").expect("exists");
    assert_eq!(record.state, IndexState::Partial, "deferred channel stays eligible");
    assert_eq!(record.cursor.as_deref(), Some("cursor-2"), "cursor stops at last committed page");
    assert_eq!(harness.store.count_for_channel(&channel).await.expect("count"), 1);

    // Next run resumes and finishes.
    harness.gateway.script_history(Ok(page(
        vec![human("1730000001.0000", None, "second page of history")],
        None,
    )));
    let resumed = harness.run.execute(request).await.expect("resume run");
    assert_eq!(resumed.messages_indexed, 1);
    assert_eq!(resumed.channels_completed, 1);
    assert_eq!(harness.store.count_for_channel(&channel).await.expect("count"), 2);
}

#[tokio::test]
async fn fatal_error_releases_the_claim_for_the_next_run() {
    let gateway = ScriptedGateway::new(vec![sales_channel("C1")]);
    gateway.script_history(Err(ApiError::Fatal("internal_error".to_string())));

    let harness = harness(gateway, Vec::new());
    let channel = ChannelId("C1".to_string());

    let error = harness.run.execute(RunRequest::default()).await.expect_err("run aborts");
    assert!(matches!(error, salesrag_index::IndexError::Fatal(_)));

    // Nothing committed, so the channel goes back to square one, not limbo.
    let record = harness.store.get(&channel).await.expect("get").expect("exists");
    assert_eq!(record.state, IndexState::NotStarted);

    harness.gateway.script_history(Ok(page(
        vec![human("1730000001.0000", None, "back to normal history")],
        None,
    )));
    let retry = harness.run.execute(RunRequest::default()).await.expect("retry run");
    assert_eq!(retry.channels_processed, 1);
    assert_eq!(retry.channels_completed, 1);
}

#[tokio::test]
async fn deferral_before_any_commit_leaves_the_channel_untouched() {
    let gateway = ScriptedGateway::new(vec![sales_channel("C1")]);
    for _ in 0..3 {
        gateway.script_history(Err(ApiError::RateLimited { retry_after: None }));
    }

    let harness = harness(gateway, Vec::new());
    let channel = ChannelId("C1".to_string());

    let summary = harness.run.execute(RunRequest::default()).await.expect("run");
    assert_eq!(summary.rate_limit_deferrals, 1);
    assert_eq!(summary.messages_indexed, 0);

    let record = harness.store.get(&channel).await.expect("get").expect("exists");
    assert_eq!(record.state, IndexState::NotStarted, "no committed history means no partial");
    assert_eq!(record.cursor, None);
}

#[tokio::test]
async fn stale_claim_from_a_crashed_run_is_reclaimed() {
    let gateway = ScriptedGateway::new(vec![sales_channel("C1")]);
    gateway.script_history(Ok(page(
        vec![human("1730000001.0000", None, "history after the crash")],
        None,
    )));

    let harness = harness(gateway, Vec::new());
    let channel = ChannelId("C1".to_string());

    // A crashed run left the channel claimed.
    harness
        .store
        .merge_discovered(&[sales_channel("C1")])
        .await
        .expect("seed channel");
    assert!(harness.store.claim(&channel).await.expect("claim"));

    let summary = harness.run.execute(RunRequest::default()).await.expect("run");
    assert_eq!(summary.channels_processed, 1);
    assert_eq!(summary.channels_completed, 1);
    assert_eq!(summary.messages_indexed, 1);
}

#[tokio::test]
async fn thread_mentions_backfill_to_every_member_and_settle() {
    let gateway = ScriptedGateway::new(vec![sales_channel("C1")]);
    let root = "1730000001.0000";
    gateway.script_history(Ok(page(
        vec![
            human("1730000004.0000", Some(root), "pushing the contract through legal"),
            human("1730000003.0000", Some(root), "they want the enterprise tier"),
            human("1730000002.0000", Some(root), "call went long but positive"),
            human(root, Some(root), "Zillow kickoff call notes"),
        ],
        None,
    )));

    let harness = harness(gateway, vec![company("Zillow")]);
    let channel = ChannelId("C1".to_string());

    let summary = harness.run.execute(RunRequest::default()).await.expect("run");
    assert_eq!(summary.messages_indexed, 4);
    // Root already carries the mention; the three replies get backfilled,
    // and the root's thread-level set is updated to the union too.
    assert_eq!(summary.messages_propagated, 3);

    let zillow = EntityMention::new(EntityKind::Company, "Zillow");
    let stored = harness.store.list_for_channel(&channel).await.expect("list");
    for message in &stored {
        assert!(
            message.thread_mentions.contains(&zillow),
            "thread member {} missing backfilled mention",
            message.id.0
        );
        assert!(
            message.mentions.iter().all(|mention| message.thread_mentions.contains(mention)),
            "direct mentions must stay a subset of thread mentions"
        );
    }
    // Direct mentions untouched: only the root mentions Zillow directly.
    let direct: usize =
        stored.iter().filter(|message| message.mentions.contains(&zillow)).count();
    assert_eq!(direct, 1);

    // Vector metadata follows without re-embedding.
    for message in &stored {
        let entry = harness
            .vector
            .get(&doc_id(Source::Slack, &channel.0, &message.id.0))
            .await
            .expect("vector entry");
        assert!(entry.metadata.mentions.contains(&zillow));
    }

    // A second pass over the same messages changes nothing.
    let second = propagate_channel(&channel, harness.store.as_ref(), harness.vector.as_ref())
        .await
        .expect("second propagation");
    assert_eq!(second, 0);
}
