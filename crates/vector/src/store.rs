use std::collections::BTreeMap;

use async_trait::async_trait;
use salesrag_core::chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use salesrag_core::{ChannelId, EntityKind, EntityMention};
use salesrag_db::DbPool;

use crate::embed::cosine_similarity;

#[derive(Debug, Error)]
pub enum VectorError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

/// Where an indexed document came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Slack,
    Salesforce,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Slack => "slack",
            Self::Salesforce => "salesforce",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "slack" => Some(Self::Slack),
            "salesforce" => Some(Self::Salesforce),
            _ => None,
        }
    }
}

/// Stable document id derived from source and position, so replays of the
/// same item overwrite instead of duplicating.
pub fn doc_id(source: Source, scope: &str, item: &str) -> String {
    blake3::hash(format!("{}:{scope}:{item}", source.as_str()).as_bytes()).to_hex().to_string()
}

/// Typed metadata stored alongside each document.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EntryMetadata {
    pub channel_id: Option<ChannelId>,
    pub channel_name: Option<String>,
    pub author_id: Option<String>,
    /// Source-side timestamp; message ts for Slack, record id for CRM rows.
    pub ts: String,
    pub in_thread: bool,
    pub mentions: Vec<EntityMention>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VectorEntry {
    pub doc_id: String,
    pub source: Source,
    pub metadata: EntryMetadata,
    pub content: String,
    pub embedding: Vec<f32>,
    pub indexed_at: DateTime<Utc>,
}

/// Search constraints. An entity filter that matches nothing yields an empty
/// result set, never an unfiltered one.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SearchFilter {
    pub source: Option<Source>,
    pub channel_id: Option<ChannelId>,
    pub entity_name: Option<String>,
    pub entity_kind: Option<EntityKind>,
}

impl SearchFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source: Source) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_channel(mut self, channel_id: ChannelId) -> Self {
        self.channel_id = Some(channel_id);
        self
    }

    pub fn with_entity(mut self, name: impl Into<String>) -> Self {
        self.entity_name = Some(name.into());
        self
    }

    pub fn with_kind(mut self, kind: EntityKind) -> Self {
        self.entity_kind = Some(kind);
        self
    }

    pub fn has_entity_constraint(&self) -> bool {
        self.entity_name.is_some() || self.entity_kind.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct SearchHit {
    pub doc_id: String,
    pub source: Source,
    pub content: String,
    pub score: f32,
    pub metadata: EntryMetadata,
}

/// The pipeline's document store: embeddings plus filterable metadata.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or fully replace a document.
    async fn upsert(&self, entry: &VectorEntry) -> Result<(), VectorError>;

    /// Replace only the mention metadata of an existing document; content and
    /// embedding stay untouched, so no re-embedding happens.
    async fn update_mentions(
        &self,
        doc_id: &str,
        mentions: &[EntityMention],
    ) -> Result<(), VectorError>;

    /// Rank documents passing the filter by cosine similarity against the
    /// query embedding. Equal scores break toward the more recent document.
    async fn search(
        &self,
        query: &[f32],
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<SearchHit>, VectorError>;

    async fn count(&self, source: Option<Source>) -> Result<u64, VectorError>;
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

fn decode_embedding(blob: &[u8]) -> Result<Vec<f32>, VectorError> {
    if blob.len() % 4 != 0 {
        return Err(VectorError::Decode(format!(
            "embedding blob length {} is not a multiple of 4",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

fn rank_hits(mut hits: Vec<SearchHit>, limit: usize) -> Vec<SearchHit> {
    hits.sort_by(|left, right| {
        right
            .score
            .partial_cmp(&left.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                let ts = |hit: &SearchHit| hit.metadata.ts.parse::<f64>().unwrap_or(0.0);
                ts(right).partial_cmp(&ts(left)).unwrap_or(std::cmp::Ordering::Equal)
            })
    });
    hits.truncate(limit);
    hits
}

/// SQLite-backed vector store. Similarity runs in process over the filtered
/// candidate set; the mention side table keeps entity filters in SQL.
pub struct SqlVectorStore {
    pool: DbPool,
}

impl SqlVectorStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VectorIndex for SqlVectorStore {
    async fn upsert(&self, entry: &VectorEntry) -> Result<(), VectorError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO vector_entries (
                doc_id,
                source,
                channel_id,
                channel_name,
                author_id,
                ts,
                in_thread,
                mentions_json,
                content,
                embedding,
                indexed_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(doc_id) DO UPDATE SET
                source = excluded.source,
                channel_id = excluded.channel_id,
                channel_name = excluded.channel_name,
                author_id = excluded.author_id,
                ts = excluded.ts,
                in_thread = excluded.in_thread,
                mentions_json = excluded.mentions_json,
                content = excluded.content,
                embedding = excluded.embedding,
                indexed_at = excluded.indexed_at",
        )
        .bind(&entry.doc_id)
        .bind(entry.source.as_str())
        .bind(entry.metadata.channel_id.as_ref().map(|id| id.0.as_str()))
        .bind(entry.metadata.channel_name.as_deref())
        .bind(entry.metadata.author_id.as_deref())
        .bind(&entry.metadata.ts)
        .bind(entry.metadata.in_thread)
        .bind(encode_mentions(&entry.metadata.mentions)?)
        .bind(&entry.content)
        .bind(encode_embedding(&entry.embedding))
        .bind(entry.indexed_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        replace_mention_rows(&mut tx, &entry.doc_id, &entry.metadata.mentions).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn update_mentions(
        &self,
        doc_id: &str,
        mentions: &[EntityMention],
    ) -> Result<(), VectorError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query("UPDATE vector_entries SET mentions_json = ? WHERE doc_id = ?")
            .bind(encode_mentions(mentions)?)
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            debug!(event_name = "vector.update_mentions_missing", doc_id, "no such document");
            return Ok(());
        }

        replace_mention_rows(&mut tx, doc_id, mentions).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<SearchHit>, VectorError> {
        let mut sql = String::from(
            "SELECT DISTINCT
                e.doc_id,
                e.source,
                e.channel_id,
                e.channel_name,
                e.author_id,
                e.ts,
                e.in_thread,
                e.mentions_json,
                e.content,
                e.embedding,
                e.indexed_at
             FROM vector_entries e",
        );
        let mut conditions: Vec<&str> = Vec::new();
        let mut binds: Vec<String> = Vec::new();

        if filter.has_entity_constraint() {
            sql.push_str(" JOIN vector_entry_mentions m ON m.doc_id = e.doc_id");
            if let Some(name) = &filter.entity_name {
                conditions.push("LOWER(m.name) = LOWER(?)");
                binds.push(name.clone());
            }
            if let Some(kind) = filter.entity_kind {
                conditions.push("m.kind = ?");
                binds.push(kind.as_str().to_string());
            }
        }
        if let Some(source) = filter.source {
            conditions.push("e.source = ?");
            binds.push(source.as_str().to_string());
        }
        if let Some(channel_id) = &filter.channel_id {
            conditions.push("e.channel_id = ?");
            binds.push(channel_id.0.clone());
        }

        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }

        let mut statement = sqlx::query(&sql);
        for bind in &binds {
            statement = statement.bind(bind);
        }
        let rows = statement.fetch_all(&self.pool).await?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in rows {
            let entry = entry_from_row(row)?;
            let score = cosine_similarity(query, &entry.embedding);
            hits.push(SearchHit {
                doc_id: entry.doc_id,
                source: entry.source,
                content: entry.content,
                score,
                metadata: entry.metadata,
            });
        }

        Ok(rank_hits(hits, limit))
    }

    async fn count(&self, source: Option<Source>) -> Result<u64, VectorError> {
        let count = match source {
            Some(source) => {
                sqlx::query("SELECT COUNT(*) AS count FROM vector_entries WHERE source = ?")
                    .bind(source.as_str())
                    .fetch_one(&self.pool)
                    .await?
                    .get::<i64, _>("count")
            }
            None => sqlx::query("SELECT COUNT(*) AS count FROM vector_entries")
                .fetch_one(&self.pool)
                .await?
                .get::<i64, _>("count"),
        };

        Ok(u64::try_from(count).unwrap_or(0))
    }
}

async fn replace_mention_rows(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    doc_id: &str,
    mentions: &[EntityMention],
) -> Result<(), VectorError> {
    sqlx::query("DELETE FROM vector_entry_mentions WHERE doc_id = ?")
        .bind(doc_id)
        .execute(&mut **tx)
        .await?;

    for mention in mentions {
        sqlx::query(
            "INSERT OR IGNORE INTO vector_entry_mentions (doc_id, kind, name) VALUES (?, ?, ?)",
        )
        .bind(doc_id)
        .bind(mention.kind.as_str())
        .bind(&mention.name)
        .execute(&mut **tx)
        .await?;
    }

    Ok(())
}

fn encode_mentions(mentions: &[EntityMention]) -> Result<String, VectorError> {
    serde_json::to_string(mentions)
        .map_err(|error| VectorError::Decode(format!("encode mentions: {error}")))
}

fn entry_from_row(row: SqliteRow) -> Result<VectorEntry, VectorError> {
    let source_raw = row.try_get::<String, _>("source")?;
    let source = Source::parse(&source_raw)
        .ok_or_else(|| VectorError::Decode(format!("unknown source `{source_raw}`")))?;

    let mentions_raw = row.try_get::<String, _>("mentions_json")?;
    let mentions: Vec<EntityMention> = serde_json::from_str(&mentions_raw)
        .map_err(|error| VectorError::Decode(format!("invalid mention list: {error}")))?;

    let indexed_at_raw = row.try_get::<String, _>("indexed_at")?;
    let indexed_at = DateTime::parse_from_rfc3339(&indexed_at_raw)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|error| {
            VectorError::Decode(format!("invalid indexed_at `{indexed_at_raw}` ({error})"))
        })?;

    Ok(VectorEntry {
        doc_id: row.try_get("doc_id")?,
        source,
        metadata: EntryMetadata {
            channel_id: row.try_get::<Option<String>, _>("channel_id")?.map(ChannelId),
            channel_name: row.try_get("channel_name")?,
            author_id: row.try_get("author_id")?,
            ts: row.try_get("ts")?,
            in_thread: row.try_get("in_thread")?,
            mentions,
        },
        content: row.try_get("content")?,
        embedding: decode_embedding(&row.try_get::<Vec<u8>, _>("embedding")?)?,
        indexed_at,
    })
}

/// In-memory implementation with the same filter and ranking semantics, for
/// tests that do not want a database.
#[derive(Default)]
pub struct InMemoryVectorStore {
    entries: RwLock<BTreeMap<String, VectorEntry>>,
}

impl InMemoryVectorStore {
    pub async fn get(&self, doc_id: &str) -> Option<VectorEntry> {
        self.entries.read().await.get(doc_id).cloned()
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorStore {
    async fn upsert(&self, entry: &VectorEntry) -> Result<(), VectorError> {
        self.entries.write().await.insert(entry.doc_id.clone(), entry.clone());
        Ok(())
    }

    async fn update_mentions(
        &self,
        doc_id: &str,
        mentions: &[EntityMention],
    ) -> Result<(), VectorError> {
        if let Some(entry) = self.entries.write().await.get_mut(doc_id) {
            entry.metadata.mentions = mentions.to_vec();
        }
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<SearchHit>, VectorError> {
        let entries = self.entries.read().await;
        let hits = entries
            .values()
            .filter(|entry| {
                if let Some(source) = filter.source {
                    if entry.source != source {
                        return false;
                    }
                }
                if let Some(channel_id) = &filter.channel_id {
                    if entry.metadata.channel_id.as_ref() != Some(channel_id) {
                        return false;
                    }
                }
                if let Some(name) = &filter.entity_name {
                    if !entry
                        .metadata
                        .mentions
                        .iter()
                        .any(|mention| mention.name.eq_ignore_ascii_case(name))
                    {
                        return false;
                    }
                }
                if let Some(kind) = filter.entity_kind {
                    if !entry.metadata.mentions.iter().any(|mention| mention.kind == kind) {
                        return false;
                    }
                }
                true
            })
            .map(|entry| SearchHit {
                doc_id: entry.doc_id.clone(),
                source: entry.source,
                content: entry.content.clone(),
                score: cosine_similarity(query, &entry.embedding),
                metadata: entry.metadata.clone(),
            })
            .collect();

        Ok(rank_hits(hits, limit))
    }

    async fn count(&self, source: Option<Source>) -> Result<u64, VectorError> {
        let entries = self.entries.read().await;
        Ok(entries
            .values()
            .filter(|entry| source.map(|wanted| entry.source == wanted).unwrap_or(true))
            .count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use salesrag_core::{ChannelId, EntityKind, EntityMention};
    use salesrag_db::{connect_with_settings, migrations, DbPool};

    use super::{
        doc_id, EntryMetadata, SearchFilter, Source, SqlVectorStore, VectorEntry, VectorIndex,
    };

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:?cache=shared", 1, 30)
            .await
            .expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn entry(ts: &str, content: &str, mentions: Vec<EntityMention>) -> VectorEntry {
        VectorEntry {
            doc_id: doc_id(Source::Slack, "C1", ts),
            source: Source::Slack,
            metadata: EntryMetadata {
                channel_id: Some(ChannelId("C1".to_string())),
                channel_name: Some("sales".to_string()),
                author_id: Some("U1".to_string()),
                ts: ts.to_string(),
                in_thread: false,
                mentions,
            },
            content: content.to_string(),
            embedding: vec![1.0, 0.0, 0.0],
            indexed_at: Utc::now(),
        }
    }

    #[test]
    fn doc_ids_are_stable_and_scoped() {
        assert_eq!(
            doc_id(Source::Slack, "C1", "1730000000.1000"),
            doc_id(Source::Slack, "C1", "1730000000.1000")
        );
        assert_ne!(
            doc_id(Source::Slack, "C1", "1730000000.1000"),
            doc_id(Source::Slack, "C2", "1730000000.1000")
        );
        assert_ne!(
            doc_id(Source::Slack, "C1", "001"),
            doc_id(Source::Salesforce, "C1", "001")
        );
    }

    #[tokio::test]
    async fn reindexing_the_same_document_does_not_duplicate() {
        let pool = setup_pool().await;
        let store = SqlVectorStore::new(pool.clone());

        let document = entry(
            "1730000000.1000",
            "Zillow kickoff",
            vec![EntityMention::new(EntityKind::Company, "Zillow")],
        );
        store.upsert(&document).await.expect("first upsert");
        store.upsert(&document).await.expect("second upsert");

        assert_eq!(store.count(Some(Source::Slack)).await.expect("count"), 1);

        pool.close().await;
    }

    #[tokio::test]
    async fn entity_filter_matching_nothing_returns_empty() {
        let pool = setup_pool().await;
        let store = SqlVectorStore::new(pool.clone());

        store
            .upsert(&entry(
                "1730000000.1000",
                "Zillow kickoff",
                vec![EntityMention::new(EntityKind::Company, "Zillow")],
            ))
            .await
            .expect("upsert");

        let filter = SearchFilter::new().with_entity("Acme");
        let hits =
            store.search(&[1.0, 0.0, 0.0], &filter, 10).await.expect("search");
        assert!(hits.is_empty(), "unknown entity filter must not fall back to unfiltered search");

        let matching = SearchFilter::new().with_entity("zillow");
        let hits =
            store.search(&[1.0, 0.0, 0.0], &matching, 10).await.expect("search");
        assert_eq!(hits.len(), 1);

        pool.close().await;
    }

    #[tokio::test]
    async fn equal_scores_break_toward_recency() {
        let pool = setup_pool().await;
        let store = SqlVectorStore::new(pool.clone());

        store.upsert(&entry("1730000000.1000", "older", Vec::new())).await.expect("upsert older");
        store.upsert(&entry("1730000099.1000", "newer", Vec::new())).await.expect("upsert newer");

        let hits = store
            .search(&[1.0, 0.0, 0.0], &SearchFilter::new(), 10)
            .await
            .expect("search");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].content, "newer");
        assert_eq!(hits[1].content, "older");

        pool.close().await;
    }

    #[tokio::test]
    async fn mention_updates_leave_content_and_embedding_untouched() {
        let pool = setup_pool().await;
        let store = SqlVectorStore::new(pool.clone());

        let document = entry("1730000000.1000", "thread reply", Vec::new());
        store.upsert(&document).await.expect("upsert");

        let union = vec![
            EntityMention::new(EntityKind::Company, "Zillow"),
            EntityMention::new(EntityKind::Contact, "Dana Lee"),
        ];
        store.update_mentions(&document.doc_id, &union).await.expect("update mentions");

        let filter = SearchFilter::new().with_entity("Zillow").with_kind(EntityKind::Company);
        let hits = store.search(&[1.0, 0.0, 0.0], &filter, 10).await.expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "thread reply");
        assert_eq!(hits[0].metadata.mentions, union);
        assert!((hits[0].score - 1.0).abs() < 0.001, "embedding must be unchanged");

        pool.close().await;
    }

    #[tokio::test]
    async fn source_and_channel_filters_compose() {
        let pool = setup_pool().await;
        let store = SqlVectorStore::new(pool.clone());

        store.upsert(&entry("1730000000.1000", "slack doc", Vec::new())).await.expect("upsert");

        let mut crm = entry("001ABC", "Zillow account summary", Vec::new());
        crm.doc_id = super::doc_id(Source::Salesforce, "company", "001ABC");
        crm.source = Source::Salesforce;
        crm.metadata.channel_id = None;
        store.upsert(&crm).await.expect("upsert crm");

        let slack_only = SearchFilter::new()
            .with_source(Source::Slack)
            .with_channel(ChannelId("C1".to_string()));
        let hits = store.search(&[1.0, 0.0, 0.0], &slack_only, 10).await.expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source, Source::Slack);

        pool.close().await;
    }
}
