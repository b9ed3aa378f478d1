use sqlx::{sqlite::SqliteRow, Row, Sqlite, Transaction};

use salesrag_core::{ChannelId, EntityMention, MessageId, MessageRecord};

use super::channel::parse_timestamp;
use super::{MessageRepository, RepositoryError};
use crate::DbPool;

pub struct SqlMessageRepository {
    pool: DbPool,
}

impl SqlMessageRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const MESSAGE_COLUMNS: &str = "channel_id,
    message_id,
    thread_ts,
    author_id,
    text,
    posted_at,
    mentions_json,
    thread_mentions_json,
    indexed_at";

#[async_trait::async_trait]
impl MessageRepository for SqlMessageRepository {
    async fn upsert(&self, message: &MessageRecord) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        upsert_in_tx(&mut tx, message).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn commit_page(
        &self,
        channel_id: &ChannelId,
        messages: &[MessageRecord],
        cursor: Option<&str>,
        oldest_indexed_ts: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        for message in messages {
            upsert_in_tx(&mut tx, message).await?;
        }

        sqlx::query("UPDATE channels SET cursor = ?, oldest_indexed_ts = ? WHERE id = ?")
            .bind(cursor)
            .bind(oldest_indexed_ts)
            .bind(&channel_id.0)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_for_channel(
        &self,
        channel_id: &ChannelId,
    ) -> Result<Vec<MessageRecord>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE channel_id = ?
             ORDER BY message_id ASC",
        ))
        .bind(&channel_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(message_from_row).collect()
    }

    async fn list_threaded(
        &self,
        channel_id: &ChannelId,
    ) -> Result<Vec<MessageRecord>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE channel_id = ? AND thread_ts IS NOT NULL
             ORDER BY thread_ts ASC, message_id ASC",
        ))
        .bind(&channel_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(message_from_row).collect()
    }

    async fn set_thread_mentions(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        thread_mentions: &[EntityMention],
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE messages
             SET thread_mentions_json = ?
             WHERE channel_id = ? AND message_id = ?",
        )
        .bind(encode_mentions(thread_mentions)?)
        .bind(&channel_id.0)
        .bind(&message_id.0)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn count_for_channel(&self, channel_id: &ChannelId) -> Result<u64, RepositoryError> {
        let count = sqlx::query("SELECT COUNT(*) AS count FROM messages WHERE channel_id = ?")
            .bind(&channel_id.0)
            .fetch_one(&self.pool)
            .await?
            .get::<i64, _>("count");

        Ok(u64::try_from(count).unwrap_or(0))
    }
}

async fn upsert_in_tx(
    tx: &mut Transaction<'_, Sqlite>,
    message: &MessageRecord,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT INTO messages (
            channel_id,
            message_id,
            thread_ts,
            author_id,
            text,
            posted_at,
            mentions_json,
            thread_mentions_json,
            indexed_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(channel_id, message_id) DO UPDATE SET
            thread_ts = excluded.thread_ts,
            author_id = excluded.author_id,
            text = excluded.text,
            posted_at = excluded.posted_at,
            mentions_json = excluded.mentions_json,
            thread_mentions_json = excluded.thread_mentions_json,
            indexed_at = excluded.indexed_at",
    )
    .bind(&message.channel_id.0)
    .bind(&message.id.0)
    .bind(message.thread_ts.as_deref())
    .bind(&message.author_id)
    .bind(&message.text)
    .bind(message.posted_at.to_rfc3339())
    .bind(encode_mentions(&message.mentions)?)
    .bind(encode_mentions(&message.thread_mentions)?)
    .bind(message.indexed_at.to_rfc3339())
    .execute(&mut **tx)
    .await?;

    Ok(())
}

fn encode_mentions(mentions: &[EntityMention]) -> Result<String, RepositoryError> {
    serde_json::to_string(mentions)
        .map_err(|error| RepositoryError::Decode(format!("encode mentions: {error}")))
}

fn decode_mentions(column: &str, raw: &str) -> Result<Vec<EntityMention>, RepositoryError> {
    serde_json::from_str(raw).map_err(|error| {
        RepositoryError::Decode(format!("invalid mention list in `{column}`: {error}"))
    })
}

fn message_from_row(row: SqliteRow) -> Result<MessageRecord, RepositoryError> {
    let mentions_raw = row.try_get::<String, _>("mentions_json")?;
    let thread_mentions_raw = row.try_get::<String, _>("thread_mentions_json")?;

    Ok(MessageRecord {
        channel_id: ChannelId(row.try_get("channel_id")?),
        id: MessageId(row.try_get("message_id")?),
        thread_ts: row.try_get("thread_ts")?,
        author_id: row.try_get("author_id")?,
        text: row.try_get("text")?,
        posted_at: parse_timestamp("posted_at", row.try_get("posted_at")?)?,
        mentions: decode_mentions("mentions_json", &mentions_raw)?,
        thread_mentions: decode_mentions("thread_mentions_json", &thread_mentions_raw)?,
        indexed_at: parse_timestamp("indexed_at", row.try_get("indexed_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use salesrag_core::{
        ChannelId, DiscoveredChannel, EntityKind, EntityMention, MessageId, MessageRecord,
    };

    use super::SqlMessageRepository;
    use crate::migrations;
    use crate::repositories::{
        ChannelRepository, MessageRepository, SqlChannelRepository,
    };
    use crate::{connect_with_settings, DbPool};

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:?cache=shared", 1, 30)
            .await
            .expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    async fn seed_channel(pool: &DbPool, id: &str) {
        let repo = SqlChannelRepository::new(pool.clone());
        repo.merge_discovered(&[DiscoveredChannel {
            id: ChannelId(id.to_string()),
            name: "sales".to_string(),
            is_archived: false,
            is_private: false,
        }])
        .await
        .expect("seed channel");
    }

    fn message(channel: &str, ts: &str, text: &str) -> MessageRecord {
        MessageRecord {
            channel_id: ChannelId(channel.to_string()),
            id: MessageId(ts.to_string()),
            thread_ts: None,
            author_id: "U1".to_string(),
            text: text.to_string(),
            posted_at: Utc::now(),
            mentions: vec![EntityMention::new(EntityKind::Company, "Zillow")],
            thread_mentions: vec![EntityMention::new(EntityKind::Company, "Zillow")],
            indexed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_round_trips_and_replays_cleanly() {
        let pool = setup_pool().await;
        seed_channel(&pool, "C1").await;
        let repo = SqlMessageRepository::new(pool.clone());

        let record = message("C1", "1730000000.1000", "Zillow kickoff");
        repo.upsert(&record).await.expect("first upsert");
        // Replaying the same page must converge, not duplicate.
        repo.upsert(&record).await.expect("second upsert");

        let channel = ChannelId("C1".to_string());
        let found = repo.list_for_channel(&channel).await.expect("list");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].text, "Zillow kickoff");
        assert_eq!(
            found[0].mentions,
            vec![EntityMention::new(EntityKind::Company, "Zillow")]
        );
        assert_eq!(repo.count_for_channel(&channel).await.expect("count"), 1);

        pool.close().await;
    }

    #[tokio::test]
    async fn commit_page_writes_messages_and_cursor_atomically() {
        let pool = setup_pool().await;
        seed_channel(&pool, "C1").await;
        let channel = ChannelId("C1".to_string());

        let messages = SqlMessageRepository::new(pool.clone());
        let channels = SqlChannelRepository::new(pool.clone());

        let page = vec![
            message("C1", "1730000000.2000", "renewal call"),
            message("C1", "1730000000.1000", "kickoff"),
        ];
        messages
            .commit_page(&channel, &page, Some("cursor-next"), Some("1730000000.1000"))
            .await
            .expect("commit page");

        let record = channels.get(&channel).await.expect("get").expect("channel exists");
        assert_eq!(record.cursor.as_deref(), Some("cursor-next"));
        assert_eq!(record.oldest_indexed_ts.as_deref(), Some("1730000000.1000"));
        assert_eq!(messages.count_for_channel(&channel).await.expect("count"), 2);

        pool.close().await;
    }

    #[tokio::test]
    async fn threaded_listing_excludes_standalone_messages() {
        let pool = setup_pool().await;
        seed_channel(&pool, "C1").await;
        let repo = SqlMessageRepository::new(pool.clone());
        let channel = ChannelId("C1".to_string());

        let mut threaded = message("C1", "1730000000.2000", "thread reply");
        threaded.thread_ts = Some("1730000000.1000".to_string());
        let standalone = message("C1", "1730000000.3000", "standalone");

        repo.upsert(&threaded).await.expect("upsert threaded");
        repo.upsert(&standalone).await.expect("upsert standalone");

        let found = repo.list_threaded(&channel).await.expect("list threaded");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id.0, "1730000000.2000");

        pool.close().await;
    }

    #[tokio::test]
    async fn thread_mentions_update_leaves_text_untouched() {
        let pool = setup_pool().await;
        seed_channel(&pool, "C1").await;
        let repo = SqlMessageRepository::new(pool.clone());
        let channel = ChannelId("C1".to_string());

        let record = message("C1", "1730000000.1000", "kickoff");
        repo.upsert(&record).await.expect("upsert");

        let union = vec![
            EntityMention::new(EntityKind::Company, "Zillow"),
            EntityMention::new(EntityKind::Contact, "Dana Lee"),
        ];
        repo.set_thread_mentions(&channel, &record.id, &union)
            .await
            .expect("update thread mentions");

        let found = repo.list_for_channel(&channel).await.expect("list");
        assert_eq!(found[0].text, "kickoff");
        assert_eq!(found[0].thread_mentions, union);
        assert_eq!(
            found[0].mentions,
            vec![EntityMention::new(EntityKind::Company, "Zillow")]
        );

        pool.close().await;
    }
}
