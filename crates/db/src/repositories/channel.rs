use salesrag_core::chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use salesrag_core::{
    BatchProgress, ChannelId, ChannelRecord, DiscoveredChannel, IndexState, SkipReason,
    StatusSummary,
};

use super::{ChannelRepository, RepositoryError};
use crate::DbPool;

pub struct SqlChannelRepository {
    pool: DbPool,
}

impl SqlChannelRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const CHANNEL_COLUMNS: &str = "id,
    name,
    is_archived,
    is_private,
    status,
    skip_reason,
    cursor,
    oldest_indexed_ts,
    last_indexed_at,
    discovered_at";

#[async_trait::async_trait]
impl ChannelRepository for SqlChannelRepository {
    async fn merge_discovered(
        &self,
        channels: &[DiscoveredChannel],
    ) -> Result<u64, RepositoryError> {
        let mut new_count = 0_u64;
        let mut tx = self.pool.begin().await?;

        for channel in channels {
            let known = sqlx::query("SELECT COUNT(*) AS count FROM channels WHERE id = ?")
                .bind(&channel.id.0)
                .fetch_one(&mut *tx)
                .await?
                .get::<i64, _>("count");

            // Known channels keep their status and progress; discovery only
            // refreshes platform metadata.
            sqlx::query(
                "INSERT INTO channels (id, name, is_archived, is_private, status, discovered_at)
                 VALUES (?, ?, ?, ?, 'not_started', ?)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    is_archived = excluded.is_archived,
                    is_private = excluded.is_private",
            )
            .bind(&channel.id.0)
            .bind(&channel.name)
            .bind(channel.is_archived)
            .bind(channel.is_private)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;

            if known == 0 {
                new_count += 1;
            }
        }

        tx.commit().await?;
        Ok(new_count)
    }

    async fn next_batch(&self, limit: u32) -> Result<Vec<ChannelRecord>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {CHANNEL_COLUMNS}
             FROM channels
             WHERE status IN ('not_started', 'partial')
             ORDER BY
                CASE status WHEN 'not_started' THEN 0 ELSE 1 END,
                last_indexed_at ASC,
                id ASC
             LIMIT ?",
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(channel_from_row).collect()
    }

    async fn claim(&self, id: &ChannelId) -> Result<bool, RepositoryError> {
        // Compare-and-set on status so two concurrent runs cannot both claim
        // the same channel.
        let result = sqlx::query(
            "UPDATE channels
             SET status = 'in_progress'
             WHERE id = ? AND status IN ('not_started', 'partial')",
        )
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn finish_batch(
        &self,
        id: &ChannelId,
        progress: &BatchProgress,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE channels
             SET status = ?,
                 cursor = ?,
                 oldest_indexed_ts = ?,
                 last_indexed_at = ?
             WHERE id = ?",
        )
        .bind(progress.state.as_str())
        .bind(progress.cursor.as_deref())
        .bind(progress.oldest_indexed_ts.as_deref())
        .bind(progress.finished_at.to_rfc3339())
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_skipped(
        &self,
        id: &ChannelId,
        reason: SkipReason,
    ) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE channels SET status = 'skipped', skip_reason = ? WHERE id = ?")
            .bind(reason.as_str())
            .bind(&id.0)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn reset_skipped(&self) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            "UPDATE channels
             SET status = 'not_started', skip_reason = NULL
             WHERE status = 'skipped'",
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn release_stale_claims(&self) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            "UPDATE channels
             SET status = CASE
                WHEN oldest_indexed_ts IS NULL THEN 'not_started'
                ELSE 'partial'
             END
             WHERE status = 'in_progress'",
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn get(&self, id: &ChannelId) -> Result<Option<ChannelRecord>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {CHANNEL_COLUMNS} FROM channels WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(channel_from_row).transpose()
    }

    async fn list_all(&self) -> Result<Vec<ChannelRecord>, RepositoryError> {
        let rows =
            sqlx::query(&format!("SELECT {CHANNEL_COLUMNS} FROM channels ORDER BY name ASC"))
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(channel_from_row).collect()
    }

    async fn status_summary(&self) -> Result<StatusSummary, RepositoryError> {
        let rows =
            sqlx::query("SELECT status, COUNT(*) AS count FROM channels GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut summary = StatusSummary::default();
        for row in rows {
            let status = row.try_get::<String, _>("status")?;
            let count = u64::try_from(row.try_get::<i64, _>("count")?).unwrap_or(0);
            match IndexState::parse(&status) {
                Some(IndexState::NotStarted) => summary.not_started = count,
                Some(IndexState::InProgress) => summary.in_progress = count,
                Some(IndexState::Partial) => summary.partial = count,
                Some(IndexState::Complete) => summary.complete = count,
                Some(IndexState::Skipped) => summary.skipped = count,
                None => {
                    return Err(RepositoryError::Decode(format!(
                        "unknown channel status `{status}`"
                    )))
                }
            }
        }

        Ok(summary)
    }
}

fn channel_from_row(row: SqliteRow) -> Result<ChannelRecord, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let state = IndexState::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown channel status `{status_raw}`")))?;

    let skip_reason = row
        .try_get::<Option<String>, _>("skip_reason")?
        .map(|value| {
            SkipReason::parse(&value)
                .ok_or_else(|| RepositoryError::Decode(format!("unknown skip reason `{value}`")))
        })
        .transpose()?;

    Ok(ChannelRecord {
        id: ChannelId(row.try_get("id")?),
        name: row.try_get("name")?,
        is_archived: row.try_get("is_archived")?,
        is_private: row.try_get("is_private")?,
        state,
        skip_reason,
        cursor: row.try_get("cursor")?,
        oldest_indexed_ts: row.try_get("oldest_indexed_ts")?,
        last_indexed_at: parse_optional_timestamp("last_indexed_at", row.try_get("last_indexed_at")?)?,
        discovered_at: parse_timestamp("discovered_at", row.try_get("discovered_at")?)?,
    })
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}
