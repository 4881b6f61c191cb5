//! SQLite store implementation
//!
//! One database file backs every store trait:
//!
//! - `resources`: managed resources and their polling state
//! - `work_items`: pending events and snapshots, keyed by id
//! - `checkpoints`: one timestamp per source name
//! - `rollups`: emitted aggregates, unique per (key, granularity, window)
//!
//! Timestamps are stored as Unix milliseconds. The pool runs in WAL mode so
//! the persistence stage can write while sources read.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, instrument};

use super::backend::{
    BatchFilter, CheckpointStore, PollingClaim, ResourceStore, ResourceUpdate, RollupQuery,
    RollupSink, WorkItemStore,
};
use super::error::{StoreError, StoreResult};
use crate::rollup::{Granularity, RollupStats};
use crate::{ManagedResource, MetricKey, RollupRecord, Visibility, WorkItem};

pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (or create) the database and run migrations
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = db_path.as_ref().to_string_lossy().to_string();
        info!("opening SQLite store at: {}", db_path);

        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("database migrations complete");

        Ok(Self { pool })
    }

    /// Register a resource, replacing one with the same id
    pub async fn insert_resource(&self, resource: &ManagedResource) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO resources (
                id, resource_type, last_poll_time, polling_in_progress,
                failed_count, broken, last_error
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                resource_type = excluded.resource_type,
                last_poll_time = excluded.last_poll_time,
                polling_in_progress = excluded.polling_in_progress,
                failed_count = excluded.failed_count,
                broken = excluded.broken,
                last_error = excluded.last_error
            "#,
        )
        .bind(&resource.id)
        .bind(&resource.resource_type)
        .bind(resource.last_poll_time.map(|t| t.timestamp_millis()))
        .bind(resource.polling_in_progress)
        .bind(resource.failed_count as i64)
        .bind(resource.broken)
        .bind(&resource.last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Add (or replace) pending work items
    #[instrument(skip_all, fields(count = items.len()))]
    pub async fn insert_work_items(&self, items: &[WorkItem]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for item in items {
            let payload = serde_json::to_string(&item.payload)?;
            sqlx::query(
                r#"
                INSERT INTO work_items (
                    id, stream, timestamp, account_id, classification, visibility, payload
                )
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (id) DO UPDATE SET
                    stream = excluded.stream,
                    timestamp = excluded.timestamp,
                    account_id = excluded.account_id,
                    classification = excluded.classification,
                    visibility = excluded.visibility,
                    payload = excluded.payload
                "#,
            )
            .bind(&item.id)
            .bind(&item.stream)
            .bind(item.timestamp.timestamp_millis())
            .bind(&item.account_id)
            .bind(&item.classification)
            .bind(item.visibility.as_str())
            .bind(payload)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn close(&self) {
        info!("closing SQLite store");
        self.pool.close().await;
    }
}

fn from_millis(millis: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::SerializationError(format!("timestamp out of range: {millis}")))
}

fn resource_from_row(row: &SqliteRow) -> StoreResult<ManagedResource> {
    let last_poll_time = row
        .try_get::<Option<i64>, _>("last_poll_time")?
        .map(from_millis)
        .transpose()?;

    Ok(ManagedResource {
        id: row.try_get("id")?,
        resource_type: row.try_get("resource_type")?,
        last_poll_time,
        polling_in_progress: row.try_get("polling_in_progress")?,
        failed_count: row.try_get::<i64, _>("failed_count")? as u32,
        broken: row.try_get("broken")?,
        last_error: row.try_get("last_error")?,
    })
}

fn item_from_row(row: &SqliteRow) -> StoreResult<WorkItem> {
    let visibility = match row.try_get::<String, _>("visibility")?.as_str() {
        "private" => Visibility::Private,
        _ => Visibility::Public,
    };
    let payload: String = row.try_get("payload")?;

    Ok(WorkItem {
        id: row.try_get("id")?,
        stream: row.try_get("stream")?,
        timestamp: from_millis(row.try_get("timestamp")?)?,
        account_id: row.try_get("account_id")?,
        classification: row.try_get("classification")?,
        visibility,
        payload: serde_json::from_str(&payload)?,
    })
}

fn rollup_from_row(row: &SqliteRow) -> StoreResult<RollupRecord> {
    let granularity: String = row.try_get("granularity")?;
    let granularity = granularity
        .parse::<Granularity>()
        .map_err(StoreError::SerializationError)?;

    Ok(RollupRecord {
        key: MetricKey::new(
            row.try_get::<String, _>("account_id")?,
            row.try_get::<String, _>("metric")?,
        ),
        granularity,
        window_start: from_millis(row.try_get("window_start")?)?,
        stats: RollupStats {
            count: row.try_get::<i64, _>("count")? as u64,
            sum: row.try_get("sum")?,
            min: row.try_get("min")?,
            max: row.try_get("max")?,
            m2: row.try_get("m2")?,
        },
    })
}

#[async_trait]
impl ResourceStore for SqliteStore {
    #[instrument(skip(self))]
    async fn list_resources(&self) -> StoreResult<Vec<ManagedResource>> {
        let rows = sqlx::query("SELECT * FROM resources ORDER BY rowid")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(resource_from_row).collect()
    }

    async fn get_resource(&self, id: &str) -> StoreResult<Option<ManagedResource>> {
        let row = sqlx::query("SELECT * FROM resources WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(resource_from_row).transpose()
    }

    #[instrument(skip(self, update))]
    async fn update_resource(
        &self,
        id: &str,
        update: &ResourceUpdate,
    ) -> StoreResult<ManagedResource> {
        // single statement, so the partial update is atomic
        let row = sqlx::query(
            r#"
            UPDATE resources SET
                polling_in_progress = COALESCE(?, polling_in_progress),
                last_poll_time = COALESCE(?, last_poll_time),
                failed_count = CASE WHEN ? THEN failed_count + 1
                                    ELSE COALESCE(?, failed_count) END,
                broken = COALESCE(?, broken),
                last_error = CASE WHEN ? THEN ? ELSE last_error END
            WHERE id = ?
            RETURNING *
            "#,
        )
        .bind(update.polling_in_progress)
        .bind(update.last_poll_time.map(|t| t.timestamp_millis()))
        .bind(update.increment_failed)
        .bind(update.failed_count.map(|c| c as i64))
        .bind(update.broken)
        .bind(update.last_error.is_some())
        .bind(update.last_error.clone().flatten())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => resource_from_row(&row),
            None => Err(StoreError::NotFound(format!("resource {id}"))),
        }
    }

    #[instrument(skip(self, claim))]
    async fn claim_resource(
        &self,
        id: &str,
        claim: &PollingClaim,
    ) -> StoreResult<Option<ManagedResource>> {
        let row = sqlx::query(
            r#"
            UPDATE resources SET
                polling_in_progress = 1,
                last_poll_time = ?
            WHERE id = ?
              AND polling_in_progress = ?
              AND last_poll_time IS ?
            RETURNING *
            "#,
        )
        .bind(claim.now.timestamp_millis())
        .bind(id)
        .bind(claim.observed_in_progress)
        .bind(claim.observed_last_poll.map(|t| t.timestamp_millis()))
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return resource_from_row(&row).map(Some);
        }
        match self.get_resource(id).await? {
            Some(_) => {
                debug!("claim on {id} lost");
                Ok(None)
            }
            None => Err(StoreError::NotFound(format!("resource {id}"))),
        }
    }
}

#[async_trait]
impl WorkItemStore for SqliteStore {
    #[instrument(skip(self), fields(stream = %filter.stream))]
    async fn fetch_batch(&self, filter: &BatchFilter) -> StoreResult<Vec<WorkItem>> {
        let after = filter.after.map(|t| t.timestamp_millis());
        let until = filter.until.map(|t| t.timestamp_millis());
        // LIMIT -1 means no limit in SQLite
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);

        // `id > NULL` is never true, so without a cursor id the bound stays exclusive
        let rows = sqlx::query(
            r#"
            SELECT * FROM work_items
            WHERE stream = ?
              AND (? IS NULL OR timestamp > ? OR (timestamp = ? AND id > ?))
              AND (? IS NULL OR timestamp <= ?)
            ORDER BY timestamp ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(&filter.stream)
        .bind(after)
        .bind(after)
        .bind(after)
        .bind(filter.after_id.as_deref())
        .bind(until)
        .bind(until)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        debug!("fetched {} work items", rows.len());
        rows.iter().map(item_from_row).collect()
    }

    async fn fetch_by_id(&self, id: &str) -> StoreResult<Option<WorkItem>> {
        let row = sqlx::query("SELECT * FROM work_items WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(item_from_row).transpose()
    }
}

#[async_trait]
impl CheckpointStore for SqliteStore {
    async fn read_checkpoint(&self, source: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT at FROM checkpoints WHERE source = ?")
            .bind(source)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|(millis,)| from_millis(millis)).transpose()
    }

    #[instrument(skip(self))]
    async fn write_checkpoint(&self, source: &str, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO checkpoints (source, at) VALUES (?, ?)
            ON CONFLICT (source) DO UPDATE SET at = MAX(at, excluded.at)
            "#,
        )
        .bind(source)
        .bind(at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

const UPSERT_ROLLUP: &str = r#"
    INSERT INTO rollups (
        account_id, metric, granularity, window_start, count, sum, min, max, m2
    )
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT (account_id, metric, granularity, window_start) DO UPDATE SET
        count = excluded.count,
        sum = excluded.sum,
        min = excluded.min,
        max = excluded.max,
        m2 = excluded.m2
"#;

#[async_trait]
impl RollupSink for SqliteStore {
    async fn save(&self, record: &RollupRecord) -> StoreResult<()> {
        self.save_batch(vec![record.clone()]).await
    }

    #[instrument(skip(self, records), fields(count = records.len()))]
    async fn save_batch(&self, records: Vec<RollupRecord>) -> StoreResult<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for record in &records {
            sqlx::query(UPSERT_ROLLUP)
                .bind(&record.key.account_id)
                .bind(&record.key.metric)
                .bind(record.granularity.as_str())
                .bind(record.window_start.timestamp_millis())
                .bind(record.stats.count as i64)
                .bind(record.stats.sum)
                .bind(record.stats.min)
                .bind(record.stats.max)
                .bind(record.stats.m2)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        debug!("saved {} rollups", records.len());
        Ok(())
    }

    #[instrument(skip(self), fields(key = %query.key, granularity = %query.granularity))]
    async fn query_range(&self, query: &RollupQuery) -> StoreResult<Vec<RollupRecord>> {
        let limit = query.limit.map(|l| l as i64).unwrap_or(-1);

        let rows = sqlx::query(
            r#"
            SELECT * FROM rollups
            WHERE account_id = ? AND metric = ? AND granularity = ?
              AND window_start >= ? AND window_start <= ?
            ORDER BY window_start ASC
            LIMIT ?
            "#,
        )
        .bind(&query.key.account_id)
        .bind(&query.key.metric)
        .bind(query.granularity.as_str())
        .bind(query.start.timestamp_millis())
        .bind(query.end.timestamp_millis())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(rollup_from_row).collect()
    }
}
