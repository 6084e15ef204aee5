//! SQLite event store for ChainSync.
//!
//! All aggregates share one `events` table keyed by `(aggregate_id, version)`;
//! snapshots live in a `snapshots` table with the same key. Every write runs
//! in a single transaction, so a failed version check or insert leaves the
//! database exactly as it was.
//!
//! # Usage
//! ```rust,no_run
//! use chainsync_storage::sqlite::SqliteEventStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteEventStore::open("./chainsync.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteEventStore::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction};
use tracing::debug;

use chainsync_core::error::SyncError;
use chainsync_core::store::{
    AggregateCommit, AggregateInfo, EventQuery, EventStore, Snapshot, StoredEvent,
};

fn storage_err(e: sqlx::Error) -> SyncError {
    SyncError::Storage(e.to_string())
}

/// SQLite-backed [`EventStore`].
#[derive(Clone)]
pub struct SqliteEventStore {
    pool: SqlitePool,
}

impl SqliteEventStore {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./chainsync.db"`) or a full
    /// SQLite URL (`"sqlite:./chainsync.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, SyncError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(storage_err)?;
        let store = Self { pool };
        store.init_schema().await?;
        debug!(path, "sqlite event store opened");
        Ok(store)
    }

    /// Open an in-memory database. All data is lost when the store is dropped.
    pub async fn in_memory() -> Result<Self, SyncError> {
        // Every connection to `:memory:` is a separate database, so the one
        // connection must never be recycled.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), SyncError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS events (
                aggregate_id TEXT    NOT NULL,
                version      INTEGER NOT NULL,
                block_height INTEGER,
                event_type   TEXT    NOT NULL,
                request_id   TEXT    NOT NULL,
                payload      TEXT    NOT NULL,
                created_at   INTEGER NOT NULL,
                PRIMARY KEY (aggregate_id, version)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_events_height ON events (aggregate_id, block_height);",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS snapshots (
                aggregate_id TEXT    NOT NULL,
                version      INTEGER NOT NULL,
                block_height INTEGER,
                state        TEXT    NOT NULL,
                created_at   INTEGER NOT NULL,
                PRIMARY KEY (aggregate_id, version)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    /// Total number of stored events across all aggregates.
    pub async fn event_count(&self) -> Result<u64, SyncError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM events")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        let cnt: i64 = row.get("cnt");
        Ok(cnt as u64)
    }

    /// Total number of stored snapshots across all aggregates.
    pub async fn snapshot_count(&self) -> Result<u64, SyncError> {
        let cnt: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM snapshots")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(cnt as u64)
    }

    /// Check and insert `commits` inside `tx`.
    async fn insert_commits(
        tx: &mut Transaction<'_, Sqlite>,
        commits: Vec<AggregateCommit>,
    ) -> Result<(), SyncError> {
        let now = chrono::Utc::now().timestamp();
        for commit in commits {
            let current: i64 = sqlx::query_scalar(
                "SELECT COALESCE(MAX(version), 0) FROM events WHERE aggregate_id = ?",
            )
            .bind(&commit.aggregate_id)
            .fetch_one(&mut **tx)
            .await
            .map_err(storage_err)?;

            if current as u64 != commit.expected_version {
                return Err(SyncError::Storage(format!(
                    "version conflict on '{}': expected {}, found {}",
                    commit.aggregate_id, commit.expected_version, current
                )));
            }

            for (i, event) in commit.events.into_iter().enumerate() {
                let payload = serde_json::to_string(&event.payload)?;
                sqlx::query(
                    "INSERT INTO events
                        (aggregate_id, version, block_height, event_type, request_id, payload, created_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&commit.aggregate_id)
                .bind((commit.expected_version + i as u64 + 1) as i64)
                .bind(event.block_height.map(|h| h as i64))
                .bind(&event.event_type)
                .bind(&event.request_id)
                .bind(&payload)
                .bind(now)
                .execute(&mut **tx)
                .await
                .map_err(storage_err)?;
            }
        }
        Ok(())
    }
}

fn row_to_event(row: &SqliteRow) -> Result<StoredEvent, SyncError> {
    let payload: String = row.try_get("payload").map_err(storage_err)?;
    Ok(StoredEvent {
        aggregate_id: row.try_get("aggregate_id").map_err(storage_err)?,
        version: row.try_get::<i64, _>("version").map_err(storage_err)? as u64,
        block_height: row
            .try_get::<Option<i64>, _>("block_height")
            .map_err(storage_err)?
            .map(|h| h as u64),
        event_type: row.try_get("event_type").map_err(storage_err)?,
        request_id: row.try_get("request_id").map_err(storage_err)?,
        payload: serde_json::from_str(&payload)?,
        timestamp: row.try_get("created_at").map_err(storage_err)?,
    })
}

const EVENT_COLUMNS: &str =
    "aggregate_id, version, block_height, event_type, request_id, payload, created_at";

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn load_events(&self, aggregate_id: &str) -> Result<Vec<StoredEvent>, SyncError> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE aggregate_id = ? ORDER BY version"
        ))
        .bind(aggregate_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter().map(row_to_event).collect()
    }

    async fn append(&self, commits: Vec<AggregateCommit>) -> Result<(), SyncError> {
        let aggregates = commits.len();
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        Self::insert_commits(&mut tx, commits).await?;
        tx.commit().await.map_err(storage_err)?;
        debug!(aggregates, "events appended");
        Ok(())
    }

    async fn rollback(
        &self,
        truncate: &[String],
        height: Option<u64>,
        commits: Vec<AggregateCommit>,
    ) -> Result<(), SyncError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let mut removed = 0u64;
        for id in truncate {
            for table in ["events", "snapshots"] {
                let result = match height {
                    None => sqlx::query(&format!("DELETE FROM {table} WHERE aggregate_id = ?"))
                        .bind(id)
                        .execute(&mut *tx)
                        .await,
                    Some(h) => sqlx::query(&format!(
                        "DELETE FROM {table}
                         WHERE aggregate_id = ? AND block_height IS NOT NULL AND block_height > ?"
                    ))
                    .bind(id)
                    .bind(h as i64)
                    .execute(&mut *tx)
                    .await,
                };
                let affected = result.map_err(storage_err)?.rows_affected();
                if table == "events" {
                    removed += affected;
                }
            }
        }
        Self::insert_commits(&mut tx, commits).await?;
        tx.commit().await.map_err(storage_err)?;
        debug!(aggregates = truncate.len(), height = ?height, removed, "events rolled back");
        Ok(())
    }

    async fn fetch_events(&self, query: &EventQuery) -> Result<Vec<StoredEvent>, SyncError> {
        let mut qb: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new(format!("SELECT {EVENT_COLUMNS} FROM events WHERE 1 = 1"));

        if !query.aggregate_ids.is_empty() {
            qb.push(" AND aggregate_id IN (");
            let mut ids = qb.separated(", ");
            for id in &query.aggregate_ids {
                ids.push_bind(id.clone());
            }
            ids.push_unseparated(")");
        }
        if let Some(max) = query.max_height {
            qb.push(" AND (block_height IS NULL OR block_height <= ")
                .push_bind(max as i64)
                .push(")");
        }
        if let Some(min) = query.min_version {
            qb.push(" AND version >= ").push_bind(min as i64);
        }
        qb.push(" ORDER BY aggregate_id, version LIMIT ")
            .push_bind(query.limit.map_or(-1, |l| l as i64))
            .push(" OFFSET ")
            .push_bind(query.offset as i64);

        let rows = qb.build().fetch_all(&self.pool).await.map_err(storage_err)?;
        rows.iter().map(row_to_event).collect()
    }

    async fn aggregates(&self) -> Result<Vec<AggregateInfo>, SyncError> {
        let rows = sqlx::query(
            "SELECT e.aggregate_id, e.version, e.block_height
             FROM events e
             JOIN (SELECT aggregate_id, MAX(version) AS version FROM events GROUP BY aggregate_id) latest
               ON e.aggregate_id = latest.aggregate_id AND e.version = latest.version
             ORDER BY e.aggregate_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter()
            .map(|row| {
                Ok(AggregateInfo {
                    aggregate_id: row.try_get("aggregate_id").map_err(storage_err)?,
                    version: row.try_get::<i64, _>("version").map_err(storage_err)? as u64,
                    block_height: row
                        .try_get::<Option<i64>, _>("block_height")
                        .map_err(storage_err)?
                        .map(|h| h as u64),
                })
            })
            .collect()
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), SyncError> {
        let state = serde_json::to_string(&snapshot.state)?;
        sqlx::query(
            "INSERT OR REPLACE INTO snapshots
                (aggregate_id, version, block_height, state, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&snapshot.aggregate_id)
        .bind(snapshot.version as i64)
        .bind(snapshot.block_height.map(|h| h as i64))
        .bind(&state)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        debug!(aggregate_id = %snapshot.aggregate_id, version = snapshot.version, "snapshot saved");
        Ok(())
    }

    async fn load_snapshot(
        &self,
        aggregate_id: &str,
        max_height: Option<u64>,
    ) -> Result<Option<Snapshot>, SyncError> {
        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
            "SELECT aggregate_id, version, block_height, state FROM snapshots WHERE aggregate_id = ",
        );
        qb.push_bind(aggregate_id.to_string());
        if let Some(max) = max_height {
            qb.push(" AND (block_height IS NULL OR block_height <= ")
                .push_bind(max as i64)
                .push(")");
        }
        qb.push(" ORDER BY version DESC LIMIT 1");

        let Some(row) = qb
            .build()
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?
        else {
            return Ok(None);
        };
        let state: String = row.try_get("state").map_err(storage_err)?;
        Ok(Some(Snapshot {
            aggregate_id: row.try_get("aggregate_id").map_err(storage_err)?,
            version: row.try_get::<i64, _>("version").map_err(storage_err)? as u64,
            block_height: row
                .try_get::<Option<i64>, _>("block_height")
                .map_err(storage_err)?
                .map(|h| h as u64),
            state: serde_json::from_str(&state)?,
        }))
    }
}
