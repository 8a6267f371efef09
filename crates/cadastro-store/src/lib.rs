//! # Cadastro Store
//!
//! Persistence for the registry-resolution pipeline, backed by DuckDB.
//!
//! Two tables carry all state:
//!
//! | Table | Description |
//! |-------|-------------|
//! | `work_items` | One row per unit of work; several historical rows per key may exist and the most recently updated one is authoritative |
//! | `result_records` | One resolved record per key (unique), upserted on every successful resolution |
//!
//! The [`RecordStore`] trait is the contract the queue engine consumes. [`DuckDbStore`] is
//! the implementation: a pooled set of connections plus a write gate that serializes every
//! mutating transaction, which is what makes `claim` an atomic select-for-update.
//!
//! ```rust,no_run
//! use cadastro_store::{DuckDbStore, RecordStore, StoreConfig, WorkStatus};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = DuckDbStore::open(StoreConfig::default())?;
//!     let queued = store.count_by_status(WorkStatus::Queued)?;
//!     println!("{queued} items waiting");
//!     Ok(())
//! }
//! ```

pub mod duckdb;
pub mod migrations;
pub mod model;

use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use ::duckdb::{Connection, ToSql};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info};

pub use duckdb::{DatabaseLocation, DuckDbConnectionManager, PooledConnection};
pub use model::{
    EnqueueOutcome, ExtractedFields, NewResult, Outcome, ResultRecord, StatusCounts, StuckReport,
    UnknownStatus, WorkItem, WorkStatus,
};

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `DuckDB` database error.
    #[error(transparent)]
    DuckDb(#[from] ::duckdb::Error),

    /// I/O error while preparing the database directory.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A result for this key was written concurrently.
    #[error("result for `{key}` already exists")]
    Conflict { key: String },

    /// A stored value could not be decoded.
    #[error("invalid stored data: {0}")]
    InvalidData(String),

    /// The write gate was poisoned by a panicking writer.
    #[error("store write gate poisoned")]
    Poisoned,
}

impl From<UnknownStatus> for StoreError {
    fn from(value: UnknownStatus) -> Self {
        Self::InvalidData(value.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::InvalidData(value.to_string())
    }
}

/// Configuration for the store database.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory for cadastro data.
    pub cadastro_home: PathBuf,
    pub location: DatabaseLocation,
    /// Maximum number of idle connections kept in the pool.
    pub max_pool_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let cadastro_home = resolve_cadastro_home();
        let location = match env::var_os("CADASTRO_DB_PATH") {
            Some(path) if !path.is_empty() => DatabaseLocation::File(PathBuf::from(path)),
            _ => DatabaseLocation::File(cadastro_home.join("cadastro.duckdb")),
        };
        Self {
            cadastro_home,
            location,
            max_pool_size: 4,
        }
    }
}

impl StoreConfig {
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self {
            location: DatabaseLocation::File(path.into()),
            ..Self::default()
        }
    }

    pub fn in_memory() -> Self {
        Self {
            location: DatabaseLocation::InMemory,
            ..Self::default()
        }
    }
}

/// Status-transition and lookup operations the queue engine relies on.
///
/// Implementations must make every method atomic with respect to the others; in particular
/// `claim` must never hand the same row to two callers.
pub trait RecordStore: Send + Sync {
    /// Create or reuse a Queued row for `key` unless it is active or was completed at or
    /// after `completed_after`.
    fn enqueue(&self, key: &str, completed_after: OffsetDateTime)
        -> Result<EnqueueOutcome, StoreError>;

    /// Move the latest Queued row for `key` to Processing.
    fn claim(&self, key: &str) -> Result<Option<WorkItem>, StoreError>;

    /// Remember the error of a failed attempt on a Processing row.
    fn record_attempt_error(
        &self,
        id: i64,
        message: &str,
        rate_limited: bool,
    ) -> Result<(), StoreError>;

    /// Write a terminal outcome. Returns false if the row is no longer Processing.
    fn finish(&self, id: i64, outcome: &Outcome) -> Result<bool, StoreError>;

    fn latest_item(&self, key: &str) -> Result<Option<WorkItem>, StoreError>;

    fn count_by_status(&self, status: WorkStatus) -> Result<u64, StoreError>;

    fn status_counts(&self) -> Result<StatusCounts, StoreError>;

    /// Most recently updated rows first.
    fn recent_items(&self, limit: usize) -> Result<Vec<WorkItem>, StoreError>;

    /// Queued, Processing, and RateLimited rows whose retry time is at or before `now`,
    /// ordered Queued, Processing, RateLimited, then by creation time.
    fn pending_items(&self, now: OffsetDateTime) -> Result<Vec<WorkItem>, StoreError>;

    /// Put Processing or RateLimited rows back to Queued.
    fn requeue(&self, ids: &[i64]) -> Result<u64, StoreError>;

    /// Move Processing rows last touched before `updated_before` to RateLimited (when their
    /// last error was a quota rejection) or Error.
    fn reclassify_stuck(
        &self,
        updated_before: OffsetDateTime,
        retry_after: OffsetDateTime,
    ) -> Result<StuckReport, StoreError>;

    /// Set every row with `status` to Queued, clearing error details.
    fn reset_status(&self, status: WorkStatus) -> Result<u64, StoreError>;

    /// Keep only the most recently updated row per key.
    fn remove_duplicates(&self) -> Result<u64, StoreError>;

    /// Error or RateLimited rows whose key already has a result, set to Completed unless
    /// `dry_run`.
    fn complete_resolved(&self, dry_run: bool) -> Result<Vec<WorkItem>, StoreError>;

    fn find_result(&self, key: &str) -> Result<Option<ResultRecord>, StoreError>;

    /// Insert a new result. Fails with [`StoreError::Conflict`] if the key already has one.
    fn insert_result(&self, record: &NewResult) -> Result<ResultRecord, StoreError>;

    /// Replace an existing result. Returns `None` if the key has no result yet.
    fn update_result(&self, record: &NewResult) -> Result<Option<ResultRecord>, StoreError>;
}

const WORK_ITEM_COLUMNS: &str = "id, external_key, status, error_message, \
     last_error_rate_limited, attempts, retry_after, created_at, updated_at";

const RESULT_COLUMNS: &str =
    "external_key, provider, raw_payload, extracted, created_at, updated_at";

/// DuckDB implementation of [`RecordStore`].
#[derive(Clone)]
pub struct DuckDbStore {
    manager: DuckDbConnectionManager,
    write_gate: std::sync::Arc<Mutex<()>>,
}

impl DuckDbStore {
    /// Open a store with default configuration.
    pub fn open_default() -> Result<Self, StoreError> {
        Self::open(StoreConfig::default())
    }

    /// Open a private in-memory store.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::open(StoreConfig::in_memory())
    }

    /// Open a store with the specified configuration and apply migrations.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        if let Some(parent) = config.location.path().and_then(|path| path.parent()) {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let manager = DuckDbConnectionManager::open(config.location.clone(), config.max_pool_size)?;
        let store = Self {
            manager,
            write_gate: std::sync::Arc::new(Mutex::new(())),
        };
        store.initialize()?;
        Ok(store)
    }

    /// Initialize the database schema.
    pub fn initialize(&self) -> Result<(), StoreError> {
        let connection = self.manager.acquire()?;
        let applied = migrations::apply_migrations(&connection)?;
        if applied > 0 {
            info!(applied, location = ?self.manager.location(), "store migrations applied");
        }
        Ok(())
    }

    pub fn location(&self) -> &DatabaseLocation {
        self.manager.location()
    }

    fn lock_writes(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.write_gate.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Run `body` inside a write transaction, serialized against every other writer.
    fn write<T>(
        &self,
        body: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _gate = self.lock_writes()?;
        let connection = self.manager.acquire()?;
        connection.execute_batch("BEGIN TRANSACTION")?;
        let result = body(&connection);
        finalize_transaction(&connection, result)
    }
}

impl RecordStore for DuckDbStore {
    fn enqueue(
        &self,
        key: &str,
        completed_after: OffsetDateTime,
    ) -> Result<EnqueueOutcome, StoreError> {
        self.write(|connection| {
            let params: [&dyn ToSql; 1] = [&key];
            let active = query_work_items(
                connection,
                &format!(
                    "SELECT {WORK_ITEM_COLUMNS} FROM work_items \
                     WHERE external_key = ? AND status IN ('queued', 'processing') \
                     ORDER BY updated_at DESC, id DESC LIMIT 1"
                ),
                params.as_slice(),
            )?;
            if let Some(item) = active.into_iter().next() {
                return Ok(EnqueueOutcome::AlreadyActive(item));
            }

            let cutoff = to_millis(completed_after);
            let params: [&dyn ToSql; 2] = [&key, &cutoff];
            let recent = query_work_items(
                connection,
                &format!(
                    "SELECT {WORK_ITEM_COLUMNS} FROM work_items \
                     WHERE external_key = ? AND status = 'completed' AND updated_at >= ? \
                     ORDER BY updated_at DESC, id DESC LIMIT 1"
                ),
                params.as_slice(),
            )?;
            if let Some(item) = recent.into_iter().next() {
                return Ok(EnqueueOutcome::RecentlyCompleted(item));
            }

            let now = to_millis(OffsetDateTime::now_utc());
            let id = match latest_item_on(connection, key)? {
                Some(item) => {
                    let params: [&dyn ToSql; 2] = [&now, &item.id];
                    connection.execute(
                        "UPDATE work_items SET status = 'queued', error_message = NULL, \
                         last_error_rate_limited = FALSE, attempts = 0, retry_after = NULL, \
                         updated_at = ? WHERE id = ?",
                        params.as_slice(),
                    )?;
                    item.id
                }
                None => {
                    let params: [&dyn ToSql; 3] = [&key, &now, &now];
                    connection.query_row(
                        "INSERT INTO work_items (external_key, status, created_at, updated_at) \
                         VALUES (?, 'queued', ?, ?) RETURNING id",
                        params.as_slice(),
                        |row| row.get::<_, i64>(0),
                    )?
                }
            };

            let item = item_by_id(connection, id)?
                .ok_or_else(|| StoreError::InvalidData(format!("work item {id} vanished")))?;
            debug!(key, id, "work item queued");
            Ok(EnqueueOutcome::Queued(item))
        })
    }

    fn claim(&self, key: &str) -> Result<Option<WorkItem>, StoreError> {
        self.write(|connection| {
            let params: [&dyn ToSql; 1] = [&key];
            let claimable = query_work_items(
                connection,
                &format!(
                    "SELECT {WORK_ITEM_COLUMNS} FROM work_items \
                     WHERE external_key = ? AND status = 'queued' \
                     ORDER BY updated_at DESC, id DESC LIMIT 1"
                ),
                params.as_slice(),
            )?;
            let Some(item) = claimable.into_iter().next() else {
                return Ok(None);
            };

            let now = to_millis(OffsetDateTime::now_utc());
            let params: [&dyn ToSql; 2] = [&now, &item.id];
            let changed = connection.execute(
                "UPDATE work_items SET status = 'processing', attempts = attempts + 1, \
                 updated_at = ? WHERE id = ? AND status = 'queued'",
                params.as_slice(),
            )?;
            if changed == 0 {
                return Ok(None);
            }
            item_by_id(connection, item.id)
        })
    }

    fn record_attempt_error(
        &self,
        id: i64,
        message: &str,
        rate_limited: bool,
    ) -> Result<(), StoreError> {
        self.write(|connection| {
            let now = to_millis(OffsetDateTime::now_utc());
            let params: [&dyn ToSql; 4] = [&message, &rate_limited, &now, &id];
            connection.execute(
                "UPDATE work_items SET error_message = ?, last_error_rate_limited = ?, \
                 updated_at = ? WHERE id = ? AND status = 'processing'",
                params.as_slice(),
            )?;
            Ok(())
        })
    }

    fn finish(&self, id: i64, outcome: &Outcome) -> Result<bool, StoreError> {
        self.write(|connection| {
            let now = to_millis(OffsetDateTime::now_utc());
            let status = outcome.status().as_str();
            let (message, rate_limited, retry_after) = match outcome {
                Outcome::Completed => (None, false, None),
                Outcome::Error { message } => (Some(message.as_str()), false, None),
                Outcome::RateLimited {
                    message,
                    retry_after,
                } => (Some(message.as_str()), true, Some(to_millis(*retry_after))),
            };
            let params: [&dyn ToSql; 6] = [&status, &message, &rate_limited, &retry_after, &now, &id];
            let changed = connection.execute(
                "UPDATE work_items SET status = ?, error_message = ?, \
                 last_error_rate_limited = ?, retry_after = ?, updated_at = ? \
                 WHERE id = ? AND status = 'processing'",
                params.as_slice(),
            )?;
            Ok(changed > 0)
        })
    }

    fn latest_item(&self, key: &str) -> Result<Option<WorkItem>, StoreError> {
        let connection = self.manager.acquire()?;
        latest_item_on(&connection, key)
    }

    fn count_by_status(&self, status: WorkStatus) -> Result<u64, StoreError> {
        let connection = self.manager.acquire()?;
        let status = status.as_str();
        let params: [&dyn ToSql; 1] = [&status];
        let count: i64 = connection.query_row(
            "SELECT COUNT(*) FROM work_items WHERE status = ?",
            params.as_slice(),
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    fn status_counts(&self) -> Result<StatusCounts, StoreError> {
        let connection = self.manager.acquire()?;
        let mut statement =
            connection.prepare("SELECT status, COUNT(*) FROM work_items GROUP BY status")?;
        let rows = statement.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let (status, count) = row?;
            counts.add(status.parse()?, u64::try_from(count).unwrap_or_default());
        }
        Ok(counts)
    }

    fn recent_items(&self, limit: usize) -> Result<Vec<WorkItem>, StoreError> {
        let connection = self.manager.acquire()?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let params: [&dyn ToSql; 1] = [&limit];
        query_work_items(
            &connection,
            &format!(
                "SELECT {WORK_ITEM_COLUMNS} FROM work_items \
                 ORDER BY updated_at DESC, id DESC LIMIT ?"
            ),
            params.as_slice(),
        )
    }

    fn pending_items(&self, now: OffsetDateTime) -> Result<Vec<WorkItem>, StoreError> {
        let connection = self.manager.acquire()?;
        let now = to_millis(now);
        let params: [&dyn ToSql; 1] = [&now];
        query_work_items(
            &connection,
            &format!(
                "SELECT {WORK_ITEM_COLUMNS} FROM work_items \
                 WHERE status IN ('queued', 'processing') \
                    OR (status = 'rate_limited' AND (retry_after IS NULL OR retry_after <= ?)) \
                 ORDER BY CASE status WHEN 'queued' THEN 0 WHEN 'processing' THEN 1 ELSE 2 END, \
                          created_at, id"
            ),
            params.as_slice(),
        )
    }

    fn requeue(&self, ids: &[i64]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.write(|connection| {
            let now = to_millis(OffsetDateTime::now_utc());
            let mut changed = 0_u64;
            for id in ids {
                let params: [&dyn ToSql; 2] = [&now, id];
                let rows = connection.execute(
                    "UPDATE work_items SET status = 'queued', updated_at = ? \
                     WHERE id = ? AND status IN ('processing', 'rate_limited')",
                    params.as_slice(),
                )?;
                changed += rows as u64;
            }
            Ok(changed)
        })
    }

    fn reclassify_stuck(
        &self,
        updated_before: OffsetDateTime,
        retry_after: OffsetDateTime,
    ) -> Result<StuckReport, StoreError> {
        self.write(|connection| {
            let cutoff = to_millis(updated_before);
            let now = to_millis(OffsetDateTime::now_utc());
            let retry_after = to_millis(retry_after);

            let params: [&dyn ToSql; 3] = [&retry_after, &now, &cutoff];
            let rate_limited = connection.execute(
                "UPDATE work_items SET status = 'rate_limited', \
                 error_message = 'abandoned in processing after rate limit: ' \
                     || COALESCE(error_message, 'no error recorded'), \
                 retry_after = ?, updated_at = ? \
                 WHERE status = 'processing' AND updated_at < ? AND last_error_rate_limited",
                params.as_slice(),
            )?;

            let params: [&dyn ToSql; 2] = [&now, &cutoff];
            let errored = connection.execute(
                "UPDATE work_items SET status = 'error', \
                 error_message = 'abandoned in processing: ' \
                     || COALESCE(error_message, 'no error recorded'), \
                 retry_after = NULL, updated_at = ? \
                 WHERE status = 'processing' AND updated_at < ? AND NOT last_error_rate_limited",
                params.as_slice(),
            )?;

            Ok(StuckReport {
                errored: errored as u64,
                rate_limited: rate_limited as u64,
            })
        })
    }

    fn reset_status(&self, status: WorkStatus) -> Result<u64, StoreError> {
        if status == WorkStatus::Queued {
            return Ok(0);
        }
        self.write(|connection| {
            let now = to_millis(OffsetDateTime::now_utc());
            let status = status.as_str();
            let params: [&dyn ToSql; 2] = [&now, &status];
            let changed = connection.execute(
                "UPDATE work_items SET status = 'queued', error_message = NULL, \
                 last_error_rate_limited = FALSE, retry_after = NULL, attempts = 0, \
                 updated_at = ? WHERE status = ?",
                params.as_slice(),
            )?;
            Ok(changed as u64)
        })
    }

    fn remove_duplicates(&self) -> Result<u64, StoreError> {
        self.write(|connection| {
            let removed = connection.execute(
                "DELETE FROM work_items WHERE id NOT IN ( \
                     SELECT id FROM ( \
                         SELECT id, ROW_NUMBER() OVER ( \
                             PARTITION BY external_key ORDER BY updated_at DESC, id DESC \
                         ) AS position FROM work_items \
                     ) AS ranked WHERE position = 1 \
                 )",
                [],
            )?;
            Ok(removed as u64)
        })
    }

    fn complete_resolved(&self, dry_run: bool) -> Result<Vec<WorkItem>, StoreError> {
        self.write(|connection| {
            let candidates = query_work_items(
                connection,
                &format!(
                    "SELECT {WORK_ITEM_COLUMNS} FROM work_items AS w \
                     WHERE w.status IN ('error', 'rate_limited') \
                       AND EXISTS (SELECT 1 FROM result_records AS r \
                                   WHERE r.external_key = w.external_key) \
                     ORDER BY w.created_at, w.id"
                ),
                &[],
            )?;
            if dry_run {
                return Ok(candidates);
            }

            let now = to_millis(OffsetDateTime::now_utc());
            for item in &candidates {
                let params: [&dyn ToSql; 2] = [&now, &item.id];
                connection.execute(
                    "UPDATE work_items SET status = 'completed', error_message = NULL, \
                     last_error_rate_limited = FALSE, retry_after = NULL, updated_at = ? \
                     WHERE id = ?",
                    params.as_slice(),
                )?;
            }
            Ok(candidates)
        })
    }

    fn find_result(&self, key: &str) -> Result<Option<ResultRecord>, StoreError> {
        let connection = self.manager.acquire()?;
        result_on(&connection, key)
    }

    fn insert_result(&self, record: &NewResult) -> Result<ResultRecord, StoreError> {
        let raw_payload = serde_json::to_string(&record.raw_payload)?;
        let extracted = serde_json::to_string(&record.fields)?;
        self.write(|connection| {
            let now = to_millis(OffsetDateTime::now_utc());
            let params: [&dyn ToSql; 7] = [
                &record.external_key,
                &record.provider,
                &raw_payload,
                &extracted,
                &record.fields.company_name,
                &now,
                &now,
            ];
            connection
                .execute(
                    "INSERT INTO result_records \
                     (external_key, provider, raw_payload, extracted, company_name, created_at, updated_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                    params.as_slice(),
                )
                .map_err(|error| {
                    if is_unique_violation(&error) {
                        StoreError::Conflict {
                            key: record.external_key.clone(),
                        }
                    } else {
                        StoreError::DuckDb(error)
                    }
                })?;

            result_on(connection, &record.external_key)?.ok_or_else(|| {
                StoreError::InvalidData(format!("result `{}` vanished", record.external_key))
            })
        })
    }

    fn update_result(&self, record: &NewResult) -> Result<Option<ResultRecord>, StoreError> {
        let raw_payload = serde_json::to_string(&record.raw_payload)?;
        let extracted = serde_json::to_string(&record.fields)?;
        self.write(|connection| {
            let now = to_millis(OffsetDateTime::now_utc());
            let params: [&dyn ToSql; 6] = [
                &record.provider,
                &raw_payload,
                &extracted,
                &record.fields.company_name,
                &now,
                &record.external_key,
            ];
            let changed = connection.execute(
                "UPDATE result_records SET provider = ?, raw_payload = ?, extracted = ?, \
                 company_name = ?, updated_at = ? WHERE external_key = ?",
                params.as_slice(),
            )?;
            if changed == 0 {
                return Ok(None);
            }
            result_on(connection, &record.external_key)
        })
    }
}

/// Finalize a transaction, committing on success or rolling back on failure.
fn finalize_transaction<T>(
    connection: &Connection,
    result: Result<T, StoreError>,
) -> Result<T, StoreError> {
    match result {
        Ok(value) => {
            connection.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(error) => {
            let _ = connection.execute_batch("ROLLBACK");
            Err(error)
        }
    }
}

struct WorkItemRow {
    id: i64,
    external_key: String,
    status: String,
    error_message: Option<String>,
    last_error_rate_limited: bool,
    attempts: i64,
    retry_after: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

fn read_work_item_row(row: &::duckdb::Row<'_>) -> Result<WorkItemRow, ::duckdb::Error> {
    Ok(WorkItemRow {
        id: row.get(0)?,
        external_key: row.get(1)?,
        status: row.get(2)?,
        error_message: row.get(3)?,
        last_error_rate_limited: row.get(4)?,
        attempts: row.get(5)?,
        retry_after: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

impl TryFrom<WorkItemRow> for WorkItem {
    type Error = StoreError;

    fn try_from(row: WorkItemRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            external_key: row.external_key,
            status: row.status.parse()?,
            error_message: row.error_message,
            last_error_rate_limited: row.last_error_rate_limited,
            attempts: u32::try_from(row.attempts).unwrap_or(u32::MAX),
            retry_after: row.retry_after.map(from_millis).transpose()?,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
        })
    }
}

fn query_work_items(
    connection: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
) -> Result<Vec<WorkItem>, StoreError> {
    let mut statement = connection.prepare(sql)?;
    let rows = statement.query_map(params, read_work_item_row)?;
    let mut items = Vec::new();
    for row in rows {
        items.push(WorkItem::try_from(row?)?);
    }
    Ok(items)
}

fn item_by_id(connection: &Connection, id: i64) -> Result<Option<WorkItem>, StoreError> {
    let params: [&dyn ToSql; 1] = [&id];
    let items = query_work_items(
        connection,
        &format!("SELECT {WORK_ITEM_COLUMNS} FROM work_items WHERE id = ?"),
        params.as_slice(),
    )?;
    Ok(items.into_iter().next())
}

fn latest_item_on(connection: &Connection, key: &str) -> Result<Option<WorkItem>, StoreError> {
    let params: [&dyn ToSql; 1] = [&key];
    let items = query_work_items(
        connection,
        &format!(
            "SELECT {WORK_ITEM_COLUMNS} FROM work_items WHERE external_key = ? \
             ORDER BY updated_at DESC, id DESC LIMIT 1"
        ),
        params.as_slice(),
    )?;
    Ok(items.into_iter().next())
}

fn result_on(connection: &Connection, key: &str) -> Result<Option<ResultRecord>, StoreError> {
    let params: [&dyn ToSql; 1] = [&key];
    let mut statement = connection.prepare(&format!(
        "SELECT {RESULT_COLUMNS} FROM result_records WHERE external_key = ?"
    ))?;
    let mut rows = statement.query_map(params.as_slice(), |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, i64>(4)?,
            row.get::<_, i64>(5)?,
        ))
    })?;

    let Some(row) = rows.next() else {
        return Ok(None);
    };
    let (external_key, provider, raw_payload, extracted, created_at, updated_at) = row?;
    Ok(Some(ResultRecord {
        external_key,
        provider,
        raw_payload: serde_json::from_str(&raw_payload)?,
        fields: serde_json::from_str(&extracted)?,
        created_at: from_millis(created_at)?,
        updated_at: from_millis(updated_at)?,
    }))
}

fn is_unique_violation(error: &::duckdb::Error) -> bool {
    let message = error.to_string();
    message.contains("Duplicate key")
        || message.contains("unique constraint")
        || message.contains("PRIMARY KEY or UNIQUE")
}

fn to_millis(at: OffsetDateTime) -> i64 {
    i64::try_from(at.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

fn from_millis(millis: i64) -> Result<OffsetDateTime, StoreError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .map_err(|error| StoreError::InvalidData(error.to_string()))
}

/// Resolve the cadastro home directory from environment or default.
fn resolve_cadastro_home() -> PathBuf {
    if let Some(path) = env::var_os("CADASTRO_HOME") {
        let path = PathBuf::from(path);
        if !path.as_os_str().is_empty() {
            return path;
        }
    }

    if let Some(home) = env::var_os("HOME") {
        return PathBuf::from(home).join(".cadastro");
    }

    PathBuf::from(".cadastro")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use time::Duration;

    const KEY: &str = "11222333000181";

    fn long_ago() -> OffsetDateTime {
        OffsetDateTime::now_utc() - Duration::days(7)
    }

    #[test]
    fn test_opens_file_database_and_creates_parent_dirs() {
        let temp = tempdir().expect("tempdir");
        let db_path = temp.path().join("nested").join("cadastro.duckdb");

        let store = DuckDbStore::open(StoreConfig::at_path(&db_path)).expect("open");

        assert!(db_path.exists());
        assert_eq!(store.location(), &DatabaseLocation::File(db_path));
        assert_eq!(store.status_counts().expect("counts").total(), 0);
    }

    #[test]
    fn test_claim_hands_a_row_out_once() {
        let store = DuckDbStore::open_in_memory().expect("open");
        store.enqueue(KEY, long_ago()).expect("enqueue");

        let first = store.claim(KEY).expect("claim");
        let second = store.claim(KEY).expect("claim again");

        let claimed = first.expect("claimable row");
        assert_eq!(claimed.status, WorkStatus::Processing);
        assert_eq!(claimed.attempts, 1);
        assert!(second.is_none());
    }

    #[test]
    fn test_finish_only_applies_to_processing_rows() {
        let store = DuckDbStore::open_in_memory().expect("open");
        store.enqueue(KEY, long_ago()).expect("enqueue");
        let item = store.claim(KEY).expect("claim").expect("row");

        assert!(store.finish(item.id, &Outcome::Completed).expect("finish"));
        let again = store
            .finish(
                item.id,
                &Outcome::Error {
                    message: String::from("late"),
                },
            )
            .expect("finish again");

        assert!(!again);
        let latest = store.latest_item(KEY).expect("latest").expect("row");
        assert_eq!(latest.status, WorkStatus::Completed);
    }

    #[test]
    fn test_insert_result_reports_conflict_for_existing_key() {
        let store = DuckDbStore::open_in_memory().expect("open");
        let record = NewResult {
            external_key: String::from(KEY),
            provider: String::from("receitaws"),
            raw_payload: serde_json::json!({"nome": "ACME"}),
            fields: ExtractedFields {
                company_name: Some(String::from("ACME")),
                ..ExtractedFields::default()
            },
        };

        store.insert_result(&record).expect("first insert");
        let error = store.insert_result(&record).expect_err("duplicate insert");

        assert!(matches!(error, StoreError::Conflict { ref key } if key == KEY));
    }

    fn insert_raw_row(store: &DuckDbStore, key: &str, status: WorkStatus, updated_at: i64) {
        let connection = store.manager.acquire().expect("connection");
        let status = status.as_str();
        let params: [&dyn ToSql; 4] = [&key, &status, &updated_at, &updated_at];
        connection
            .execute(
                "INSERT INTO work_items (external_key, status, created_at, updated_at) \
                 VALUES (?, ?, ?, ?)",
                params.as_slice(),
            )
            .expect("insert row");
    }

    #[test]
    fn test_remove_duplicates_keeps_latest_row_per_key() {
        let store = DuckDbStore::open_in_memory().expect("open");
        let now = to_millis(OffsetDateTime::now_utc());
        insert_raw_row(&store, KEY, WorkStatus::Error, now - 2_000);
        insert_raw_row(&store, KEY, WorkStatus::Completed, now - 1_000);
        insert_raw_row(&store, KEY, WorkStatus::RateLimited, now - 3_000);
        insert_raw_row(&store, "11444777000161", WorkStatus::Queued, now);

        let removed = store.remove_duplicates().expect("dedupe");

        assert_eq!(removed, 2);
        let latest = store.latest_item(KEY).expect("latest").expect("row");
        assert_eq!(latest.status, WorkStatus::Completed);
        assert_eq!(store.status_counts().expect("counts").total(), 2);
    }

    #[test]
    fn test_latest_row_decides_status_when_history_exists() {
        let store = DuckDbStore::open_in_memory().expect("open");
        let now = to_millis(OffsetDateTime::now_utc());
        insert_raw_row(&store, KEY, WorkStatus::Completed, now - 5_000);
        insert_raw_row(&store, KEY, WorkStatus::Error, now - 1_000);

        let latest = store.latest_item(KEY).expect("latest").expect("row");
        assert_eq!(latest.status, WorkStatus::Error);
    }
}
