//! The Store: single source of truth for all driver state (spec §4.1).
//!
//! Backed by SQLite through `sqlx`. All public operations are coroutine-safe;
//! `dequeue_next` is the one operation that must be atomic under N concurrent
//! workers, and it gets there with a single `UPDATE ... RETURNING` statement
//! rather than an in-memory lock — SQLite serialises writers for us.

mod archive;
mod errors;
mod estimates;
mod incidental;
mod integrity;
mod rate_limiter;
mod requests;
mod responses;
mod results;
mod run_metadata;
mod speculation;

pub use archive::*;
pub use errors::*;
pub use estimates::*;
pub use incidental::*;
pub use integrity::*;
pub use requests::*;
pub use responses::*;
pub use results::*;
pub use run_metadata::*;
pub use speculation::*;

use std::path::Path;

use serde_json::Value as Json;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("invalid JSON column contents: {0}")]
    Json(#[from] serde_json::Error),

    #[error("request {0} not found")]
    RequestNotFound(i64),

    #[error("no row to update matched the given id")]
    NoSuchRow,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable KV store for the whole driver.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if absent) the SQLite database at `path` and run
    /// migrations (spec §4.1.1). Refusing to open a newer schema than this
    /// binary understands is handled by `sqlx::migrate!`, which errors if the
    /// on-disk migration ledger references a version this binary has no
    /// migration file for.
    pub async fn open(path: &Path) -> StoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory store, for tests.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Spec §4.1.2: atomically convert every `in_progress` row back to
    /// `pending`, clearing `started_at`. The only crash-recovery mechanism.
    pub async fn reset_in_progress_to_pending(&self) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE requests SET status = 'pending', started_at = NULL \
             WHERE status = 'in_progress'",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn count_in_progress(&self) -> StoreResult<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM requests WHERE status = 'in_progress'")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}

pub(crate) fn json_to_text(value: &Json) -> String {
    value.to_string()
}

pub(crate) fn text_to_json(text: &str) -> StoreResult<Json> {
    Ok(serde_json::from_str(text)?)
}

pub(crate) fn map_to_text(map: &std::collections::HashMap<String, String>) -> StoreResult<String> {
    Ok(serde_json::to_string(map)?)
}

pub(crate) fn text_to_map(text: &str) -> StoreResult<std::collections::HashMap<String, String>> {
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_runs_migrations() {
        let store = Store::open_in_memory().await.unwrap();
        assert_eq!(store.count_in_progress().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn resume_law_zeroes_in_progress() {
        let store = Store::open_in_memory().await.unwrap();
        let req = NewRequest {
            url: "https://x/y".into(),
            continuation: "parse".into(),
            ..Default::default()
        };
        let id = store.insert_request(req).await.unwrap();
        store.dequeue_next().await.unwrap();
        assert_eq!(store.count_in_progress().await.unwrap(), 1);
        let reset = store.reset_in_progress_to_pending().await.unwrap();
        assert_eq!(reset, 1);
        assert_eq!(store.count_in_progress().await.unwrap(), 0);
        let row = store.get_request(id).await.unwrap().unwrap();
        assert_eq!(row.status, crate::model::RequestStatus::Pending);
        assert!(row.started_at.is_none());
    }
}
