//! The single run-metadata row (spec §3.1, §4.1.1): scraper identity,
//! invocation params, and the lifecycle status `lifecycle.rs` drives.

use sqlx::Row;

use crate::clock::now_nanos;
use crate::model::{RunMetadata, RunStatus};

use super::{json_to_text, text_to_json, Store, StoreResult};

fn row_to_metadata(row: &sqlx::sqlite::SqliteRow) -> StoreResult<RunMetadata> {
    let status: String = row.try_get("status")?;
    Ok(RunMetadata {
        scraper_name: row.try_get("scraper_name")?,
        scraper_version: row.try_get("scraper_version")?,
        status: RunStatus::parse(&status).ok_or(super::StoreError::NoSuchRow)?,
        invocation_params_json: text_to_json(
            row.try_get::<String, _>("invocation_params_json")?.as_str(),
        )?,
        base_delay_ms: row.try_get("base_delay_ms")?,
        jitter: row.try_get("jitter")?,
        num_workers: row.try_get("num_workers")?,
        max_backoff_ms: row.try_get("max_backoff_ms")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        created_at: row.try_get("created_at")?,
    })
}

impl Store {
    /// Spec §4.1.1: create the run-metadata row on first open, or return the
    /// existing one on resume (its params are not overwritten).
    #[allow(clippy::too_many_arguments)]
    pub async fn init_run_metadata(
        &self,
        scraper_name: &str,
        scraper_version: &str,
        invocation_params: &serde_json::Value,
        base_delay_ms: i64,
        jitter: f64,
        num_workers: i64,
        max_backoff_ms: i64,
    ) -> StoreResult<RunMetadata> {
        if let Some(existing) = self.get_run_metadata().await? {
            return Ok(existing);
        }
        let now = now_nanos();
        sqlx::query(
            "INSERT INTO run_metadata (
                id, scraper_name, scraper_version, status, invocation_params_json,
                base_delay_ms, jitter, num_workers, max_backoff_ms, created_at
            ) VALUES (1, ?, ?, 'created', ?, ?, ?, ?, ?, ?)",
        )
        .bind(scraper_name)
        .bind(scraper_version)
        .bind(json_to_text(invocation_params))
        .bind(base_delay_ms)
        .bind(jitter)
        .bind(num_workers)
        .bind(max_backoff_ms)
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(self.get_run_metadata().await?.expect("just inserted"))
    }

    pub async fn get_run_metadata(&self) -> StoreResult<Option<RunMetadata>> {
        let row = sqlx::query(
            "SELECT scraper_name, scraper_version, status, invocation_params_json, \
             base_delay_ms, jitter, num_workers, max_backoff_ms, started_at, completed_at, \
             created_at FROM run_metadata WHERE id = 1",
        )
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(row_to_metadata).transpose()
    }

    pub async fn set_run_status(&self, status: RunStatus) -> StoreResult<()> {
        let now = now_nanos();
        match status {
            RunStatus::Running => {
                sqlx::query(
                    "UPDATE run_metadata SET status = ?, started_at = COALESCE(started_at, ?) \
                     WHERE id = 1",
                )
                .bind(status.as_str())
                .bind(now)
                .execute(self.pool())
                .await?;
            }
            RunStatus::Completed | RunStatus::Failed | RunStatus::Interrupted => {
                sqlx::query("UPDATE run_metadata SET status = ?, completed_at = ? WHERE id = 1")
                    .bind(status.as_str())
                    .bind(now)
                    .execute(self.pool())
                    .await?;
            }
            RunStatus::Created => {
                sqlx::query("UPDATE run_metadata SET status = ? WHERE id = 1")
                    .bind(status.as_str())
                    .execute(self.pool())
                    .await?;
            }
        }
        Ok(())
    }
}
