//! Incidental browser sub-resources fetched while servicing a Request
//! (spec §3.1) — recorded for accounting, never dequeued themselves.

use sqlx::Row;

use crate::clock::now_nanos;
use crate::model::IncidentalRequest;

use super::{Store, StoreResult};

fn row_to_incidental(row: &sqlx::sqlite::SqliteRow) -> StoreResult<IncidentalRequest> {
    Ok(IncidentalRequest {
        id: row.try_get("id")?,
        parent_request_id: row.try_get("parent_request_id")?,
        resource_type: row.try_get("resource_type")?,
        method: row.try_get("method")?,
        url: row.try_get("url")?,
        status_code: row.try_get::<Option<i64>, _>("status_code")?.map(|c| c as u16),
        from_cache: row.try_get::<i64, _>("from_cache")? != 0,
        content_size: row.try_get("content_size")?,
        created_at: row.try_get("created_at")?,
    })
}

impl Store {
    #[allow(clippy::too_many_arguments)]
    pub async fn store_incidental_request(
        &self,
        parent_request_id: i64,
        resource_type: &str,
        method: &str,
        url: &str,
        status_code: Option<u16>,
        from_cache: bool,
        content_size: Option<i64>,
    ) -> StoreResult<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO incidental_requests (
                parent_request_id, resource_type, method, url, status_code, from_cache,
                content_size, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(parent_request_id)
        .bind(resource_type)
        .bind(method)
        .bind(url)
        .bind(status_code.map(|c| c as i64))
        .bind(from_cache as i64)
        .bind(content_size)
        .bind(now_nanos())
        .fetch_one(self.pool())
        .await?;
        Ok(id)
    }

    pub async fn incidental_requests_for(
        &self,
        parent_request_id: i64,
    ) -> StoreResult<Vec<IncidentalRequest>> {
        let rows = sqlx::query(
            "SELECT id, parent_request_id, resource_type, method, url, status_code, from_cache, \
             content_size, created_at FROM incidental_requests WHERE parent_request_id = ?",
        )
        .bind(parent_request_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(row_to_incidental).collect()
    }
}
