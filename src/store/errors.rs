//! Classified error rows (spec §3.1, §7) — distinct from the in-process
//! [`crate::errors`] categorisation module this table records the output of.

use sqlx::Row;

use crate::clock::now_nanos;
use crate::model::{ErrorRow, ErrorType};

use super::{text_to_json, Store, StoreResult};

fn row_to_error(row: &sqlx::sqlite::SqliteRow) -> StoreResult<ErrorRow> {
    let error_type: String = row.try_get("error_type")?;
    let validation_errors: Option<String> = row.try_get("validation_errors_json")?;
    Ok(ErrorRow {
        id: row.try_get("id")?,
        request_id: row.try_get("request_id")?,
        error_type: ErrorType::parse(&error_type).ok_or(super::StoreError::NoSuchRow)?,
        error_class: row.try_get("error_class")?,
        message: row.try_get("message")?,
        request_url: row.try_get("request_url")?,
        selector: row.try_get("selector")?,
        expected_min: row.try_get("expected_min")?,
        expected_max: row.try_get("expected_max")?,
        actual_count: row.try_get("actual_count")?,
        model_name: row.try_get("model_name")?,
        validation_errors_json: validation_errors.map(|t| text_to_json(&t)).transpose()?,
        failed_doc: row.try_get("failed_doc")?,
        status_code: row.try_get("status_code")?,
        timeout_seconds: row.try_get("timeout_seconds")?,
        traceback: row.try_get("traceback")?,
        is_resolved: row.try_get::<i64, _>("is_resolved")? != 0,
        resolved_at: row.try_get("resolved_at")?,
        resolution_notes: row.try_get("resolution_notes")?,
        created_at: row.try_get("created_at")?,
    })
}

const SELECT_COLS: &str = "id, request_id, error_type, error_class, message, request_url, \
     selector, expected_min, expected_max, actual_count, model_name, validation_errors_json, \
     failed_doc, status_code, timeout_seconds, traceback, is_resolved, resolved_at, \
     resolution_notes, created_at";

/// Fields callers supply when recording a classified failure; id/created_at
/// are assigned by the Store.
#[derive(Debug, Clone, Default)]
pub struct NewError {
    pub request_id: Option<i64>,
    pub error_type: Option<ErrorType>,
    pub error_class: String,
    pub message: String,
    pub request_url: Option<String>,
    pub selector: Option<String>,
    pub expected_min: Option<i64>,
    pub expected_max: Option<i64>,
    pub actual_count: Option<i64>,
    pub model_name: Option<String>,
    pub validation_errors_json: Option<serde_json::Value>,
    pub failed_doc: Option<String>,
    pub status_code: Option<i64>,
    pub timeout_seconds: Option<f64>,
    pub traceback: Option<String>,
}

impl Store {
    pub async fn store_error(&self, e: NewError) -> StoreResult<i64> {
        let error_type = e.error_type.unwrap_or(ErrorType::Fatal);
        let id: i64 = sqlx::query_scalar(&format!(
            "INSERT INTO errors (
                request_id, error_type, error_class, message, request_url, selector,
                expected_min, expected_max, actual_count, model_name, validation_errors_json,
                failed_doc, status_code, timeout_seconds, traceback, is_resolved, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?) RETURNING id"
        ))
        .bind(e.request_id)
        .bind(error_type.as_str())
        .bind(&e.error_class)
        .bind(&e.message)
        .bind(&e.request_url)
        .bind(&e.selector)
        .bind(e.expected_min)
        .bind(e.expected_max)
        .bind(e.actual_count)
        .bind(&e.model_name)
        .bind(e.validation_errors_json.map(|v| v.to_string()))
        .bind(&e.failed_doc)
        .bind(e.status_code)
        .bind(e.timeout_seconds)
        .bind(&e.traceback)
        .bind(now_nanos())
        .fetch_one(self.pool())
        .await?;
        Ok(id)
    }

    pub async fn resolve_error(&self, id: i64, notes: Option<&str>) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE errors SET is_resolved = 1, resolved_at = ?, resolution_notes = ? WHERE id = ?",
        )
        .bind(now_nanos())
        .bind(notes)
        .bind(id)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(super::StoreError::NoSuchRow);
        }
        Ok(())
    }

    pub async fn list_errors(
        &self,
        error_type: Option<ErrorType>,
        unresolved_only: bool,
        limit: i64,
    ) -> StoreResult<Vec<ErrorRow>> {
        let mut sql = format!("SELECT {SELECT_COLS} FROM errors WHERE 1=1");
        if error_type.is_some() {
            sql.push_str(" AND error_type = ?");
        }
        if unresolved_only {
            sql.push_str(" AND is_resolved = 0");
        }
        sql.push_str(" ORDER BY id DESC LIMIT ?");

        let mut query = sqlx::query(&sql);
        if let Some(t) = error_type {
            query = query.bind(t.as_str());
        }
        query = query.bind(limit);

        let rows = query.fetch_all(self.pool()).await?;
        rows.iter().map(row_to_error).collect()
    }

    /// Requests whose most recent error matches `error_type` and are not
    /// currently pending/in_progress — candidates for `cli requeue --errors`.
    pub async fn request_ids_with_unresolved_error(
        &self,
        error_type: ErrorType,
    ) -> StoreResult<Vec<i64>> {
        let rows: Vec<i64> = sqlx::query_scalar(
            "SELECT DISTINCT request_id FROM errors \
             WHERE error_type = ? AND is_resolved = 0 AND request_id IS NOT NULL",
        )
        .bind(error_type.as_str())
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewRequest;

    #[tokio::test]
    async fn store_and_resolve_error() {
        let store = Store::open_in_memory().await.unwrap();
        let request_id = store
            .insert_request(NewRequest {
                url: "https://x/1".into(),
                continuation: "parse".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let id = store
            .store_error(NewError {
                request_id: Some(request_id),
                error_type: Some(ErrorType::Validation),
                error_class: "MissingField".into(),
                message: "title missing".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let unresolved = store.list_errors(None, true, 10).await.unwrap();
        assert_eq!(unresolved.len(), 1);
        store.resolve_error(id, Some("fixed upstream")).await.unwrap();
        let unresolved = store.list_errors(None, true, 10).await.unwrap();
        assert!(unresolved.is_empty());
    }

    #[tokio::test]
    async fn filters_by_error_type_for_requeue() {
        let store = Store::open_in_memory().await.unwrap();
        let request_id = store
            .insert_request(NewRequest {
                url: "https://x/1".into(),
                continuation: "parse".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .store_error(NewError {
                request_id: Some(request_id),
                error_type: Some(ErrorType::Transient),
                error_class: "Timeout".into(),
                message: "timed out".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let ids = store
            .request_ids_with_unresolved_error(ErrorType::Transient)
            .await
            .unwrap();
        assert_eq!(ids, vec![request_id]);
        let none = store
            .request_ids_with_unresolved_error(ErrorType::Fatal)
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}
