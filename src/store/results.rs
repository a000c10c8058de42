//! Result rows: the extracted data a step yields (spec §3.1, §4.4).

use serde_json::Value as Json;
use sqlx::Row;

use crate::clock::now_nanos;
use crate::model::ResultRow;

use super::{json_to_text, text_to_json, Store, StoreResult};

fn row_to_result(row: &sqlx::sqlite::SqliteRow) -> StoreResult<ResultRow> {
    let validation_errors: Option<String> = row.try_get("validation_errors_json")?;
    Ok(ResultRow {
        id: row.try_get("id")?,
        request_id: row.try_get("request_id")?,
        result_type: row.try_get("result_type")?,
        data_json: text_to_json(row.try_get::<String, _>("data_json")?.as_str())?,
        is_valid: row.try_get::<i64, _>("is_valid")? != 0,
        validation_errors_json: validation_errors.map(|t| text_to_json(&t)).transpose()?,
        created_at: row.try_get("created_at")?,
    })
}

impl Store {
    pub async fn store_result(
        &self,
        request_id: i64,
        result_type: &str,
        data: Json,
        is_valid: bool,
        validation_errors: Option<Json>,
    ) -> StoreResult<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO results (request_id, result_type, data_json, is_valid, \
             validation_errors_json, created_at) VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(request_id)
        .bind(result_type)
        .bind(json_to_text(&data))
        .bind(is_valid as i64)
        .bind(validation_errors.map(|v| json_to_text(&v)))
        .bind(now_nanos())
        .fetch_one(self.pool())
        .await?;
        Ok(id)
    }

    pub async fn get_result(&self, id: i64) -> StoreResult<Option<ResultRow>> {
        let row = sqlx::query(
            "SELECT id, request_id, result_type, data_json, is_valid, validation_errors_json, \
             created_at FROM results WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(row_to_result).transpose()
    }

    pub async fn list_results(
        &self,
        result_type: Option<&str>,
        only_invalid: bool,
        limit: i64,
    ) -> StoreResult<Vec<ResultRow>> {
        let mut sql = "SELECT id, request_id, result_type, data_json, is_valid, \
                        validation_errors_json, created_at FROM results WHERE 1=1"
            .to_string();
        if result_type.is_some() {
            sql.push_str(" AND result_type = ?");
        }
        if only_invalid {
            sql.push_str(" AND is_valid = 0");
        }
        sql.push_str(" ORDER BY id DESC LIMIT ?");

        let mut query = sqlx::query(&sql);
        if let Some(t) = result_type {
            query = query.bind(t);
        }
        query = query.bind(limit);

        let rows = query.fetch_all(self.pool()).await?;
        rows.iter().map(row_to_result).collect()
    }

    /// Newline-delimited JSON export of every result, for `cli results export --jsonl`.
    pub async fn export_results_jsonl(&self) -> StoreResult<String> {
        let results = self.list_results(None, false, i64::MAX).await?;
        let mut out = String::new();
        for r in &results {
            out.push_str(&serde_json::to_string(r)?);
            out.push('\n');
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewRequest;

    #[tokio::test]
    async fn store_and_fetch_result() {
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
            .store_result(
                request_id,
                "listing",
                serde_json::json!({"title": "x"}),
                true,
                None,
            )
            .await
            .unwrap();
        let row = store.get_result(id).await.unwrap().unwrap();
        assert_eq!(row.result_type, "listing");
        assert!(row.is_valid);
    }

    #[tokio::test]
    async fn list_results_filters_invalid() {
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
            .store_result(request_id, "listing", serde_json::json!({}), true, None)
            .await
            .unwrap();
        store
            .store_result(
                request_id,
                "listing",
                serde_json::json!({}),
                false,
                Some(serde_json::json!(["missing field"])),
            )
            .await
            .unwrap();
        let invalid = store.list_results(None, true, 10).await.unwrap();
        assert_eq!(invalid.len(), 1);
        assert!(!invalid[0].is_valid);
    }
}
