//! Response rows: one compressed body per completed Request (spec §3.1, §4.2).

use std::collections::HashMap;

use sqlx::Row;

use crate::clock::now_nanos;
use crate::model::{Response, SpeculationOutcome};

use super::{map_to_text, text_to_map, Store, StoreResult};

fn row_to_response(row: &sqlx::sqlite::SqliteRow) -> StoreResult<Response> {
    let outcome: Option<String> = row.try_get("speculation_outcome")?;
    Ok(Response {
        request_id: row.try_get("request_id")?,
        status_code: row.try_get::<i64, _>("status_code")? as u16,
        headers: text_to_map(row.try_get::<String, _>("headers_json")?.as_str())?,
        final_url: row.try_get("final_url")?,
        content_compressed: row.try_get("content_compressed")?,
        content_size_original: row.try_get("content_size_original")?,
        content_size_compressed: row.try_get("content_size_compressed")?,
        compression_dict_id: row.try_get("compression_dict_id")?,
        continuation: row.try_get("continuation")?,
        speculation_outcome: outcome.and_then(|o| SpeculationOutcome::parse(&o)),
        created_at: row.try_get("created_at")?,
    })
}

impl Store {
    /// Spec §4.2 `store_response`: persists an already-compressed body.
    #[allow(clippy::too_many_arguments)]
    pub async fn store_response(
        &self,
        request_id: i64,
        status_code: u16,
        headers: &HashMap<String, String>,
        final_url: &str,
        content_compressed: &[u8],
        content_size_original: i64,
        compression_dict_id: Option<i64>,
        continuation: &str,
        speculation_outcome: Option<SpeculationOutcome>,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO responses (
                request_id, status_code, headers_json, final_url, content_compressed,
                content_size_original, content_size_compressed, compression_dict_id,
                continuation, speculation_outcome, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(request_id) DO UPDATE SET
                status_code = excluded.status_code,
                headers_json = excluded.headers_json,
                final_url = excluded.final_url,
                content_compressed = excluded.content_compressed,
                content_size_original = excluded.content_size_original,
                content_size_compressed = excluded.content_size_compressed,
                compression_dict_id = excluded.compression_dict_id,
                continuation = excluded.continuation,
                speculation_outcome = excluded.speculation_outcome,
                created_at = excluded.created_at",
        )
        .bind(request_id)
        .bind(status_code as i64)
        .bind(map_to_text(headers)?)
        .bind(final_url)
        .bind(content_compressed)
        .bind(content_size_original)
        .bind(content_compressed.len() as i64)
        .bind(compression_dict_id)
        .bind(continuation)
        .bind(speculation_outcome.map(|o| o.as_str()))
        .bind(now_nanos())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_response(&self, request_id: i64) -> StoreResult<Option<Response>> {
        let row = sqlx::query(
            "SELECT request_id, status_code, headers_json, final_url, content_compressed, \
             content_size_original, content_size_compressed, compression_dict_id, continuation, \
             speculation_outcome, created_at FROM responses WHERE request_id = ?",
        )
        .bind(request_id)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(row_to_response).transpose()
    }

    /// Uncompressed-baseline responses for a continuation (no dict assigned yet),
    /// sampled randomly up to `sample_limit` (spec §4.2 `train`).
    pub async fn responses_without_dict(
        &self,
        continuation: &str,
        sample_limit: i64,
    ) -> StoreResult<Vec<Response>> {
        let rows = sqlx::query(
            "SELECT request_id, status_code, headers_json, final_url, content_compressed, \
             content_size_original, content_size_compressed, compression_dict_id, continuation, \
             speculation_outcome, created_at FROM responses \
             WHERE continuation = ? AND compression_dict_id IS NULL \
             ORDER BY RANDOM() LIMIT ?",
        )
        .bind(continuation)
        .bind(sample_limit)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(row_to_response).collect()
    }

    /// Every response for a continuation, regardless of dictionary version,
    /// used as the target set for bulk re-compression (spec §4.2 `recompress`).
    pub async fn responses_for_continuation(&self, continuation: &str) -> StoreResult<Vec<Response>> {
        let rows = sqlx::query(
            "SELECT request_id, status_code, headers_json, final_url, content_compressed, \
             content_size_original, content_size_compressed, compression_dict_id, continuation, \
             speculation_outcome, created_at FROM responses WHERE continuation = ?",
        )
        .bind(continuation)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(row_to_response).collect()
    }

    pub async fn update_response_compression(
        &self,
        request_id: i64,
        content_compressed: &[u8],
        compression_dict_id: Option<i64>,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE responses SET content_compressed = ?, content_size_compressed = ?, \
             compression_dict_id = ? WHERE request_id = ?",
        )
        .bind(content_compressed)
        .bind(content_compressed.len() as i64)
        .bind(compression_dict_id)
        .bind(request_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewRequest;

    #[tokio::test]
    async fn store_and_fetch_response() {
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
            .store_response(
                request_id,
                200,
                &HashMap::new(),
                "https://x/1",
                b"compressed-bytes",
                1000,
                None,
                "parse",
                None,
            )
            .await
            .unwrap();
        let response = store.get_response(request_id).await.unwrap().unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.content_size_original, 1000);
    }

    #[tokio::test]
    async fn update_compression_reassigns_dict() {
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
            .store_response(
                request_id,
                200,
                &HashMap::new(),
                "https://x/1",
                b"raw",
                1000,
                None,
                "parse",
                None,
            )
            .await
            .unwrap();
        let dict_id = store
            .store_compression_dict("parse", 1, 50, b"dict-bytes")
            .await
            .unwrap();
        store
            .update_response_compression(request_id, b"smaller", Some(dict_id))
            .await
            .unwrap();
        let response = store.get_response(request_id).await.unwrap().unwrap();
        assert_eq!(response.compression_dict_id, Some(dict_id));
        assert_eq!(response.content_compressed, b"smaller");
    }
}
