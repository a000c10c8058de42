//! Archived files and zstd compression dictionaries (spec §3.1, §4.2).

use sqlx::Row;

use crate::clock::now_nanos;
use crate::model::{ArchivedFile, CompressionDict};

use super::{Store, StoreResult};

fn row_to_dict(row: &sqlx::sqlite::SqliteRow) -> StoreResult<CompressionDict> {
    Ok(CompressionDict {
        id: row.try_get("id")?,
        continuation: row.try_get("continuation")?,
        version: row.try_get("version")?,
        sample_count: row.try_get("sample_count")?,
        dict_bytes: row.try_get("dict_bytes")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_archived_file(row: &sqlx::sqlite::SqliteRow) -> StoreResult<ArchivedFile> {
    Ok(ArchivedFile {
        id: row.try_get("id")?,
        request_id: row.try_get("request_id")?,
        file_path: row.try_get("file_path")?,
        original_url: row.try_get("original_url")?,
        expected_type: row.try_get("expected_type")?,
        file_size: row.try_get("file_size")?,
        content_hash: row.try_get("content_hash")?,
        created_at: row.try_get("created_at")?,
    })
}

impl Store {
    pub async fn store_compression_dict(
        &self,
        continuation: &str,
        version: i64,
        sample_count: i64,
        dict_bytes: &[u8],
    ) -> StoreResult<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO compression_dicts (continuation, version, sample_count, dict_bytes, \
             created_at) VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(continuation)
        .bind(version)
        .bind(sample_count)
        .bind(dict_bytes)
        .bind(now_nanos())
        .fetch_one(self.pool())
        .await?;
        Ok(id)
    }

    /// The newest dictionary for a continuation, if any (spec §4.2 `compress_response`).
    pub async fn latest_compression_dict(
        &self,
        continuation: &str,
    ) -> StoreResult<Option<CompressionDict>> {
        let row = sqlx::query(
            "SELECT id, continuation, version, sample_count, dict_bytes, created_at \
             FROM compression_dicts WHERE continuation = ? ORDER BY version DESC LIMIT 1",
        )
        .bind(continuation)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(row_to_dict).transpose()
    }

    pub async fn get_compression_dict(&self, id: i64) -> StoreResult<Option<CompressionDict>> {
        let row = sqlx::query(
            "SELECT id, continuation, version, sample_count, dict_bytes, created_at \
             FROM compression_dicts WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(row_to_dict).transpose()
    }

    pub async fn store_archived_file(
        &self,
        request_id: i64,
        file_path: &str,
        original_url: &str,
        expected_type: Option<&str>,
        file_size: i64,
        content_hash: &str,
    ) -> StoreResult<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO archived_files (request_id, file_path, original_url, expected_type, \
             file_size, content_hash, created_at) VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(request_id)
        .bind(file_path)
        .bind(original_url)
        .bind(expected_type)
        .bind(file_size)
        .bind(content_hash)
        .bind(now_nanos())
        .fetch_one(self.pool())
        .await?;
        Ok(id)
    }

    pub async fn list_archived_files(&self, limit: i64) -> StoreResult<Vec<ArchivedFile>> {
        let rows = sqlx::query(
            "SELECT id, request_id, file_path, original_url, expected_type, file_size, \
             content_hash, created_at FROM archived_files ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(row_to_archived_file).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dictionary_versions_increase_and_latest_wins() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .store_compression_dict("parse", 1, 32, b"dict-v1")
            .await
            .unwrap();
        store
            .store_compression_dict("parse", 2, 64, b"dict-v2")
            .await
            .unwrap();
        let latest = store.latest_compression_dict("parse").await.unwrap().unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.dict_bytes, b"dict-v2");
    }

    #[tokio::test]
    async fn missing_continuation_has_no_dict() {
        let store = Store::open_in_memory().await.unwrap();
        assert!(store
            .latest_compression_dict("never-seen")
            .await
            .unwrap()
            .is_none());
    }
}
