//! Raw read-only queries backing the integrity checks and doctor views
//! (spec §4.7). Everything here is a SELECT; no row is ever mutated.

use serde::Serialize;
use sqlx::Row;

use crate::model::{ErrorType, Estimate};

use super::{Store, StoreResult};

/// One (status, continuation) queue bucket and its row count.
#[derive(Debug, Clone, Serialize)]
pub struct QueueCount {
    pub status: String,
    pub continuation: String,
    pub count: i64,
}

/// Valid/invalid row counts for one Result type.
#[derive(Debug, Clone, Serialize)]
pub struct ResultTypeCount {
    pub result_type: String,
    pub valid: i64,
    pub invalid: i64,
}

/// Resolved/unresolved row counts for one Error type.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorTypeCount {
    pub error_type: ErrorType,
    pub resolved: i64,
    pub unresolved: i64,
}

/// Original vs. compressed byte totals for one continuation.
#[derive(Debug, Clone, Serialize)]
pub struct CompressionStat {
    pub continuation: String,
    pub responses: i64,
    pub bytes_original: i64,
    pub bytes_compressed: i64,
}

impl Store {
    /// Completed Requests with no matching Response row (spec §4.7 orphan check).
    pub async fn orphan_completed_requests(&self) -> StoreResult<Vec<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT r.id FROM requests r
             LEFT JOIN responses resp ON resp.request_id = r.id
             WHERE r.status = 'completed' AND resp.request_id IS NULL",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(ids)
    }

    /// Response rows whose Request no longer exists (spec §4.7 orphan check).
    /// Should never occur in practice — `responses.request_id` cascades on
    /// delete — but is checked directly rather than assumed.
    pub async fn orphan_responses(&self) -> StoreResult<Vec<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT resp.request_id FROM responses resp
             LEFT JOIN requests r ON r.id = resp.request_id
             WHERE r.id IS NULL",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(ids)
    }

    /// Completed Requests with neither child Requests nor a Result row,
    /// grouped by continuation (spec §4.7 ghost check).
    pub async fn ghost_requests(&self) -> StoreResult<Vec<(i64, String)>> {
        let rows = sqlx::query(
            "SELECT r.id, r.continuation FROM requests r
             WHERE r.status = 'completed'
               AND NOT EXISTS (SELECT 1 FROM requests c WHERE c.parent_request_id = r.id)
               AND NOT EXISTS (SELECT 1 FROM results res WHERE res.request_id = r.id)",
        )
        .fetch_all(self.pool())
        .await?;
        rows.iter()
            .map(|row| Ok((row.try_get("id")?, row.try_get("continuation")?)))
            .collect()
    }

    /// Every stored Estimate, for the closure-walk check driven by
    /// `count_results_in_subtree` (spec §4.7 estimate check).
    pub async fn all_estimates(&self) -> StoreResult<Vec<Estimate>> {
        let rows = sqlx::query(
            "SELECT id, request_id, expected_types_json, min_count, max_count, created_at \
             FROM estimates ORDER BY id ASC",
        )
        .fetch_all(self.pool())
        .await?;
        rows.iter()
            .map(|row| {
                let expected_types: String = row.try_get("expected_types_json")?;
                Ok(Estimate {
                    id: row.try_get("id")?,
                    request_id: row.try_get("request_id")?,
                    expected_types: serde_json::from_str(&expected_types)?,
                    min_count: row.try_get("min_count")?,
                    max_count: row.try_get("max_count")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    /// Queue depth broken down by (status, continuation) (spec §4.7 summary stats).
    pub async fn queue_counts_by_status_and_continuation(&self) -> StoreResult<Vec<QueueCount>> {
        let rows = sqlx::query(
            "SELECT status, continuation, COUNT(*) AS n FROM requests
             GROUP BY status, continuation ORDER BY status, continuation",
        )
        .fetch_all(self.pool())
        .await?;
        rows.iter()
            .map(|row| {
                Ok(QueueCount {
                    status: row.try_get("status")?,
                    continuation: row.try_get("continuation")?,
                    count: row.try_get("n")?,
                })
            })
            .collect()
    }

    /// Number of Requests that completed (successfully or not) at or after
    /// `since_nanos` — the building block for throughput windows.
    pub async fn completions_since(&self, since_nanos: i64) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM requests WHERE completed_at IS NOT NULL AND completed_at >= ?",
        )
        .bind(since_nanos)
        .fetch_one(self.pool())
        .await?;
        Ok(count)
    }

    /// Valid/invalid counts per Result type (spec §4.7 summary stats).
    pub async fn result_type_counts(&self) -> StoreResult<Vec<ResultTypeCount>> {
        let rows = sqlx::query(
            "SELECT result_type,
                    SUM(CASE WHEN is_valid = 1 THEN 1 ELSE 0 END) AS valid,
                    SUM(CASE WHEN is_valid = 0 THEN 1 ELSE 0 END) AS invalid
             FROM results GROUP BY result_type ORDER BY result_type",
        )
        .fetch_all(self.pool())
        .await?;
        rows.iter()
            .map(|row| {
                Ok(ResultTypeCount {
                    result_type: row.try_get("result_type")?,
                    valid: row.try_get("valid")?,
                    invalid: row.try_get("invalid")?,
                })
            })
            .collect()
    }

    /// Resolved/unresolved counts per Error type (spec §4.7 summary stats).
    pub async fn error_type_counts(&self) -> StoreResult<Vec<ErrorTypeCount>> {
        let rows = sqlx::query(
            "SELECT error_type,
                    SUM(CASE WHEN is_resolved = 1 THEN 1 ELSE 0 END) AS resolved,
                    SUM(CASE WHEN is_resolved = 0 THEN 1 ELSE 0 END) AS unresolved
             FROM errors GROUP BY error_type ORDER BY error_type",
        )
        .fetch_all(self.pool())
        .await?;
        rows.iter()
            .map(|row| {
                let error_type: String = row.try_get("error_type")?;
                Ok(ErrorTypeCount {
                    error_type: ErrorType::parse(&error_type).ok_or(super::StoreError::NoSuchRow)?,
                    resolved: row.try_get("resolved")?,
                    unresolved: row.try_get("unresolved")?,
                })
            })
            .collect()
    }

    /// Original vs. compressed byte totals per continuation (spec §4.7 summary stats).
    pub async fn compression_stats(&self) -> StoreResult<Vec<CompressionStat>> {
        let rows = sqlx::query(
            "SELECT continuation, COUNT(*) AS n,
                    SUM(content_size_original) AS bytes_original,
                    SUM(content_size_compressed) AS bytes_compressed
             FROM responses GROUP BY continuation ORDER BY continuation",
        )
        .fetch_all(self.pool())
        .await?;
        rows.iter()
            .map(|row| {
                Ok(CompressionStat {
                    continuation: row.try_get("continuation")?,
                    responses: row.try_get("n")?,
                    bytes_original: row.try_get("bytes_original")?,
                    bytes_compressed: row.try_get("bytes_compressed")?,
                })
            })
            .collect()
    }

    /// A Request and its full descendant subtree, each node annotated with
    /// whether it has a Response and how many Results/Errors it produced
    /// (`doctor tree <id>`, supplemented from the original debugger views).
    pub async fn request_tree(&self, root_id: i64) -> StoreResult<Vec<RequestTreeNode>> {
        let rows = sqlx::query(
            "WITH RECURSIVE subtree(id, parent_request_id, continuation, status, depth) AS (
                SELECT id, parent_request_id, continuation, status, 0
                FROM requests WHERE id = ?
                UNION ALL
                SELECT r.id, r.parent_request_id, r.continuation, r.status, s.depth + 1
                FROM requests r JOIN subtree s ON r.parent_request_id = s.id
             )
             SELECT subtree.id, subtree.parent_request_id, subtree.continuation,
                    subtree.status, subtree.depth,
                    EXISTS(SELECT 1 FROM responses resp WHERE resp.request_id = subtree.id) AS has_response,
                    (SELECT COUNT(*) FROM results res WHERE res.request_id = subtree.id) AS result_count,
                    (SELECT COUNT(*) FROM errors e WHERE e.request_id = subtree.id) AS error_count
             FROM subtree ORDER BY depth, id",
        )
        .bind(root_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter()
            .map(|row| {
                Ok(RequestTreeNode {
                    id: row.try_get("id")?,
                    parent_request_id: row.try_get("parent_request_id")?,
                    depth: row.try_get("depth")?,
                    continuation: row.try_get("continuation")?,
                    status: row.try_get("status")?,
                    has_response: row.try_get::<i64, _>("has_response")? != 0,
                    result_count: row.try_get("result_count")?,
                    error_count: row.try_get("error_count")?,
                })
            })
            .collect()
    }
}

/// One node of a `doctor tree` view: a Request plus a summary of what it produced.
#[derive(Debug, Clone, Serialize)]
pub struct RequestTreeNode {
    pub id: i64,
    pub parent_request_id: Option<i64>,
    pub depth: i64,
    pub continuation: String,
    pub status: String,
    pub has_response: bool,
    pub result_count: i64,
    pub error_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewRequest;

    #[tokio::test]
    async fn ghost_request_has_no_children_or_results() {
        let store = Store::open_in_memory().await.unwrap();
        let id = store
            .insert_request(NewRequest {
                url: "https://x/1".into(),
                continuation: "parse".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        store.mark_completed(id).await.unwrap();

        let ghosts = store.ghost_requests().await.unwrap();
        assert_eq!(ghosts, vec![(id, "parse".to_string())]);

        store
            .store_result(id, "item", serde_json::json!({}), true, None)
            .await
            .unwrap();
        assert!(store.ghost_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn completed_request_without_response_is_orphaned() {
        let store = Store::open_in_memory().await.unwrap();
        let id = store
            .insert_request(NewRequest {
                url: "https://x/1".into(),
                continuation: "parse".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        store.mark_completed(id).await.unwrap();
        assert_eq!(store.orphan_completed_requests().await.unwrap(), vec![id]);

        store
            .store_response(
                id,
                200,
                &std::collections::HashMap::new(),
                "https://x/1",
                b"body",
                4,
                None,
                "parse",
                None,
            )
            .await
            .unwrap();
        assert!(store.orphan_completed_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn queue_counts_group_by_status_and_continuation() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .insert_request(NewRequest {
                url: "https://x/1".into(),
                continuation: "parse".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .insert_request(NewRequest {
                url: "https://x/2".into(),
                continuation: "parse".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let counts = store.queue_counts_by_status_and_continuation().await.unwrap();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[0].count, 2);
        assert_eq!(counts[0].status, "pending");
    }
}
