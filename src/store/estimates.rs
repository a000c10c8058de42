//! Estimate rows: a step's predicted subtree yield count (spec §3.1, §4.7).

use sqlx::Row;

use crate::clock::now_nanos;
use crate::model::Estimate;

use super::{Store, StoreResult};

fn row_to_estimate(row: &sqlx::sqlite::SqliteRow) -> StoreResult<Estimate> {
    let expected_types: String = row.try_get("expected_types_json")?;
    Ok(Estimate {
        id: row.try_get("id")?,
        request_id: row.try_get("request_id")?,
        expected_types: serde_json::from_str(&expected_types)?,
        min_count: row.try_get("min_count")?,
        max_count: row.try_get("max_count")?,
        created_at: row.try_get("created_at")?,
    })
}

impl Store {
    pub async fn store_estimate(
        &self,
        request_id: i64,
        expected_types: &[String],
        min_count: i64,
        max_count: Option<i64>,
    ) -> StoreResult<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO estimates (request_id, expected_types_json, min_count, max_count, \
             created_at) VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(request_id)
        .bind(serde_json::to_string(expected_types)?)
        .bind(min_count)
        .bind(max_count)
        .bind(now_nanos())
        .fetch_one(self.pool())
        .await?;
        Ok(id)
    }

    pub async fn estimates_for_request(&self, request_id: i64) -> StoreResult<Vec<Estimate>> {
        let rows = sqlx::query(
            "SELECT id, request_id, expected_types_json, min_count, max_count, created_at \
             FROM estimates WHERE request_id = ?",
        )
        .bind(request_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(row_to_estimate).collect()
    }

    /// Count of actual results of any of `expected_types` produced anywhere
    /// in the subtree rooted at `request_id` (walked through `parent_request_id`),
    /// for the integrity check in spec §4.7.
    pub async fn count_results_in_subtree(
        &self,
        request_id: i64,
        expected_types: &[String],
    ) -> StoreResult<i64> {
        let descendants = self.subtree_request_ids(request_id).await?;
        if descendants.is_empty() || expected_types.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; descendants.len()].join(",");
        let type_placeholders = vec!["?"; expected_types.len()].join(",");
        let sql = format!(
            "SELECT COUNT(*) FROM results WHERE request_id IN ({placeholders}) \
             AND result_type IN ({type_placeholders})"
        );
        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        for id in &descendants {
            query = query.bind(id);
        }
        for t in expected_types {
            query = query.bind(t);
        }
        Ok(query.fetch_one(self.pool()).await?)
    }

    async fn subtree_request_ids(&self, root: i64) -> StoreResult<Vec<i64>> {
        let mut frontier = vec![root];
        let mut all = vec![root];
        while !frontier.is_empty() {
            let placeholders = vec!["?"; frontier.len()].join(",");
            let sql =
                format!("SELECT id FROM requests WHERE parent_request_id IN ({placeholders})");
            let mut query = sqlx::query_scalar::<_, i64>(&sql);
            for id in &frontier {
                query = query.bind(id);
            }
            let children = query.fetch_all(self.pool()).await?;
            all.extend(children.iter().copied());
            frontier = children;
        }
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewRequest;

    #[tokio::test]
    async fn estimate_closure_walks_grandchildren() {
        let store = Store::open_in_memory().await.unwrap();
        let root = store
            .insert_request(NewRequest {
                url: "https://x/listing".into(),
                continuation: "list".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .store_estimate(root, &["item".to_string()], 2, Some(2))
            .await
            .unwrap();

        let child = store
            .insert_request(NewRequest {
                url: "https://x/item/1".into(),
                continuation: "item".into(),
                parent_request_id: Some(root),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .store_result(child, "item", serde_json::json!({}), true, None)
            .await
            .unwrap();

        let grandchild = store
            .insert_request(NewRequest {
                url: "https://x/item/2".into(),
                continuation: "item".into(),
                parent_request_id: Some(child),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .store_result(grandchild, "item", serde_json::json!({}), true, None)
            .await
            .unwrap();

        let count = store
            .count_results_in_subtree(root, &["item".to_string()])
            .await
            .unwrap();
        assert_eq!(count, 2);
    }
}
