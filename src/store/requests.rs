//! Request queue operations (spec §4.1): insert, atomic dequeue, terminal
//! transitions, retry scheduling, pause/resume, requeue.
//!
//! The pool behind [`Store`] is capped at one connection (see `Store::open`),
//! which gives every mutating statement here the same serialisation spec
//! §4.1 asks for from "one process-wide coarse lock" — SQLite plus a single
//! connection means there is never a second writer to race against.

use sqlx::{Row, SqlitePool};

use crate::clock::now_nanos;
use crate::model::{NewRequest, Request, RequestKind, RequestStatus};

use super::{json_to_text, map_to_text, text_to_json, text_to_map, Store, StoreError, StoreResult};

fn row_to_request(row: &sqlx::sqlite::SqliteRow) -> StoreResult<Request> {
    let status_str: String = row.try_get("status")?;
    let kind_str: String = row.try_get("kind")?;
    Ok(Request {
        id: row.try_get("id")?,
        status: RequestStatus::parse(&status_str).ok_or(StoreError::NoSuchRow)?,
        priority: row.try_get("priority")?,
        queue_counter: row.try_get("queue_counter")?,
        kind: RequestKind::parse(&kind_str).ok_or(StoreError::NoSuchRow)?,
        method: row.try_get("method")?,
        url: row.try_get("url")?,
        headers: text_to_map(row.try_get::<String, _>("headers_json")?.as_str())?,
        cookies: text_to_map(row.try_get::<String, _>("cookies_json")?.as_str())?,
        body: row.try_get("body")?,
        continuation: row.try_get("continuation")?,
        current_location: row.try_get("current_location")?,
        accumulated_data: text_to_json(row.try_get::<String, _>("accumulated_data_json")?.as_str())?,
        aux_data: text_to_json(row.try_get::<String, _>("aux_data_json")?.as_str())?,
        permanent: text_to_json(row.try_get::<String, _>("permanent_json")?.as_str())?,
        dedup_key: row.try_get("dedup_key")?,
        parent_request_id: row.try_get("parent_request_id")?,
        is_speculative: row.try_get::<i64, _>("is_speculative")? != 0,
        speculation_slot: row.try_get("speculation_slot")?,
        speculation_seq: row.try_get("speculation_seq")?,
        retry_count: row.try_get::<i64, _>("retry_count")? as u32,
        cumulative_backoff_ms: row.try_get("cumulative_backoff_ms")?,
        next_retry_delay_ms: row.try_get("next_retry_delay_ms")?,
        last_error: row.try_get("last_error")?,
        not_before: row.try_get("not_before")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

const SELECT_COLS: &str = "id, status, priority, queue_counter, kind, method, url, headers_json, \
     cookies_json, body, continuation, current_location, accumulated_data_json, aux_data_json, \
     permanent_json, dedup_key, parent_request_id, is_speculative, speculation_slot, \
     speculation_seq, retry_count, cumulative_backoff_ms, next_retry_delay_ms, last_error, \
     not_before, created_at, started_at, completed_at";

impl Store {
    /// Spec §4.1 `insert_request`: assigns the next `queue_counter`; silently
    /// returns the existing id if `dedup_key` collides.
    pub async fn insert_request(&self, fields: NewRequest) -> StoreResult<i64> {
        let mut tx = self.pool().begin().await?;

        if let Some(dedup_key) = &fields.dedup_key {
            let existing: Option<i64> =
                sqlx::query_scalar("SELECT id FROM requests WHERE dedup_key = ?")
                    .bind(dedup_key)
                    .fetch_optional(&mut *tx)
                    .await?;
            if let Some(id) = existing {
                tx.commit().await?;
                return Ok(id);
            }
        }

        let next_counter: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(queue_counter), 0) + 1 FROM requests")
                .fetch_one(&mut *tx)
                .await?;

        let (slot_key, seq) = match &fields.speculation_id {
            Some(sid) => (Some(sid.slot.as_key()), Some(sid.id)),
            None => (None, None),
        };
        let now = now_nanos();

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO requests (
                status, priority, queue_counter, kind, method, url, headers_json, cookies_json,
                body, continuation, current_location, accumulated_data_json, aux_data_json,
                permanent_json, dedup_key, parent_request_id, is_speculative, speculation_slot,
                speculation_seq, retry_count, cumulative_backoff_ms, next_retry_delay_ms,
                last_error, not_before, created_at
            ) VALUES (
                'pending', ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0, NULL, NULL, ?, ?
            ) RETURNING id",
        )
        .bind(fields.priority)
        .bind(next_counter)
        .bind(fields.kind.as_str())
        .bind(&fields.method)
        .bind(&fields.url)
        .bind(map_to_text(&fields.headers)?)
        .bind(map_to_text(&fields.cookies)?)
        .bind(&fields.body)
        .bind(&fields.continuation)
        .bind(&fields.current_location)
        .bind(json_to_text(&fields.accumulated_data))
        .bind(json_to_text(&fields.aux_data))
        .bind(json_to_text(&fields.permanent))
        .bind(&fields.dedup_key)
        .bind(fields.parent_request_id)
        .bind(fields.is_speculative as i64)
        .bind(slot_key)
        .bind(seq)
        .bind(fields.not_before)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(id)
    }

    pub async fn get_request(&self, id: i64) -> StoreResult<Option<Request>> {
        let row = sqlx::query(&format!("SELECT {SELECT_COLS} FROM requests WHERE id = ?"))
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(row_to_request).transpose()
    }

    /// Spec §4.1 `dequeue_next`: atomic select-lowest + transition-to-in_progress.
    pub async fn dequeue_next(&self) -> StoreResult<Option<Request>> {
        let now = now_nanos();
        let row = sqlx::query(&format!(
            "UPDATE requests SET status = 'in_progress', started_at = ?
             WHERE id = (
                 SELECT id FROM requests
                 WHERE status = 'pending' AND (not_before IS NULL OR not_before <= ?)
                 ORDER BY priority ASC, queue_counter ASC
                 LIMIT 1
             )
             RETURNING {SELECT_COLS}"
        ))
        .bind(now)
        .bind(now)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(row_to_request).transpose()
    }

    pub async fn mark_completed(&self, id: i64) -> StoreResult<()> {
        let now = now_nanos();
        let result = sqlx::query(
            "UPDATE requests SET status = 'completed', completed_at = ? WHERE id = ?",
        )
        .bind(now)
        .bind(id)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::RequestNotFound(id));
        }
        Ok(())
    }

    pub async fn mark_failed(&self, id: i64, error: &str) -> StoreResult<()> {
        let now = now_nanos();
        let result = sqlx::query(
            "UPDATE requests SET status = 'failed', completed_at = ?, last_error = ? WHERE id = ?",
        )
        .bind(now)
        .bind(error)
        .bind(id)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::RequestNotFound(id));
        }
        Ok(())
    }

    /// Spec §4.1 `schedule_retry`: re-enqueue as `pending*` with `not_before`
    /// pushed out by `next_delay`.
    pub async fn schedule_retry(
        &self,
        id: i64,
        new_cumulative_backoff_ms: i64,
        next_delay_ms: i64,
        error: &str,
    ) -> StoreResult<()> {
        let now = now_nanos();
        let not_before = now + next_delay_ms * 1_000_000;
        let result = sqlx::query(
            "UPDATE requests SET
                status = 'pending',
                retry_count = retry_count + 1,
                cumulative_backoff_ms = ?,
                next_retry_delay_ms = ?,
                last_error = ?,
                not_before = ?,
                started_at = NULL
             WHERE id = ?",
        )
        .bind(new_cumulative_backoff_ms)
        .bind(next_delay_ms)
        .bind(error)
        .bind(not_before)
        .bind(id)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::RequestNotFound(id));
        }
        Ok(())
    }

    /// Spec §4.1 `pause_step`: bulk `pending -> held` by continuation name.
    pub async fn pause_step(&self, continuation: &str) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE requests SET status = 'held' WHERE continuation = ? AND status = 'pending'",
        )
        .bind(continuation)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Spec §4.1 `resume_step`: bulk `held -> pending` by continuation name.
    pub async fn resume_step(&self, continuation: &str) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE requests SET status = 'pending' WHERE continuation = ? AND status = 'held'",
        )
        .bind(continuation)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Spec §4.1 `requeue_request`: insert a new pending Request copying the
    /// given row's fields, linked via `parent_request_id`. `clear_downstream`
    /// additionally deletes the Results/Response/descendant-Requests rooted
    /// at the original id.
    pub async fn requeue_request(&self, id: i64, clear_downstream: bool) -> StoreResult<i64> {
        let original = self
            .get_request(id)
            .await?
            .ok_or(StoreError::RequestNotFound(id))?;

        let new_id = self
            .insert_request(NewRequest {
                priority: original.priority,
                kind: original.kind,
                method: original.method.clone(),
                url: original.url.clone(),
                headers: original.headers.clone(),
                cookies: original.cookies.clone(),
                body: original.body.clone(),
                continuation: original.continuation.clone(),
                current_location: original.current_location.clone(),
                accumulated_data: original.accumulated_data.clone(),
                aux_data: original.aux_data.clone(),
                permanent: original.permanent.clone(),
                dedup_key: None,
                parent_request_id: Some(id),
                is_speculative: false,
                speculation_id: None,
                not_before: None,
            })
            .await?;

        if clear_downstream {
            self.delete_request_subtree(id).await?;
        }

        Ok(new_id)
    }

    /// Deletes a Request's Results and Response, and recurses into every
    /// descendant Request (cascading the same way). Does not delete `id`
    /// itself — provenance of the requeue root is preserved.
    async fn delete_request_subtree(&self, id: i64) -> StoreResult<()> {
        let children: Vec<i64> =
            sqlx::query_scalar("SELECT id FROM requests WHERE parent_request_id = ?")
                .bind(id)
                .fetch_all(self.pool())
                .await?;
        for child in &children {
            self.delete_request_entirely(*child).await?;
        }
        sqlx::query("DELETE FROM results WHERE request_id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        sqlx::query("DELETE FROM responses WHERE request_id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn delete_request_entirely(&self, id: i64) -> StoreResult<()> {
        let children: Vec<i64> =
            sqlx::query_scalar("SELECT id FROM requests WHERE parent_request_id = ?")
                .bind(id)
                .fetch_all(self.pool())
                .await?;
        for child in &children {
            Box::pin(self.delete_request_entirely(*child)).await?;
        }
        sqlx::query("DELETE FROM requests WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Is any other worker `in_progress`, or does a future-scheduled retry
    /// exist? Used by the Scheduler to decide whether to suspend-and-retry
    /// versus signal drained (spec §4.5 step 2).
    pub async fn has_outstanding_work(&self) -> StoreResult<bool> {
        let in_progress: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM requests WHERE status = 'in_progress'")
                .fetch_one(self.pool())
                .await?;
        if in_progress > 0 {
            return Ok(true);
        }
        let scheduled: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM requests WHERE status = 'pending' AND not_before IS NOT NULL",
        )
        .fetch_one(self.pool())
        .await?;
        Ok(scheduled > 0)
    }

    /// The nearest `not_before` among pending scheduled rows, if any — used
    /// by the Scheduler to bound its suspend-and-retry sleep.
    pub async fn next_retry_at(&self) -> StoreResult<Option<i64>> {
        let value: Option<i64> = sqlx::query_scalar(
            "SELECT MIN(not_before) FROM requests WHERE status = 'pending' AND not_before IS NOT NULL",
        )
        .fetch_one(self.pool())
        .await?;
        Ok(value)
    }

    pub async fn list_requests(
        &self,
        status: Option<RequestStatus>,
        continuation: Option<&str>,
        limit: i64,
    ) -> StoreResult<Vec<Request>> {
        let mut sql = format!("SELECT {SELECT_COLS} FROM requests WHERE 1=1");
        if status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if continuation.is_some() {
            sql.push_str(" AND continuation = ?");
        }
        sql.push_str(" ORDER BY id DESC LIMIT ?");

        let mut query = sqlx::query(&sql);
        if let Some(s) = status {
            query = query.bind(s.as_str());
        }
        if let Some(c) = continuation {
            query = query.bind(c);
        }
        query = query.bind(limit);

        let rows = query.fetch_all(self.pool()).await?;
        rows.iter().map(row_to_request).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SpeculationId;
    use crate::model::SpeculationSlotKey;

    async fn memory_store() -> Store {
        Store::open_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn dedup_key_collision_returns_existing_id() {
        let store = memory_store().await;
        let a = store
            .insert_request(NewRequest {
                url: "https://x/y".into(),
                continuation: "parse".into(),
                dedup_key: Some("k1".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let b = store
            .insert_request(NewRequest {
                url: "https://x/y".into(),
                continuation: "parse".into(),
                dedup_key: Some("k1".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(a, b);
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM requests")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn dequeue_orders_by_priority_then_queue_counter() {
        let store = memory_store().await;
        let low_pri = store
            .insert_request(NewRequest {
                url: "https://x/1".into(),
                continuation: "parse".into(),
                priority: 5,
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .insert_request(NewRequest {
                url: "https://x/2".into(),
                continuation: "parse".into(),
                priority: 9,
                ..Default::default()
            })
            .await
            .unwrap();
        let dequeued = store.dequeue_next().await.unwrap().unwrap();
        assert_eq!(dequeued.id, low_pri);
        assert_eq!(dequeued.status, RequestStatus::InProgress);
    }

    #[tokio::test]
    async fn not_before_in_future_is_not_dequeued() {
        let store = memory_store().await;
        store
            .insert_request(NewRequest {
                url: "https://x/1".into(),
                continuation: "parse".into(),
                not_before: Some(now_nanos() + 3_600_000_000_000),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(store.dequeue_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pause_and_resume_step_round_trip() {
        let store = memory_store().await;
        let id = store
            .insert_request(NewRequest {
                url: "https://x/1".into(),
                continuation: "parse".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(store.pause_step("parse").await.unwrap(), 1);
        assert_eq!(
            store.get_request(id).await.unwrap().unwrap().status,
            RequestStatus::Held
        );
        assert_eq!(store.resume_step("parse").await.unwrap(), 1);
        assert_eq!(
            store.get_request(id).await.unwrap().unwrap().status,
            RequestStatus::Pending
        );
    }

    #[tokio::test]
    async fn pause_resume_on_no_activity_is_a_no_op() {
        let store = memory_store().await;
        assert_eq!(store.pause_step("nonexistent").await.unwrap(), 0);
        assert_eq!(store.resume_step("nonexistent").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn requeue_preserves_parent_request_and_clears_downstream() {
        let store = memory_store().await;
        let root = store
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
                continuation: "parse_child".into(),
                parent_request_id: Some(root),
                ..Default::default()
            })
            .await
            .unwrap();
        store.store_result(root, "dict", serde_json::json!({"v": 1}), true, None).await.unwrap();

        let new_id = store.requeue_request(root, true).await.unwrap();
        assert_ne!(new_id, root);
        let new_row = store.get_request(new_id).await.unwrap().unwrap();
        assert_eq!(new_row.parent_request_id, Some(root));

        let children: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM requests WHERE parent_request_id = ? AND id != ?")
                .bind(root)
                .bind(new_id)
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert_eq!(children, 0);

        let results: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM results WHERE request_id = ?")
            .bind(root)
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(results, 0);
    }

    #[tokio::test]
    async fn speculative_request_carries_slot_and_seq() {
        let store = memory_store().await;
        let id = store
            .insert_request(NewRequest {
                url: "https://x/5".into(),
                continuation: "fetch_case".into(),
                is_speculative: true,
                speculation_id: Some(SpeculationId {
                    slot: SpeculationSlotKey::Simple("fetch_case".into()),
                    id: 5,
                }),
                ..Default::default()
            })
            .await
            .unwrap();
        let row = store.get_request(id).await.unwrap().unwrap();
        assert!(row.is_speculative);
        assert_eq!(row.speculation_slot.as_deref(), Some("fetch_case"));
        assert_eq!(row.speculation_seq, Some(5));
    }
}
