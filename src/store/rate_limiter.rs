//! Adaptive token-bucket state, persisted so a restart resumes at the rate it
//! left off at rather than re-warming from the configured initial rate
//! (spec §3.1, §4.3).

use sqlx::Row;

use crate::model::RateLimiterState;

use super::{Store, StoreResult};

fn row_to_state(row: &sqlx::sqlite::SqliteRow) -> StoreResult<RateLimiterState> {
    Ok(RateLimiterState {
        tokens: row.try_get("tokens")?,
        rate: row.try_get("rate")?,
        bucket_size: row.try_get("bucket_size")?,
        last_congestion_rate: row.try_get("last_congestion_rate")?,
        jitter: row.try_get("jitter")?,
        last_used_at: row.try_get("last_used_at")?,
        total_acquired: row.try_get("total_acquired")?,
        total_congestion_events: row.try_get("total_congestion_events")?,
    })
}

impl Store {
    pub async fn load_rate_limiter_state(&self) -> StoreResult<Option<RateLimiterState>> {
        let row = sqlx::query(
            "SELECT tokens, rate, bucket_size, last_congestion_rate, jitter, last_used_at, \
             total_acquired, total_congestion_events FROM rate_limiter_state WHERE id = 1",
        )
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(row_to_state).transpose()
    }

    pub async fn save_rate_limiter_state(&self, state: &RateLimiterState) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO rate_limiter_state (
                id, tokens, rate, bucket_size, last_congestion_rate, jitter, last_used_at,
                total_acquired, total_congestion_events
            ) VALUES (1, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                tokens = excluded.tokens,
                rate = excluded.rate,
                bucket_size = excluded.bucket_size,
                last_congestion_rate = excluded.last_congestion_rate,
                jitter = excluded.jitter,
                last_used_at = excluded.last_used_at,
                total_acquired = excluded.total_acquired,
                total_congestion_events = excluded.total_congestion_events",
        )
        .bind(state.tokens)
        .bind(state.rate)
        .bind(state.bucket_size)
        .bind(state.last_congestion_rate)
        .bind(state.jitter)
        .bind(state.last_used_at)
        .bind(state.total_acquired)
        .bind(state.total_congestion_events)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_and_load_round_trips() {
        let store = Store::open_in_memory().await.unwrap();
        assert!(store.load_rate_limiter_state().await.unwrap().is_none());

        let state = RateLimiterState {
            tokens: 3.5,
            rate: 5.0,
            bucket_size: 10.0,
            last_congestion_rate: None,
            jitter: 0.25,
            last_used_at: 1_000,
            total_acquired: 7,
            total_congestion_events: 0,
        };
        store.save_rate_limiter_state(&state).await.unwrap();
        let loaded = store.load_rate_limiter_state().await.unwrap().unwrap();
        assert_eq!(loaded.total_acquired, 7);

        let updated = RateLimiterState {
            rate: 2.5,
            total_congestion_events: 1,
            ..state
        };
        store.save_rate_limiter_state(&updated).await.unwrap();
        let loaded = store.load_rate_limiter_state().await.unwrap().unwrap();
        assert_eq!(loaded.rate, 2.5);
        assert_eq!(loaded.total_congestion_events, 1);
    }
}
