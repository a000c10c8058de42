//! Per-slot speculation tracking state (spec §3.1, §4.6).

use sqlx::Row;

use crate::model::{SpeculationSlotKey, SpeculationState};

use super::{Store, StoreResult};

fn row_to_state(row: &sqlx::sqlite::SqliteRow) -> StoreResult<SpeculationState> {
    Ok(SpeculationState {
        slot_key: row.try_get("slot_key")?,
        highest_successful_id: row.try_get("highest_successful_id")?,
        consecutive_failures: row.try_get("consecutive_failures")?,
        current_ceiling: row.try_get("current_ceiling")?,
        stopped: row.try_get::<i64, _>("stopped")? != 0,
    })
}

impl Store {
    pub async fn load_speculation_state(
        &self,
        slot: &SpeculationSlotKey,
    ) -> StoreResult<Option<SpeculationState>> {
        let row = sqlx::query(
            "SELECT slot_key, highest_successful_id, consecutive_failures, current_ceiling, \
             stopped FROM speculation_tracking WHERE slot_key = ?",
        )
        .bind(slot.as_key())
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(row_to_state).transpose()
    }

    pub async fn load_all_speculation_states(&self) -> StoreResult<Vec<SpeculationState>> {
        let rows = sqlx::query(
            "SELECT slot_key, highest_successful_id, consecutive_failures, current_ceiling, \
             stopped FROM speculation_tracking",
        )
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(row_to_state).collect()
    }

    pub async fn save_speculation_state(&self, state: &SpeculationState) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO speculation_tracking (
                slot_key, highest_successful_id, consecutive_failures, current_ceiling, stopped
            ) VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(slot_key) DO UPDATE SET
                highest_successful_id = excluded.highest_successful_id,
                consecutive_failures = excluded.consecutive_failures,
                current_ceiling = excluded.current_ceiling,
                stopped = excluded.stopped",
        )
        .bind(&state.slot_key)
        .bind(state.highest_successful_id)
        .bind(state.consecutive_failures)
        .bind(state.current_ceiling)
        .bind(state.stopped as i64)
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
        let slot = SpeculationSlotKey::Yearly("fetch_case".into(), 2024);
        assert!(store.load_speculation_state(&slot).await.unwrap().is_none());

        let state = SpeculationState {
            slot_key: slot.as_key(),
            highest_successful_id: 10,
            consecutive_failures: 0,
            current_ceiling: 20,
            stopped: false,
        };
        store.save_speculation_state(&state).await.unwrap();
        let loaded = store.load_speculation_state(&slot).await.unwrap().unwrap();
        assert_eq!(loaded.current_ceiling, 20);

        let updated = SpeculationState {
            current_ceiling: 30,
            stopped: true,
            ..state
        };
        store.save_speculation_state(&updated).await.unwrap();
        let loaded = store.load_speculation_state(&slot).await.unwrap().unwrap();
        assert_eq!(loaded.current_ceiling, 30);
        assert!(loaded.stopped);

        let all = store.load_all_speculation_states().await.unwrap();
        assert_eq!(all.len(), 1);
    }
}
