//! The Speculation Engine (spec §4.6): adaptive enumeration over an integer
//! (or year×integer) id space for functions marked as speculative entries.
//!
//! Per-slot state transitions are a small finite-state machine (spec §9):
//! `seeded -> running -> (stopping | extending) -> stopped`. This module
//! drives those transitions exclusively from response outcomes; the only
//! clock-driven aspect (year rollover) operates above slot granularity, by
//! the catalogue of which `SpeculationEntry`s/partitions exist.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

use crate::fetcher::FetchResponse;
use crate::model::{NewRequest, SpeculationId, SpeculationOutcome, SpeculationSlotKey, SpeculationState};
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum SpeculationError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no speculative entry registered for function {0}")]
    UnknownEntry(String),

    #[error("slot {0} has not been seeded yet")]
    UnseededSlot(String),
}

/// Simple mode has one integer parameter and one state slot; Yearly has a
/// `(year, axis)` pair, one slot per `function_name:year`, each of which may
/// be frozen (never extended past its stated upper bound) independently.
pub enum SpeculationMode {
    Simple,
    Yearly { years: Vec<i32>, frozen_years: Vec<i32> },
}

/// A registered speculative entry point (spec §4.6, §9).
pub struct SpeculationEntry {
    pub function_name: String,
    pub mode: SpeculationMode,
    /// Seed for the initial sweep — the last known-good max id.
    pub highest_observed: i64,
    /// `plus`: both the stop threshold and the extension chunk size
    /// (spec §9 Open Question — kept unified per the Open Questions decision
    /// in DESIGN.md, with an unused `plus_override` escape hatch below).
    pub largest_observed_gap: i64,
    /// Escape hatch for separating the extension chunk size from the stop
    /// threshold; nothing in this crate populates it.
    pub plus_override: Option<i64>,
    pub build_request: Arc<dyn Fn(i64, Option<i32>) -> NewRequest + Send + Sync>,
    /// Soft-404 detector (spec §4.6): defaults to "every 2xx is a real hit".
    pub fails_successfully: Arc<dyn Fn(&FetchResponse) -> bool + Send + Sync>,
}

impl SpeculationEntry {
    pub fn plus(&self) -> i64 {
        self.plus_override.unwrap_or(self.largest_observed_gap)
    }

    fn is_frozen(&self, slot: &SpeculationSlotKey) -> bool {
        match (&self.mode, slot) {
            (SpeculationMode::Yearly { frozen_years, .. }, SpeculationSlotKey::Yearly(_, year)) => {
                frozen_years.contains(year)
            }
            _ => false,
        }
    }
}

fn default_fails_successfully() -> Arc<dyn Fn(&FetchResponse) -> bool + Send + Sync> {
    Arc::new(|response| (200..300).contains(&response.status_code))
}

impl SpeculationEntry {
    pub fn simple(
        function_name: impl Into<String>,
        highest_observed: i64,
        largest_observed_gap: i64,
        build_request: impl Fn(i64, Option<i32>) -> NewRequest + Send + Sync + 'static,
    ) -> Self {
        Self {
            function_name: function_name.into(),
            mode: SpeculationMode::Simple,
            highest_observed,
            largest_observed_gap,
            plus_override: None,
            build_request: Arc::new(build_request),
            fails_successfully: default_fails_successfully(),
        }
    }
}

/// Drives seeding and per-slot outcome classification for every registered
/// [`SpeculationEntry`].
#[derive(Default)]
pub struct SpeculationEngine {
    entries: HashMap<String, SpeculationEntry>,
    locks: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl SpeculationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entry: SpeculationEntry) {
        self.entries.insert(entry.function_name.clone(), entry);
    }

    async fn lock_for(&self, slot_key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(slot_key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Spec §4.6 seeding: for each non-stopped slot, sweep `[start, end]`
    /// and insert one speculative Request per id.
    pub async fn seed_all(&self, store: &Store) -> Result<usize, SpeculationError> {
        let mut inserted = 0;
        for name in self.entries.keys().cloned().collect::<Vec<_>>() {
            inserted += self.seed_entry(store, &name).await?;
        }
        Ok(inserted)
    }

    /// Whether `function_name` names a registered speculative entry — the
    /// Lifecycle Driver uses this to route a named seed dispatch to either
    /// an ordinary entry function or this engine (spec §4.8 run step 2).
    pub fn has_entry(&self, function_name: &str) -> bool {
        self.entries.contains_key(function_name)
    }

    /// Seeds just the named entry's partition(s) (spec §4.6 seeding).
    pub async fn seed_entry(&self, store: &Store, function_name: &str) -> Result<usize, SpeculationError> {
        let entry = self
            .entries
            .get(function_name)
            .ok_or_else(|| SpeculationError::UnknownEntry(function_name.to_string()))?;
        let mut inserted = 0;
        match &entry.mode {
            SpeculationMode::Simple => {
                let slot = SpeculationSlotKey::Simple(entry.function_name.clone());
                inserted += self.seed_slot(store, entry, &slot, None).await?;
            }
            SpeculationMode::Yearly { years, .. } => {
                for &year in years {
                    let slot = SpeculationSlotKey::Yearly(entry.function_name.clone(), year);
                    inserted += self.seed_slot(store, entry, &slot, Some(year)).await?;
                }
            }
        }
        Ok(inserted)
    }

    async fn seed_slot(
        &self,
        store: &Store,
        entry: &SpeculationEntry,
        slot: &SpeculationSlotKey,
        year: Option<i32>,
    ) -> Result<usize, SpeculationError> {
        let lock = self.lock_for(&slot.as_key()).await;
        let _guard = lock.lock().await;

        let existing = store.load_speculation_state(slot).await?;
        if existing.as_ref().is_some_and(|s| s.stopped) {
            return Ok(0);
        }

        let current_ceiling = existing.as_ref().map(|s| s.current_ceiling).unwrap_or(0);
        let start = (current_ceiling + 1).max(1);
        let end = entry.highest_observed;
        if start > end {
            return Ok(0);
        }

        for id in start..=end {
            let fields = (entry.build_request)(id, year);
            store
                .insert_request(NewRequest {
                    is_speculative: true,
                    speculation_id: Some(SpeculationId { slot: slot.clone(), id }),
                    ..fields
                })
                .await?;
        }

        let new_state = SpeculationState {
            slot_key: slot.as_key(),
            highest_successful_id: existing.as_ref().map(|s| s.highest_successful_id).unwrap_or(0),
            consecutive_failures: existing.as_ref().map(|s| s.consecutive_failures).unwrap_or(0),
            current_ceiling: end,
            stopped: entry.is_frozen(slot),
        };
        store.save_speculation_state(&new_state).await?;
        Ok((end - start + 1) as usize)
    }

    /// Spec §4.6 success handling: classify a terminal outcome on a
    /// speculative request, update `SpeculationState`, and extend the
    /// ceiling if warranted. `hit` has already folded in both the HTTP
    /// status check and the scraper's `fails_successfully` predicate —
    /// see [`classify_response`].
    pub async fn record_outcome(
        &self,
        store: &Store,
        speculation_id: &SpeculationId,
        hit: bool,
    ) -> Result<SpeculationOutcome, SpeculationError> {
        let entry = self
            .entries
            .get(speculation_id.slot.function_name())
            .ok_or_else(|| SpeculationError::UnknownEntry(speculation_id.slot.function_name().to_string()))?;

        let lock = self.lock_for(&speculation_id.slot.as_key()).await;
        let _guard = lock.lock().await;

        let mut state = store
            .load_speculation_state(&speculation_id.slot)
            .await?
            .ok_or_else(|| SpeculationError::UnseededSlot(speculation_id.slot.as_key()))?;

        if state.stopped {
            store.save_speculation_state(&state).await?;
            return Ok(if hit {
                SpeculationOutcome::Hit
            } else {
                SpeculationOutcome::Miss
            });
        }

        let plus = entry.plus();
        let outcome = if hit {
            state.highest_successful_id = state.highest_successful_id.max(speculation_id.id);
            state.consecutive_failures = 0;
            SpeculationOutcome::Hit
        } else {
            if speculation_id.id > state.highest_successful_id {
                state.consecutive_failures += 1;
            }
            if state.consecutive_failures >= plus {
                state.stopped = true;
            }
            SpeculationOutcome::Miss
        };

        let frozen = entry.is_frozen(&speculation_id.slot);
        if !frozen
            && !state.stopped
            && hit
            && state.current_ceiling - state.highest_successful_id <= plus
            && state.consecutive_failures < plus
        {
            let year = match &speculation_id.slot {
                SpeculationSlotKey::Yearly(_, y) => Some(*y),
                SpeculationSlotKey::Simple(_) => None,
            };
            let new_start = state.current_ceiling + 1;
            let new_end = state.current_ceiling + plus;
            for new_id in new_start..=new_end {
                let fields = (entry.build_request)(new_id, year);
                store
                    .insert_request(NewRequest {
                        is_speculative: true,
                        speculation_id: Some(SpeculationId {
                            slot: speculation_id.slot.clone(),
                            id: new_id,
                        }),
                        ..fields
                    })
                    .await?;
            }
            state.current_ceiling = new_end;
        }

        store.save_speculation_state(&state).await?;
        Ok(outcome)
    }

    /// Spec §4.6: "HTTP 2xx and the scraper's own `fails_successfully`
    /// predicate is true -> hit". Structural/fatal errors on a speculative
    /// request are folded in by the Scheduler as an explicit `hit = false`
    /// call to `record_outcome`, per the Open Questions decision in
    /// DESIGN.md (a structural failure counts as a miss).
    pub fn classify_response(&self, function_name: &str, response: &FetchResponse) -> bool {
        let is_2xx = (200..300).contains(&response.status_code);
        if !is_2xx {
            return false;
        }
        match self.entries.get(function_name) {
            Some(entry) => (entry.fails_successfully)(response),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::{AtomicI64, Ordering};

    fn build_request(_id: i64, _year: Option<i32>) -> NewRequest {
        NewRequest {
            url: "https://x/case".into(),
            continuation: "fetch_case".into(),
            ..Default::default()
        }
    }

    fn response(status: u16) -> FetchResponse {
        FetchResponse {
            status_code: status,
            headers: StdHashMap::new(),
            final_url: "https://x/case".into(),
            body_bytes: Vec::new(),
            incidentals: Vec::new(),
        }
    }

    /// Spec §8 scenario 4: highest_observed=3, largest_observed_gap=2,
    /// 200 for {1,2,3,4}, 404 for {5,6}.
    #[tokio::test]
    async fn speculative_sweep_matches_literal_scenario() {
        let store = Store::open_in_memory().await.unwrap();
        let mut engine = SpeculationEngine::new();
        engine.register(SpeculationEntry::simple("fetch_case", 3, 2, build_request));

        let seeded = engine.seed_all(&store).await.unwrap();
        assert_eq!(seeded, 3);

        let outcomes = [(1, true), (2, true), (3, true), (4, true), (5, false), (6, false)];
        for (id, hit) in outcomes {
            let speculation_id = SpeculationId {
                slot: SpeculationSlotKey::Simple("fetch_case".into()),
                id,
            };
            engine
                .record_outcome(&store, &speculation_id, hit)
                .await
                .unwrap();
        }

        let state = store
            .load_speculation_state(&SpeculationSlotKey::Simple("fetch_case".into()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.highest_successful_id, 4);
        assert_eq!(state.consecutive_failures, 2);
        assert!(state.stopped);

        // 3 seeded (1..=3) + two extensions of `plus` (2) ids each: the hit
        // on id=1 brings current_ceiling - highest_successful_id to exactly
        // `plus`, extending to 5 (ids 4,5); the hit on id=3 does the same
        // again, extending to 7 (ids 6,7).
        let total_requests: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM requests")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(total_requests, 7);
    }

    /// Spec §8 scenario 5: soft-404 — every id is a miss despite 200 OK.
    #[tokio::test]
    async fn soft_404_treated_as_miss_stops_with_no_results() {
        let store = Store::open_in_memory().await.unwrap();
        let mut engine = SpeculationEngine::new();
        let mut entry = SpeculationEntry::simple("fetch_case", 3, 2, build_request);
        entry.fails_successfully = Arc::new(|r| {
            String::from_utf8_lossy(&r.body_bytes) != "Case Not Found"
        });
        engine.register(entry);

        engine.seed_all(&store).await.unwrap();

        let never_seen = AtomicI64::new(0);
        for id in 1..=3 {
            let speculation_id = SpeculationId {
                slot: SpeculationSlotKey::Simple("fetch_case".into()),
                id,
            };
            let resp = response(200);
            let hit = engine.classify_response("fetch_case", &resp);
            assert!(!hit);
            never_seen.fetch_add(1, Ordering::Relaxed);
            engine.record_outcome(&store, &speculation_id, hit).await.unwrap();
        }

        let state = store
            .load_speculation_state(&SpeculationSlotKey::Simple("fetch_case".into()))
            .await
            .unwrap()
            .unwrap();
        assert!(state.stopped);
        assert_eq!(state.highest_successful_id, 0);

        let results: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM results")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(results, 0);
    }

    #[tokio::test]
    async fn frozen_yearly_slot_never_extends() {
        let store = Store::open_in_memory().await.unwrap();
        let mut engine = SpeculationEngine::new();
        engine.register(SpeculationEntry {
            function_name: "fetch_case".into(),
            mode: SpeculationMode::Yearly {
                years: vec![2024],
                frozen_years: vec![2024],
            },
            highest_observed: 2,
            largest_observed_gap: 1,
            plus_override: None,
            build_request: Arc::new(build_request),
            fails_successfully: default_fails_successfully(),
        });
        engine.seed_all(&store).await.unwrap();

        let slot = SpeculationSlotKey::Yearly("fetch_case".into(), 2024);
        let state = store.load_speculation_state(&slot).await.unwrap().unwrap();
        assert!(state.stopped);

        let id = SpeculationId { slot: slot.clone(), id: 2 };
        engine.record_outcome(&store, &id, true).await.unwrap();
        let state = store.load_speculation_state(&slot).await.unwrap().unwrap();
        assert_eq!(state.current_ceiling, 2);
    }
}
