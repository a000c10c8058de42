//! Integrity & Stats (spec §4.7): orphan/ghost/estimate checks plus summary
//! stats, all strictly read-only. This is the engine behind the `doctor` and
//! `tree`/`funnel` CLI views.

use serde::Serialize;
use thiserror::Error;

use std::collections::BTreeMap;

use crate::model::SpeculationState;
use crate::store::{
    CompressionStat, ErrorTypeCount, QueueCount, RequestTreeNode, ResultTypeCount, Store, StoreError,
};

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Completed Requests missing a Response, and Response rows missing their
/// Request (spec §4.7 orphan check).
#[derive(Debug, Clone, Default, Serialize)]
pub struct OrphanReport {
    pub completed_without_response: Vec<i64>,
    pub responses_without_request: Vec<i64>,
}

impl OrphanReport {
    pub fn is_clean(&self) -> bool {
        self.completed_without_response.is_empty() && self.responses_without_request.is_empty()
    }
}

/// A completed Request with neither descendants nor a Result (spec §4.7
/// ghost check).
#[derive(Debug, Clone, Serialize)]
pub struct GhostRequest {
    pub request_id: i64,
    pub continuation: String,
}

/// One Estimate checked against the actual subtree yield (spec §4.7 estimate
/// check).
#[derive(Debug, Clone, Serialize)]
pub struct EstimateCheck {
    pub estimate_id: i64,
    pub request_id: i64,
    pub expected_types: Vec<String>,
    pub min_count: i64,
    pub max_count: Option<i64>,
    pub actual_count: i64,
    pub passed: bool,
}

/// Completions observed in the trailing minute/5-minutes/hour, for a crude
/// live throughput signal (spec §4.7 summary stats).
#[derive(Debug, Clone, Serialize)]
pub struct ThroughputWindows {
    pub last_minute: i64,
    pub last_5_minutes: i64,
    pub last_hour: i64,
}

/// The full operator-facing snapshot (spec §4.7 summary stats).
#[derive(Debug, Clone, Serialize)]
pub struct SummaryStats {
    pub queue_counts: Vec<QueueCount>,
    pub throughput: ThroughputWindows,
    pub compression: Vec<CompressionStat>,
    pub result_counts: Vec<ResultTypeCount>,
    pub error_counts: Vec<ErrorTypeCount>,
    pub speculation_progress: Vec<SpeculationState>,
}

/// Runs the orphan check (spec §4.7).
pub async fn check_orphans(store: &Store) -> Result<OrphanReport, IntegrityError> {
    Ok(OrphanReport {
        completed_without_response: store.orphan_completed_requests().await?,
        responses_without_request: store.orphan_responses().await?,
    })
}

/// Runs the ghost check (spec §4.7).
pub async fn check_ghosts(store: &Store) -> Result<Vec<GhostRequest>, IntegrityError> {
    let rows = store.ghost_requests().await?;
    Ok(rows
        .into_iter()
        .map(|(request_id, continuation)| GhostRequest { request_id, continuation })
        .collect())
}

/// Runs the estimate check (spec §4.7): for every stored Estimate, recursively
/// walks `parent_request_id` and counts matching Results across the subtree.
pub async fn check_estimates(store: &Store) -> Result<Vec<EstimateCheck>, IntegrityError> {
    let estimates = store.all_estimates().await?;
    let mut checks = Vec::with_capacity(estimates.len());
    for estimate in estimates {
        let actual_count = store
            .count_results_in_subtree(estimate.request_id, &estimate.expected_types)
            .await?;
        let violates_min = actual_count < estimate.min_count;
        let violates_max = estimate.max_count.is_some_and(|max| actual_count > max);
        checks.push(EstimateCheck {
            estimate_id: estimate.id,
            request_id: estimate.request_id,
            expected_types: estimate.expected_types,
            min_count: estimate.min_count,
            max_count: estimate.max_count,
            actual_count,
            passed: !violates_min && !violates_max,
        });
    }
    Ok(checks)
}

const NANOS_PER_MINUTE: i64 = 60_000_000_000;

/// Builds the summary stats snapshot (spec §4.7). `now_nanos` is the caller's
/// clock reading, so the windows stay testable without a hidden clock call.
pub async fn summary_stats(store: &Store, now_nanos: i64) -> Result<SummaryStats, IntegrityError> {
    let throughput = ThroughputWindows {
        last_minute: store.completions_since(now_nanos - NANOS_PER_MINUTE).await?,
        last_5_minutes: store.completions_since(now_nanos - 5 * NANOS_PER_MINUTE).await?,
        last_hour: store.completions_since(now_nanos - 60 * NANOS_PER_MINUTE).await?,
    };
    Ok(SummaryStats {
        queue_counts: store.queue_counts_by_status_and_continuation().await?,
        throughput,
        compression: store.compression_stats().await?,
        result_counts: store.result_type_counts().await?,
        error_counts: store.error_type_counts().await?,
        speculation_progress: store.load_all_speculation_states().await?,
    })
}

/// A Request and its descendant subtree, for `doctor tree <id>` (supplemented
/// from the original debugger's inspection views, not in spec.md §4.7).
pub async fn request_tree(store: &Store, root_id: i64) -> Result<Vec<RequestTreeNode>, IntegrityError> {
    Ok(store.request_tree(root_id).await?)
}

/// Per-continuation counts at every status, for `doctor funnel` (supplemented
/// from the original debugger's inspection views, not in spec.md §4.7).
#[derive(Debug, Clone, Serialize)]
pub struct FunnelRow {
    pub continuation: String,
    pub pending: i64,
    pub in_progress: i64,
    pub completed: i64,
    pub failed: i64,
    pub held: i64,
}

pub async fn funnel(store: &Store) -> Result<Vec<FunnelRow>, IntegrityError> {
    let counts = store.queue_counts_by_status_and_continuation().await?;
    let mut by_continuation: BTreeMap<String, FunnelRow> = BTreeMap::new();
    for c in counts {
        let row = by_continuation.entry(c.continuation.clone()).or_insert_with(|| FunnelRow {
            continuation: c.continuation.clone(),
            pending: 0,
            in_progress: 0,
            completed: 0,
            failed: 0,
            held: 0,
        });
        match c.status.as_str() {
            "pending" => row.pending = c.count,
            "in_progress" => row.in_progress = c.count,
            "completed" => row.completed = c.count,
            "failed" => row.failed = c.count,
            "held" => row.held = c.count,
            _ => {}
        }
    }
    Ok(by_continuation.into_values().collect())
}
