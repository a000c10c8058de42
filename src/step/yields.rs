//! The tagged sum a step's yielded sequence is modelled as (spec §4.4.3, §9):
//! "duck-typed yields become a tagged sum."

use std::collections::HashMap;

use serde_json::Value as Json;

use crate::model::{RequestKind, SpeculationId};

/// A step-requested continuation: either a stable step name, or a step
/// handle carrying the target's own priority for inheritance (spec §4.4.3,
/// §9 "typed handle that is both a name and a priority hint").
#[derive(Debug, Clone)]
pub struct StepHandle {
    pub name: String,
    pub default_priority: i64,
}

/// A child Request a step wants enqueued.
#[derive(Debug, Clone)]
pub struct YieldedRequest {
    pub continuation: StepHandle,
    /// `None` means "inherit the continuation's own priority" (spec §4.4.3);
    /// `Some(p)` where `p` is not the default still inherits (see
    /// `resolve_priority`) only when `p` equals [`crate::model::DEFAULT_PRIORITY`].
    pub priority: Option<i64>,
    pub kind: RequestKind,
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
    pub accumulated_data: Json,
    pub aux_data: Json,
    pub permanent: Json,
    pub dedup_key: Option<String>,
    pub is_speculative: bool,
    pub speculation_id: Option<SpeculationId>,
}

/// A Result (spec §3.1) before deferred validation has run.
#[derive(Debug, Clone)]
pub struct YieldedResult {
    pub result_type: String,
    pub data: ParsedData,
}

/// Either a fully-constructed value, or a deferred-validation bundle of raw
/// fields plus the validator that will run against them (spec §4.4.5).
#[derive(Debug, Clone)]
pub enum ParsedData {
    Valid(Json),
    Deferred { raw: Json, validator: ValidatorRef },
}

/// Identifies which registered validator should check a deferred
/// [`ParsedData`] bundle — the systems-language equivalent of the source's
/// `json_model` dotted name (spec §4.4.1).
#[derive(Debug, Clone)]
pub struct ValidatorRef(pub String);

/// A step's predicted subtree yield (spec §3.1 `Estimate`).
#[derive(Debug, Clone)]
pub struct YieldedEstimate {
    pub expected_types: Vec<String>,
    pub min_count: i64,
    pub max_count: Option<i64>,
}

/// One item from a step's lazy yield sequence (spec §4.4.3, §9).
#[derive(Debug, Clone)]
pub enum Yield {
    Request(YieldedRequest),
    Result(YieldedResult),
    Estimate(YieldedEstimate),
    /// Internal resume signal (spec §4.4.3 item 5) — reserved for
    /// continuation-resumption bookkeeping; no step constructs one directly.
    ResumeSignal,
}

/// Spec §4.4.3: "For every yielded Request whose continuation ... inherits
/// the target step's priority if the yielded request's priority is still
/// the default (9)."
pub fn resolve_priority(requested: Option<i64>, target_default_priority: i64) -> i64 {
    match requested {
        None => target_default_priority,
        Some(p) if p == crate::model::DEFAULT_PRIORITY => target_default_priority,
        Some(p) => p,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_priority_inherits_target() {
        assert_eq!(resolve_priority(None, 3), 3);
        assert_eq!(resolve_priority(Some(9), 3), 3);
    }

    #[test]
    fn explicit_non_default_priority_is_kept() {
        assert_eq!(resolve_priority(Some(1), 3), 1);
    }
}
