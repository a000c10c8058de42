//! Entity types for the persisted data model (spec §3).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Request lifecycle state (spec §3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Held,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::InProgress => "in_progress",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
            RequestStatus::Held => "held",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "held" => Some(Self::Held),
            _ => None,
        }
    }
}

/// How the response should be stored/processed (spec §3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Navigating,
    NonNavigating,
    Archive,
    Resume,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Navigating => "navigating",
            RequestKind::NonNavigating => "non_navigating",
            RequestKind::Archive => "archive",
            RequestKind::Resume => "resume",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "navigating" => Some(Self::Navigating),
            "non_navigating" => Some(Self::NonNavigating),
            "archive" => Some(Self::Archive),
            "resume" => Some(Self::Resume),
            _ => None,
        }
    }
}

/// The default step priority (spec §3.1, §4.4.1): smaller runs earlier.
pub const DEFAULT_PRIORITY: i64 = 9;

/// A slot key identifying one speculation partition (spec §4.6).
///
/// `Simple(function_name)` or `Yearly(function_name, year)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpeculationSlotKey {
    Simple(String),
    Yearly(String, i32),
}

impl SpeculationSlotKey {
    /// The string form persisted in `speculation_tracking.slot_key`.
    pub fn as_key(&self) -> String {
        match self {
            SpeculationSlotKey::Simple(name) => name.clone(),
            SpeculationSlotKey::Yearly(name, year) => format!("{name}:{year}"),
        }
    }

    pub fn function_name(&self) -> &str {
        match self {
            SpeculationSlotKey::Simple(name) => name,
            SpeculationSlotKey::Yearly(name, _) => name,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.split_once(':') {
            Some((name, year)) => match year.parse::<i32>() {
                Ok(y) => SpeculationSlotKey::Yearly(name.to_string(), y),
                Err(_) => SpeculationSlotKey::Simple(s.to_string()),
            },
            None => SpeculationSlotKey::Simple(s.to_string()),
        }
    }
}

/// The `(function_name, integer)` identity of a speculative request (spec §3.1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeculationId {
    pub slot: SpeculationSlotKey,
    pub id: i64,
}

/// A unit of work (spec §3.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: i64,
    pub status: RequestStatus,
    pub priority: i64,
    pub queue_counter: i64,
    pub kind: RequestKind,
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
    pub continuation: String,
    pub current_location: Option<String>,
    pub accumulated_data: Json,
    pub aux_data: Json,
    pub permanent: Json,
    pub dedup_key: Option<String>,
    pub parent_request_id: Option<i64>,
    pub is_speculative: bool,
    pub speculation_slot: Option<String>,
    pub speculation_seq: Option<i64>,
    pub retry_count: u32,
    pub cumulative_backoff_ms: i64,
    pub next_retry_delay_ms: Option<i64>,
    pub last_error: Option<String>,
    pub not_before: Option<i64>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

/// Fields a caller supplies when enqueuing a new Request; the Store assigns
/// `id`/`queue_counter`/`created_at` (spec §4.1 `insert_request`).
#[derive(Debug, Clone)]
pub struct NewRequest {
    pub priority: i64,
    pub kind: RequestKind,
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
    pub continuation: String,
    pub current_location: Option<String>,
    pub accumulated_data: Json,
    pub aux_data: Json,
    pub permanent: Json,
    pub dedup_key: Option<String>,
    pub parent_request_id: Option<i64>,
    pub is_speculative: bool,
    pub speculation_id: Option<SpeculationId>,
    pub not_before: Option<i64>,
}

impl Default for NewRequest {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            kind: RequestKind::Navigating,
            method: "GET".into(),
            url: String::new(),
            headers: HashMap::new(),
            cookies: HashMap::new(),
            body: None,
            continuation: String::new(),
            current_location: None,
            accumulated_data: Json::Null,
            aux_data: Json::Null,
            permanent: Json::Null,
            dedup_key: None,
            parent_request_id: None,
            is_speculative: false,
            speculation_id: None,
            not_before: None,
        }
    }
}

/// Speculation outcome recorded on a Response (spec §3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeculationOutcome {
    Hit,
    Miss,
}

impl SpeculationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpeculationOutcome::Hit => "hit",
            SpeculationOutcome::Miss => "miss",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hit" => Some(Self::Hit),
            "miss" => Some(Self::Miss),
            _ => None,
        }
    }
}

/// Produced by a successful fetch of a Request (spec §3.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub request_id: i64,
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub final_url: String,
    pub content_compressed: Vec<u8>,
    pub content_size_original: i64,
    pub content_size_compressed: i64,
    pub compression_dict_id: Option<i64>,
    pub continuation: String,
    pub speculation_outcome: Option<SpeculationOutcome>,
    pub created_at: i64,
}

/// An extracted datum yielded by a step (spec §3.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRow {
    pub id: i64,
    pub request_id: Option<i64>,
    pub result_type: String,
    pub data_json: Json,
    pub is_valid: bool,
    pub validation_errors_json: Option<Json>,
    pub created_at: i64,
}

/// A step's predicted subtree yield count (spec §3.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Estimate {
    pub id: i64,
    pub request_id: i64,
    pub expected_types: Vec<String>,
    pub min_count: i64,
    pub max_count: Option<i64>,
    pub created_at: i64,
}

/// Classified failure kinds (spec §3.1, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Xpath,
    Validation,
    Transient,
    Assumption,
    Fatal,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Xpath => "xpath",
            ErrorType::Validation => "validation",
            ErrorType::Transient => "transient",
            ErrorType::Assumption => "assumption",
            ErrorType::Fatal => "fatal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "xpath" => Some(Self::Xpath),
            "validation" => Some(Self::Validation),
            "transient" => Some(Self::Transient),
            "assumption" => Some(Self::Assumption),
            "fatal" => Some(Self::Fatal),
            _ => None,
        }
    }
}

/// A classified failure (spec §3.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRow {
    pub id: i64,
    pub request_id: Option<i64>,
    pub error_type: ErrorType,
    pub error_class: String,
    pub message: String,
    pub request_url: Option<String>,
    pub selector: Option<String>,
    pub expected_min: Option<i64>,
    pub expected_max: Option<i64>,
    pub actual_count: Option<i64>,
    pub model_name: Option<String>,
    pub validation_errors_json: Option<Json>,
    pub failed_doc: Option<String>,
    pub status_code: Option<i64>,
    pub timeout_seconds: Option<f64>,
    pub traceback: Option<String>,
    pub is_resolved: bool,
    pub resolved_at: Option<i64>,
    pub resolution_notes: Option<String>,
    pub created_at: i64,
}

/// Produced when a step marks a request as archival (spec §3.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedFile {
    pub id: i64,
    pub request_id: i64,
    pub file_path: String,
    pub original_url: String,
    pub expected_type: Option<String>,
    pub file_size: i64,
    pub content_hash: String,
    pub created_at: i64,
}

/// Versioned zstd training dictionary (spec §3.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionDict {
    pub id: i64,
    pub continuation: String,
    pub version: i64,
    pub sample_count: i64,
    pub dict_bytes: Vec<u8>,
    pub created_at: i64,
}

/// Persisted per-slot speculation state (spec §3.1, §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeculationState {
    pub slot_key: String,
    pub highest_successful_id: i64,
    pub consecutive_failures: i64,
    pub current_ceiling: i64,
    pub stopped: bool,
}

/// Persisted adaptive token bucket state (spec §3.1, §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterState {
    pub tokens: f64,
    pub rate: f64,
    pub bucket_size: f64,
    pub last_congestion_rate: Option<f64>,
    pub jitter: f64,
    pub last_used_at: i64,
    pub total_acquired: i64,
    pub total_congestion_events: i64,
}

/// Run status (spec §3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Running,
    Completed,
    Interrupted,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Created => "created",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Interrupted => "interrupted",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "interrupted" => Some(Self::Interrupted),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// The single run-metadata row (spec §3.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub scraper_name: String,
    pub scraper_version: String,
    pub status: RunStatus,
    pub invocation_params_json: Json,
    pub base_delay_ms: i64,
    pub jitter: f64,
    pub num_workers: i64,
    pub max_backoff_ms: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub created_at: i64,
}

/// A browser sub-resource fetched while servicing a Request (spec §3.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentalRequest {
    pub id: i64,
    pub parent_request_id: i64,
    pub resource_type: String,
    pub method: String,
    pub url: String,
    pub status_code: Option<u16>,
    pub from_cache: bool,
    pub content_size: Option<i64>,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_status_round_trips() {
        for s in [
            RequestStatus::Pending,
            RequestStatus::InProgress,
            RequestStatus::Completed,
            RequestStatus::Failed,
            RequestStatus::Held,
        ] {
            assert_eq!(RequestStatus::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn speculation_slot_key_formats_simple_and_yearly() {
        let simple = SpeculationSlotKey::Simple("fetch_case".into());
        assert_eq!(simple.as_key(), "fetch_case");

        let yearly = SpeculationSlotKey::Yearly("fetch_case".into(), 2024);
        assert_eq!(yearly.as_key(), "fetch_case:2024");
        assert_eq!(SpeculationSlotKey::parse("fetch_case:2024"), yearly);
        assert_eq!(SpeculationSlotKey::parse("fetch_case"), simple);
    }
}
