//! The Scheduler (spec §4.5): N cooperating worker tasks sharing no
//! in-memory queue — they pull from the Store, which is the only thing
//! coordinating them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::Value as Json;
use thiserror::Error;
use tracing::{info, warn};

use crate::clock::now_nanos;
use crate::codec::{self, CodecError};
use crate::config::Config;
use crate::fetcher::{FetchError, FetchResponse, Fetcher, PreparedRequest};
use crate::model::{ErrorType, NewRequest, Request, SpeculationId, SpeculationSlotKey};
use crate::parser::ParseError;
use crate::rate_limiter::RateLimiter;
use crate::speculation::SpeculationEngine;
use crate::step::{prepare_context, ParsedData, StepError, StepRegistry, Yield};
use crate::store::{NewError, Store, StoreError};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A deferred-validation check (spec §4.4.5): given the raw fields, either
/// the normalised value or the list of validation errors.
pub type ValidatorFn = Arc<dyn Fn(&Json) -> Result<Json, Vec<String>> + Send + Sync>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Step(#[from] StepError),

    #[error(transparent)]
    Speculation(#[from] crate::speculation::SpeculationError),
}

/// Shared, cloneable handle every worker task runs against.
#[derive(Clone)]
pub struct Scheduler {
    store: Store,
    rate_limiter: Arc<RateLimiter>,
    fetcher: Arc<dyn Fetcher>,
    registry: Arc<StepRegistry>,
    speculation: Option<Arc<SpeculationEngine>>,
    validators: Arc<HashMap<String, ValidatorFn>>,
    config: Arc<Config>,
    stop_event: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(
        store: Store,
        rate_limiter: Arc<RateLimiter>,
        fetcher: Arc<dyn Fetcher>,
        registry: Arc<StepRegistry>,
        speculation: Option<Arc<SpeculationEngine>>,
        validators: HashMap<String, ValidatorFn>,
        config: Arc<Config>,
        stop_event: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            rate_limiter,
            fetcher,
            registry,
            speculation,
            validators: Arc::new(validators),
            config,
            stop_event,
        }
    }

    /// Spawns `num_workers` worker tasks and waits for every one to either
    /// drain or observe `stop_event`.
    pub async fn run(&self, num_workers: usize) {
        let mut handles = Vec::with_capacity(num_workers);
        for worker_id in 0..num_workers {
            let worker = self.clone();
            handles.push(tokio::spawn(async move { worker.run_worker(worker_id).await }));
        }
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker task panicked");
            }
        }
    }

    async fn run_worker(&self, worker_id: usize) {
        loop {
            if self.stop_event.load(Ordering::SeqCst) {
                info!(worker_id, "stop_event observed, exiting");
                return;
            }

            match self.store.dequeue_next().await {
                Ok(Some(request)) => {
                    let request_id = request.id;
                    if let Err(e) = self.process_request(request).await {
                        warn!(worker_id, request_id, error = %e, "error processing request");
                    }
                }
                Ok(None) => match self.store.has_outstanding_work().await {
                    Ok(true) => tokio::time::sleep(self.suspend_duration().await).await,
                    Ok(false) => {
                        info!(worker_id, "queue drained, exiting");
                        return;
                    }
                    Err(e) => {
                        warn!(worker_id, error = %e, "has_outstanding_work failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Err(e) => {
                    warn!(worker_id, error = %e, "dequeue_next failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn suspend_duration(&self) -> Duration {
        let poll_cap = Duration::from_millis(200);
        match self.store.next_retry_at().await {
            Ok(Some(at)) => {
                let wait_nanos = (at - now_nanos()).max(0) as u64;
                Duration::from_nanos(wait_nanos).min(poll_cap)
            }
            _ => poll_cap,
        }
    }

    async fn process_request(&self, request: Request) -> Result<(), SchedulerError> {
        let prepared = PreparedRequest {
            method: request.method.clone(),
            url: request.url.clone(),
            headers: request.headers.clone(),
            cookies: request.cookies.clone(),
            body: request.body.clone(),
            timeout: DEFAULT_TIMEOUT,
        };

        self.rate_limiter.acquire().await;
        let outcome = self.fetcher.execute(prepared).await;

        match outcome {
            Ok(response) => {
                self.rate_limiter.on_response(response.status_code, false).await;
                self.handle_success(request, response).await
            }
            Err(FetchError::Transient { status, message }) => {
                self.rate_limiter.on_response(status.unwrap_or(0), false).await;
                self.handle_transient(&request, &message, status).await
            }
            Err(FetchError::Structural { message }) => {
                self.store.mark_failed(request.id, &message).await?;
                self.store
                    .store_error(NewError {
                        request_id: Some(request.id),
                        error_type: Some(ErrorType::Assumption),
                        error_class: "FetcherStructuralFailure".into(),
                        message,
                        request_url: Some(request.url.clone()),
                        ..Default::default()
                    })
                    .await?;
                self.record_speculative_outcome(&request, false).await?;
                Ok(())
            }
            Err(FetchError::Fatal { traceback }) => {
                self.store.mark_failed(request.id, &traceback).await?;
                self.store
                    .store_error(NewError {
                        request_id: Some(request.id),
                        error_type: Some(ErrorType::Fatal),
                        error_class: "FetcherFatalFailure".into(),
                        message: "fetch raised a fatal error".into(),
                        request_url: Some(request.url.clone()),
                        traceback: Some(traceback),
                        ..Default::default()
                    })
                    .await?;
                self.record_speculative_outcome(&request, false).await?;
                Ok(())
            }
        }
    }

    async fn handle_success(&self, request: Request, response: FetchResponse) -> Result<(), SchedulerError> {
        for incidental in &response.incidentals {
            self.store
                .store_incidental_request(
                    request.id,
                    &incidental.resource_type,
                    &incidental.method,
                    &incidental.url,
                    incidental.status_code,
                    incidental.from_cache,
                    incidental.content_size,
                )
                .await?;
        }

        let is_hit = if request.is_speculative {
            let hit = response.status_code >= 200
                && response.status_code < 300
                && self
                    .speculation
                    .as_ref()
                    .map(|e| e.classify_response(&request.continuation, &response))
                    .unwrap_or(true);
            self.record_speculative_outcome(&request, hit).await?;
            Some(hit)
        } else {
            None
        };

        let (compressed, dict_id) =
            codec::compress_response(&self.store, &request.continuation, &response.body_bytes).await?;
        let speculation_outcome = is_hit.map(|hit| {
            if hit {
                crate::model::SpeculationOutcome::Hit
            } else {
                crate::model::SpeculationOutcome::Miss
            }
        });
        self.store
            .store_response(
                request.id,
                response.status_code,
                &response.headers,
                &response.final_url,
                &compressed,
                response.body_bytes.len() as i64,
                dict_id,
                &request.continuation,
                speculation_outcome,
            )
            .await?;

        let descriptor = match self.registry.get(&request.continuation) {
            Some(d) => d.clone(),
            None => {
                let message = format!("no step registered for continuation {}", request.continuation);
                self.store.mark_failed(request.id, &message).await?;
                self.store
                    .store_error(NewError {
                        request_id: Some(request.id),
                        error_type: Some(ErrorType::Fatal),
                        error_class: "UnknownContinuation".into(),
                        message,
                        request_url: Some(request.url.clone()),
                        ..Default::default()
                    })
                    .await?;
                return Ok(());
            }
        };

        let previous_request = match request.parent_request_id {
            Some(parent_id) => self.store.get_request(parent_id).await?,
            None => None,
        };

        let ctx = match prepare_context(&descriptor, &response, &request, previous_request.as_ref(), None) {
            Ok(ctx) => ctx,
            Err(e) => return self.handle_step_error(&request, e).await,
        };

        let yields = match self.registry.invoke(&request.continuation, &ctx) {
            Ok(y) => y,
            Err(e) => return self.handle_step_error(&request, e).await,
        };

        for y in yields {
            self.dispatch_yield(&request, y).await?;
        }

        self.store.mark_completed(request.id).await?;
        Ok(())
    }

    async fn dispatch_yield(&self, parent: &Request, y: Yield) -> Result<(), SchedulerError> {
        match y {
            Yield::Request(yr) => {
                let priority = crate::step::resolve_priority(yr.priority, yr.continuation.default_priority);
                self.store
                    .insert_request(NewRequest {
                        priority,
                        kind: yr.kind,
                        method: yr.method,
                        url: yr.url,
                        headers: yr.headers,
                        cookies: yr.cookies,
                        body: yr.body,
                        continuation: yr.continuation.name,
                        current_location: None,
                        accumulated_data: yr.accumulated_data,
                        aux_data: yr.aux_data,
                        permanent: yr.permanent,
                        dedup_key: yr.dedup_key,
                        parent_request_id: Some(parent.id),
                        is_speculative: yr.is_speculative,
                        speculation_id: yr.speculation_id,
                        not_before: None,
                    })
                    .await?;
            }
            Yield::Result(yr) => {
                let (data, is_valid, validation_errors) = match yr.data {
                    ParsedData::Valid(json) => (json, true, None),
                    ParsedData::Deferred { raw, validator } => match self.validators.get(&validator.0) {
                        Some(check) => match check(&raw) {
                            Ok(normalised) => (normalised, true, None),
                            Err(errors) => (raw, false, Some(Json::Array(errors.into_iter().map(Json::String).collect()))),
                        },
                        None => (
                            raw,
                            false,
                            Some(Json::Array(vec![Json::String(format!("unknown validator {}", validator.0))])),
                        ),
                    },
                };
                self.store
                    .store_result(parent.id, &yr.result_type, data, is_valid, validation_errors)
                    .await?;
            }
            Yield::Estimate(ye) => {
                self.store
                    .store_estimate(parent.id, &ye.expected_types, ye.min_count, ye.max_count)
                    .await?;
            }
            Yield::ResumeSignal => {}
        }
        Ok(())
    }

    async fn handle_step_error(&self, request: &Request, error: StepError) -> Result<(), SchedulerError> {
        match error {
            StepError::Parse(ParseError::Structural {
                selector,
                description,
                expected_min,
                expected_max,
                actual_count,
                sample_text,
            }) => {
                let auto_await = self
                    .registry
                    .get(&request.continuation)
                    .and_then(|d| d.auto_await_timeout_ms);
                if let Some(delay_ms) = auto_await {
                    if request.retry_count < self.config.max_retries {
                        self.store
                            .schedule_retry(
                                request.id,
                                request.cumulative_backoff_ms + delay_ms as i64,
                                delay_ms as i64,
                                &description,
                            )
                            .await?;
                        return Ok(());
                    }
                }
                self.store.mark_failed(request.id, &description).await?;
                self.store
                    .store_error(NewError {
                        request_id: Some(request.id),
                        error_type: Some(ErrorType::Xpath),
                        error_class: "StructuralAssumptionError".into(),
                        message: description,
                        request_url: Some(request.url.clone()),
                        selector: Some(selector),
                        expected_min: Some(expected_min),
                        expected_max,
                        actual_count: Some(actual_count),
                        failed_doc: Some(sample_text),
                        ..Default::default()
                    })
                    .await?;
                self.record_speculative_outcome(request, false).await?;
                Ok(())
            }
            other => {
                let message = other.to_string();
                self.store.mark_failed(request.id, &message).await?;
                self.store
                    .store_error(NewError {
                        request_id: Some(request.id),
                        error_type: Some(ErrorType::Fatal),
                        error_class: "StepRuntimeError".into(),
                        message: message.clone(),
                        request_url: Some(request.url.clone()),
                        traceback: Some(message),
                        ..Default::default()
                    })
                    .await?;
                self.record_speculative_outcome(request, false).await?;
                Ok(())
            }
        }
    }

    /// Spec §4.5 Retry policy, transient branch: exponential-with-jitter
    /// backoff up to `max_retries`/`max_total_backoff`.
    async fn handle_transient(
        &self,
        request: &Request,
        message: &str,
        status: Option<u16>,
    ) -> Result<(), SchedulerError> {
        let delay_ms = backoff_delay_ms(&self.config, request.retry_count);
        let new_cumulative = request.cumulative_backoff_ms + delay_ms;
        let max_total_ms = self.config.max_total_backoff.as_millis() as i64;

        if new_cumulative > max_total_ms || request.retry_count + 1 >= self.config.max_retries {
            self.store.mark_failed(request.id, message).await?;
            self.store
                .store_error(NewError {
                    request_id: Some(request.id),
                    error_type: Some(ErrorType::Transient),
                    error_class: "TransientRetryExhausted".into(),
                    message: message.to_string(),
                    request_url: Some(request.url.clone()),
                    status_code: status.map(|s| s as i64),
                    ..Default::default()
                })
                .await?;
            self.record_speculative_outcome(request, false).await?;
        } else {
            self.store
                .schedule_retry(request.id, new_cumulative, delay_ms, message)
                .await?;
        }
        Ok(())
    }

    async fn record_speculative_outcome(&self, request: &Request, hit: bool) -> Result<(), SchedulerError> {
        if !request.is_speculative {
            return Ok(());
        }
        let (Some(engine), Some(slot_str), Some(seq)) =
            (&self.speculation, &request.speculation_slot, request.speculation_seq)
        else {
            return Ok(());
        };
        let speculation_id = SpeculationId {
            slot: SpeculationSlotKey::parse(slot_str),
            id: seq,
        };
        engine.record_outcome(&self.store, &speculation_id, hit).await?;
        Ok(())
    }
}

/// Spec §4.5: `min(max_backoff, base · 2^retry_count) · (1 + rand(-jitter, jitter))`.
fn backoff_delay_ms(config: &Config, retry_count: u32) -> i64 {
    let base_ms = config.base_delay.as_millis() as f64;
    let max_ms = config.max_backoff_time.as_millis() as f64;
    let raw = (base_ms * 2f64.powi(retry_count.min(32) as i32)).min(max_ms);
    let jitter = config.jitter;
    let factor = if jitter > 0.0 {
        1.0 + rand::thread_rng().gen_range(-jitter..jitter)
    } else {
        1.0
    };
    (raw * factor).max(0.0) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{Capability, StepBuilder};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn scheduler_config() -> Arc<Config> {
        Arc::new(Config::for_test())
    }

    async fn rate_limiter(store: Store) -> Arc<RateLimiter> {
        let config = crate::config::RateLimiterConfig {
            initial_rate: 1000.0,
            min_rate: 0.1,
            max_rate: 2000.0,
            bucket_size: 100.0,
            jitter: 0.0,
        };
        Arc::new(RateLimiter::load(store, &config).await.unwrap())
    }

    #[tokio::test]
    async fn basic_fetch_completes_and_stores_result() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/item"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"v\":1}"))
            .mount(&server)
            .await;

        let store = Store::open_in_memory().await.unwrap();
        let mut registry = StepRegistry::new();
        registry.register(
            StepBuilder::new("parse_item")
                .needs(Capability::Json)
                .build(|ctx| {
                    Ok(vec![Yield::Result(crate::step::YieldedResult {
                        result_type: "item".into(),
                        data: ParsedData::Valid(ctx.json_content.clone().unwrap()),
                    })])
                }),
        );

        let request_id = store
            .insert_request(NewRequest {
                url: format!("{}/item", server.uri()),
                continuation: "parse_item".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let rl = rate_limiter(store.clone()).await;
        let scheduler = Scheduler::new(
            store.clone(),
            rl,
            Arc::new(crate::fetcher::HttpFetcher::new(None).unwrap()),
            Arc::new(registry),
            None,
            HashMap::new(),
            scheduler_config(),
            Arc::new(AtomicBool::new(false)),
        );

        scheduler.run(1).await;

        let request = store.get_request(request_id).await.unwrap().unwrap();
        assert_eq!(request.status, crate::model::RequestStatus::Completed);
        let results = store.list_results(Some("item"), false, 10).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].data_json["v"], 1);
    }

    #[tokio::test]
    async fn transient_failure_retries_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let store = Store::open_in_memory().await.unwrap();
        let mut registry = StepRegistry::new();
        registry.register(StepBuilder::new("parse").build(|_ctx| Ok(vec![])));

        let request_id = store
            .insert_request(NewRequest {
                url: format!("{}/flaky", server.uri()),
                continuation: "parse".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let rl = rate_limiter(store.clone()).await;
        let mut config = Config::for_test();
        config.base_delay = Duration::from_millis(1);
        let scheduler = Scheduler::new(
            store.clone(),
            rl,
            Arc::new(crate::fetcher::HttpFetcher::new(None).unwrap()),
            Arc::new(registry),
            None,
            HashMap::new(),
            Arc::new(config),
            Arc::new(AtomicBool::new(false)),
        );

        scheduler.run(1).await;

        let request = store.get_request(request_id).await.unwrap().unwrap();
        assert_eq!(request.status, crate::model::RequestStatus::Completed);
        assert_eq!(request.retry_count, 1);
    }

    #[tokio::test]
    async fn structural_assumption_error_fails_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html><body></body></html>"))
            .mount(&server)
            .await;

        let store = Store::open_in_memory().await.unwrap();
        let mut registry = StepRegistry::new();
        registry.register(
            StepBuilder::new("parse_page")
                .needs(Capability::Page)
                .build(|ctx| {
                    let page = ctx.page.clone().unwrap();
                    page.query_css(".missing", "required widget", 1, None)?;
                    Ok(vec![])
                }),
        );

        let request_id = store
            .insert_request(NewRequest {
                url: format!("{}/page", server.uri()),
                continuation: "parse_page".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let rl = rate_limiter(store.clone()).await;
        let scheduler = Scheduler::new(
            store.clone(),
            rl,
            Arc::new(crate::fetcher::HttpFetcher::new(None).unwrap()),
            Arc::new(registry),
            None,
            HashMap::new(),
            scheduler_config(),
            Arc::new(AtomicBool::new(false)),
        );

        scheduler.run(1).await;

        let request = store.get_request(request_id).await.unwrap().unwrap();
        assert_eq!(request.status, crate::model::RequestStatus::Failed);
        let errors = store.list_errors(Some(ErrorType::Xpath), false, 10).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].selector.as_deref(), Some(".missing"));
    }

    #[tokio::test]
    async fn parent_child_accumulates_data() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/listing"))
            .respond_with(ResponseTemplate::new(200).set_body_string("listing"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/child"))
            .respond_with(ResponseTemplate::new(200).set_body_string("child"))
            .mount(&server)
            .await;

        let store = Store::open_in_memory().await.unwrap();
        let child_url = format!("{}/child", server.uri());
        let mut registry = StepRegistry::new();
        registry.register(StepBuilder::new("list_page").build({
            let child_url = child_url.clone();
            move |_ctx| {
                Ok(vec![Yield::Request(crate::step::YieldedRequest {
                    continuation: crate::step::StepHandle {
                        name: "parse_child".into(),
                        default_priority: crate::model::DEFAULT_PRIORITY,
                    },
                    priority: None,
                    kind: crate::model::RequestKind::Navigating,
                    method: "GET".into(),
                    url: child_url.clone(),
                    headers: HashMap::new(),
                    cookies: HashMap::new(),
                    body: None,
                    accumulated_data: serde_json::json!({"category": "widgets"}),
                    aux_data: Json::Null,
                    permanent: Json::Null,
                    dedup_key: None,
                    is_speculative: false,
                    speculation_id: None,
                })])
            }
        }));
        registry.register(
            StepBuilder::new("parse_child")
                .needs(Capability::Accumulated)
                .build(|ctx| {
                    Ok(vec![Yield::Result(crate::step::YieldedResult {
                        result_type: "item".into(),
                        data: ParsedData::Valid(ctx.accumulated_data.cloned().unwrap()),
                    })])
                }),
        );

        store
            .insert_request(NewRequest {
                url: format!("{}/listing", server.uri()),
                continuation: "list_page".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let rl = rate_limiter(store.clone()).await;
        let scheduler = Scheduler::new(
            store.clone(),
            rl,
            Arc::new(crate::fetcher::HttpFetcher::new(None).unwrap()),
            Arc::new(registry),
            None,
            HashMap::new(),
            scheduler_config(),
            Arc::new(AtomicBool::new(false)),
        );

        scheduler.run(1).await;

        let results = store.list_results(Some("item"), false, 10).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].data_json["category"], "widgets");
    }
}
