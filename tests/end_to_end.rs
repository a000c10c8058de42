//! End-to-end exercise of the public API: entry seeding through
//! `Driver::run`, a two-step crawl (listing -> detail), and the resulting
//! persisted Results/RunMetadata. Complements the scheduler/speculation unit
//! tests, which exercise individual literal scenarios in isolation.

use std::collections::HashMap;
use std::sync::Arc;

use kent_driver::config::Config;
use kent_driver::fetcher::HttpFetcher;
use kent_driver::lifecycle::{Driver, EntryRegistry};
use kent_driver::model::{NewRequest, RequestKind, RunStatus};
use kent_driver::step::{Capability, ParsedData, StepBuilder, StepRegistry, Yield, YieldedResult};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn listing_to_detail_crawl_completes_and_stores_results() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/listing"))
        .respond_with(ResponseTemplate::new(200).set_body_string("listing page"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/detail/42"))
        .respond_with(ResponseTemplate::new(200).set_body_string("detail page"))
        .mount(&server)
        .await;

    let mut steps = StepRegistry::new();
    let detail_url = format!("{}/detail/42", server.uri());
    steps.register(StepBuilder::new("listing").build({
        let detail_url = detail_url.clone();
        move |_ctx| {
            Ok(vec![Yield::Request(kent_driver::step::YieldedRequest {
                continuation: kent_driver::step::StepHandle {
                    name: "detail".into(),
                    default_priority: kent_driver::model::DEFAULT_PRIORITY,
                },
                priority: None,
                kind: RequestKind::Navigating,
                method: "GET".into(),
                url: detail_url.clone(),
                headers: HashMap::new(),
                cookies: HashMap::new(),
                body: None,
                accumulated_data: json!({"id": 42}),
                aux_data: serde_json::Value::Null,
                permanent: serde_json::Value::Null,
                dedup_key: None,
                is_speculative: false,
                speculation_id: None,
            })])
        }
    }));
    steps.register(
        StepBuilder::new("detail")
            .needs(Capability::Accumulated)
            .build(|ctx| {
                Ok(vec![Yield::Result(YieldedResult {
                    result_type: "item".into(),
                    data: ParsedData::Valid(ctx.accumulated_data.cloned().unwrap()),
                })])
            }),
    );

    let mut entries = EntryRegistry::new();
    let listing_url = format!("{}/listing", server.uri());
    entries.register("crawl_category", move |_params| {
        vec![NewRequest {
            url: listing_url.clone(),
            continuation: "listing".into(),
            ..Default::default()
        }]
    });

    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::for_test();
    config.db_path = dir.path().join("e2e.db");
    config.num_workers = 2;

    let driver = Driver::open(
        Arc::new(config),
        "demo-scraper",
        "0.1.0",
        json!({}),
        steps,
        entries,
        None,
        HashMap::new(),
        Arc::new(HttpFetcher::new(None).unwrap()),
    )
    .await
    .unwrap();

    driver
        .run(Some(vec![("crawl_category".to_string(), serde_json::Value::Null)]))
        .await
        .unwrap();

    let results = driver.store().list_results(Some("item"), false, 10).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].data_json["id"], 42);

    let run_meta = driver.store().get_run_metadata().await.unwrap().unwrap();
    assert_eq!(run_meta.status, RunStatus::Completed);

    let requests = driver.store().list_requests(None, None, 10).await.unwrap();
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|r| r.status == kent_driver::model::RequestStatus::Completed));
}
