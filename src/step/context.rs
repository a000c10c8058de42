//! Argument injection (spec §4.4.2): prepares exactly the values a step's
//! declared [`Capability`] set asks for.

use serde_json::Value as Json;

use crate::fetcher::FetchResponse;
use crate::model::Request;
use crate::parser::{DefaultParser, PageElement, Parser};

use super::registry::{Capability, StepDescriptor, StepError};

/// The prepared argument bundle passed to a step's invoke closure. Only the
/// fields the step's capability set named are populated; reading an
/// unpopulated field is a scraper-authoring bug the runtime catches at
/// registration/build time via [`StepError::UnsupportedCapability`] rather
/// than at call time (spec §4.4.2: "Unknown parameter names are a fatal
/// scraper-authoring error").
pub struct StepContext<'a> {
    pub response: Option<&'a FetchResponse>,
    pub request: Option<&'a Request>,
    pub previous_request: Option<&'a Request>,
    pub accumulated_data: Option<&'a Json>,
    pub aux_data: Option<&'a Json>,
    pub text: Option<String>,
    pub json_content: Option<Json>,
    pub page: Option<PageElement>,
    pub local_filepath: Option<&'a str>,
}

/// Builds a [`StepContext`] satisfying exactly `descriptor`'s capability set.
pub fn prepare_context<'a>(
    descriptor: &StepDescriptor,
    response: &'a FetchResponse,
    request: &'a Request,
    previous_request: Option<&'a Request>,
    local_filepath: Option<&'a str>,
) -> Result<StepContext<'a>, StepError> {
    let parser = DefaultParser;

    let text = if descriptor.capabilities.contains(&Capability::Text) {
        Some(
            String::from_utf8(response.body_bytes.clone()).map_err(|_| StepError::Authoring {
                step: descriptor.name.clone(),
                message: format!("response body is not valid {}", descriptor.encoding),
            })?,
        )
    } else {
        None
    };

    let json_content = if descriptor.capabilities.contains(&Capability::Json) {
        Some(
            parser
                .parse_json(&response.body_bytes)
                .map_err(StepError::Parse)?,
        )
    } else {
        None
    };

    let page = if descriptor.capabilities.contains(&Capability::Page) {
        Some(
            parser
                .parse_html(&response.body_bytes, &descriptor.encoding)
                .map_err(StepError::Parse)?,
        )
    } else {
        None
    };

    Ok(StepContext {
        response: descriptor.capabilities.contains(&Capability::Response).then_some(response),
        request: descriptor.capabilities.contains(&Capability::Request).then_some(request),
        previous_request: descriptor
            .capabilities
            .contains(&Capability::Previous)
            .then_some(previous_request)
            .flatten(),
        accumulated_data: descriptor
            .capabilities
            .contains(&Capability::Accumulated)
            .then_some(&request.accumulated_data),
        aux_data: descriptor
            .capabilities
            .contains(&Capability::Aux)
            .then_some(&request.aux_data),
        text,
        json_content,
        page,
        local_filepath: descriptor
            .capabilities
            .contains(&Capability::LocalFile)
            .then_some(local_filepath)
            .flatten(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewRequest;
    use crate::step::registry::StepBuilder;
    use std::collections::HashMap;

    fn sample_request() -> Request {
        let new_request = NewRequest {
            url: "https://x/y".into(),
            continuation: "parse".into(),
            accumulated_data: serde_json::json!({"items": ["a"]}),
            ..Default::default()
        };
        Request {
            id: 1,
            status: crate::model::RequestStatus::InProgress,
            priority: new_request.priority,
            queue_counter: 1,
            kind: new_request.kind,
            method: new_request.method,
            url: new_request.url,
            headers: new_request.headers,
            cookies: new_request.cookies,
            body: new_request.body,
            continuation: new_request.continuation,
            current_location: None,
            accumulated_data: new_request.accumulated_data,
            aux_data: new_request.aux_data,
            permanent: new_request.permanent,
            dedup_key: None,
            parent_request_id: None,
            is_speculative: false,
            speculation_slot: None,
            speculation_seq: None,
            retry_count: 0,
            cumulative_backoff_ms: 0,
            next_retry_delay_ms: None,
            last_error: None,
            not_before: None,
            created_at: 0,
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn only_requested_capabilities_are_populated() {
        let descriptor = StepBuilder::new("parse")
            .needs(Capability::Accumulated)
            .needs(Capability::Json)
            .build(|_ctx| Ok(vec![]));
        let request = sample_request();
        let response = FetchResponse {
            status_code: 200,
            headers: HashMap::new(),
            final_url: request.url.clone(),
            body_bytes: br#"{"v":1}"#.to_vec(),
            incidentals: Vec::new(),
        };
        let ctx = prepare_context(&descriptor, &response, &request, None, None).unwrap();
        assert!(ctx.response.is_none());
        assert!(ctx.text.is_none());
        assert_eq!(ctx.accumulated_data.unwrap(), &serde_json::json!({"items": ["a"]}));
        assert_eq!(ctx.json_content.unwrap()["v"], 1);
    }
}
