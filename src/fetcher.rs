//! The Fetcher contract (spec §6.1) — the one external collaborator the
//! Scheduler depends on. This module ships exactly one concrete
//! implementation, [`HttpFetcher`], so the crate is runnable end to end;
//! browser-driven fetching is a Non-goal (spec §1) left to other impls of
//! [`Fetcher`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};

use crate::model::IncidentalRequest;

/// A request ready to go over the wire, built from a dequeued [`crate::model::Request`].
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
    pub timeout: Duration,
}

/// A successful fetch (spec §6.1).
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub final_url: String,
    pub body_bytes: Vec<u8>,
    /// Sub-resources fetched incidentally, browser-driven implementations
    /// only (spec §3.1 `IncidentalRequest`). Always empty for [`HttpFetcher`].
    pub incidentals: Vec<IncidentalRequest>,
}

/// The three failure shapes a Fetcher may report (spec §6.1), distinct from
/// [`crate::errors::FailureClass`] which is the Scheduler's own retry-policy
/// taxonomy applied once one of these reaches it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("transient fetch failure: {message}")]
    Transient {
        status: Option<u16>,
        message: String,
    },

    #[error("structural fetch failure: {message}")]
    Structural { message: String },

    #[error("fatal fetch failure: {traceback}")]
    Fatal { traceback: String },
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn execute(&self, request: PreparedRequest) -> Result<FetchResponse, FetchError>;
}

/// `reqwest`-backed [`Fetcher`]. No browser automation, no incidentals —
/// browser-driven fetching is out of scope (spec §1 Non-goals).
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(user_agent: Option<&str>) -> Result<Self, reqwest::Error> {
        let mut builder = Client::builder().cookie_store(true);
        if let Some(ua) = user_agent {
            builder = builder.user_agent(ua.to_string());
        }
        Ok(Self {
            client: builder.build()?,
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn execute(&self, request: PreparedRequest) -> Result<FetchResponse, FetchError> {
        let method = Method::from_bytes(request.method.as_bytes()).map_err(|e| FetchError::Fatal {
            traceback: format!("invalid HTTP method {:?}: {e}", request.method),
        })?;

        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if !request.cookies.is_empty() {
            let cookie_header = request
                .cookies
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; ");
            builder = builder.header("Cookie", cookie_header);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| classify_reqwest_error(&e))?;

        let status_code = response.status().as_u16();
        let final_url = response.url().to_string();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let body_bytes = response
            .bytes()
            .await
            .map_err(|e| classify_reqwest_error(&e))?
            .to_vec();

        if crate::errors::ErrorCategory::is_transient_status(status_code) {
            return Err(FetchError::Transient {
                status: Some(status_code),
                message: format!("HTTP {status_code}"),
            });
        }

        Ok(FetchResponse {
            status_code,
            headers,
            final_url,
            body_bytes,
            incidentals: Vec::new(),
        })
    }
}

fn classify_reqwest_error(error: &reqwest::Error) -> FetchError {
    let status = error.status().map(|s| s.as_u16());
    if error.is_timeout() || error.is_connect() {
        return FetchError::Transient {
            status,
            message: error.to_string(),
        };
    }
    FetchError::Transient {
        status,
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn successful_fetch_returns_body_and_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(None).unwrap();
        let response = fetcher
            .execute(PreparedRequest {
                method: "GET".into(),
                url: format!("{}/ok", server.uri()),
                headers: HashMap::new(),
                cookies: HashMap::new(),
                body: None,
                timeout: Duration::from_secs(5),
            })
            .await
            .unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body_bytes, b"hello");
    }

    #[tokio::test]
    async fn server_error_surfaces_as_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/down"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(None).unwrap();
        let result = fetcher
            .execute(PreparedRequest {
                method: "GET".into(),
                url: format!("{}/down", server.uri()),
                headers: HashMap::new(),
                cookies: HashMap::new(),
                body: None,
                timeout: Duration::from_secs(5),
            })
            .await;
        assert!(matches!(result, Err(FetchError::Transient { status: Some(503), .. })));
    }

    #[tokio::test]
    async fn not_implemented_is_not_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ni"))
            .respond_with(ResponseTemplate::new(501))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(None).unwrap();
        let result = fetcher
            .execute(PreparedRequest {
                method: "GET".into(),
                url: format!("{}/ni", server.uri()),
                headers: HashMap::new(),
                cookies: HashMap::new(),
                body: None,
                timeout: Duration::from_secs(5),
            })
            .await
            .unwrap();
        assert_eq!(result.status_code, 501);
    }
}
