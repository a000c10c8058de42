//! HTTP/fetch error classification feeding the retry policy (spec §4.5, §7).
//!
//! A [`FailureClass`] is what the Scheduler's retry policy actually branches
//! on: transient failures get backed off and retried, everything else is
//! recorded and the Request is failed. [`ErrorCategory`] is the finer-grained
//! label used for metrics and for the `error_class` column on stored Errors.

use std::fmt;

/// Coarse classification driving the Retry Policy (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Network/5xx/408/429/timeout — retried with backoff.
    Transient,
    /// A counted selector violated its contract — failed, not retried by default.
    Structural,
    /// A yielded datum failed model validation — recorded, Request still completes.
    Validation,
    /// Unexpected crash inside a step — failed, traceback recorded.
    Fatal,
}

/// Finer-grained error category, used for metrics labels and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// HTTP 4xx errors (client errors)
    ClientError,
    /// HTTP 5xx errors (server errors)
    ServerError,
    /// Network connectivity errors (DNS, connection refused, reset, etc.)
    NetworkError,
    /// Request timeout errors
    TimeoutError,
    /// TLS/SSL certificate errors
    TlsError,
    /// Other/unknown errors
    OtherError,
}

impl ErrorCategory {
    /// Categorize an HTTP status code.
    ///
    /// Returns `None` for success responses (2xx/3xx).
    pub fn from_status_code(status_code: u16) -> Option<Self> {
        match status_code {
            200..=399 => None,
            400..=499 => Some(ErrorCategory::ClientError),
            500..=599 => Some(ErrorCategory::ServerError),
            _ => Some(ErrorCategory::OtherError),
        }
    }

    /// Categorize a reqwest error.
    pub fn from_reqwest_error(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            ErrorCategory::TimeoutError
        } else if error.is_connect() {
            ErrorCategory::NetworkError
        } else if error.is_request() {
            ErrorCategory::NetworkError
        } else if error.is_body() || error.is_decode() {
            ErrorCategory::NetworkError
        } else if error.is_redirect() {
            ErrorCategory::ClientError
        } else {
            let msg = error.to_string().to_lowercase();
            if msg.contains("certificate") || msg.contains("tls") || msg.contains("ssl") {
                ErrorCategory::TlsError
            } else if msg.contains("timeout") {
                ErrorCategory::TimeoutError
            } else if msg.contains("dns")
                || msg.contains("resolve")
                || msg.contains("connect")
                || msg.contains("connection")
            {
                ErrorCategory::NetworkError
            } else {
                ErrorCategory::OtherError
            }
        }
    }

    /// Prometheus-safe label for this category.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorCategory::ClientError => "client_error",
            ErrorCategory::ServerError => "server_error",
            ErrorCategory::NetworkError => "network_error",
            ErrorCategory::TimeoutError => "timeout_error",
            ErrorCategory::TlsError => "tls_error",
            ErrorCategory::OtherError => "other_error",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ErrorCategory::ClientError => "HTTP 4xx Client Errors",
            ErrorCategory::ServerError => "HTTP 5xx Server Errors",
            ErrorCategory::NetworkError => "Network/Connection Errors",
            ErrorCategory::TimeoutError => "Request Timeout Errors",
            ErrorCategory::TlsError => "TLS/SSL Certificate Errors",
            ErrorCategory::OtherError => "Other/Unknown Errors",
        }
    }

    pub fn all() -> Vec<ErrorCategory> {
        vec![
            ErrorCategory::ClientError,
            ErrorCategory::ServerError,
            ErrorCategory::NetworkError,
            ErrorCategory::TimeoutError,
            ErrorCategory::TlsError,
            ErrorCategory::OtherError,
        ]
    }

    /// Whether a status code in this category is transient per spec §4.5:
    /// "5xx except 501, 408, 429, connection reset, timeout".
    pub fn is_transient_status(status_code: u16) -> bool {
        match status_code {
            501 => false,
            500..=599 => true,
            408 | 429 => true,
            _ => false,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Detailed error information with categorization, used to build a stored `Error` row.
#[derive(Debug, Clone)]
pub struct CategorizedError {
    pub category: ErrorCategory,
    pub status_code: Option<u16>,
    pub message: String,
    pub endpoint: Option<String>,
}

impl CategorizedError {
    pub fn from_status(status_code: u16, message: String, endpoint: Option<String>) -> Option<Self> {
        ErrorCategory::from_status_code(status_code).map(|category| Self {
            category,
            status_code: Some(status_code),
            message,
            endpoint,
        })
    }

    pub fn from_reqwest(error: &reqwest::Error, endpoint: Option<String>) -> Self {
        let category = ErrorCategory::from_reqwest_error(error);
        let status_code = error.status().map(|s| s.as_u16());
        let message = error.to_string();
        Self {
            category,
            status_code,
            message,
            endpoint,
        }
    }

    pub fn new(category: ErrorCategory, message: String) -> Self {
        Self {
            category,
            status_code: None,
            message,
            endpoint: None,
        }
    }

    /// Is this categorized error transient (retryable) per the Retry Policy?
    pub fn is_transient(&self) -> bool {
        match self.category {
            ErrorCategory::TimeoutError | ErrorCategory::NetworkError => true,
            ErrorCategory::ServerError | ErrorCategory::ClientError => self
                .status_code
                .map(ErrorCategory::is_transient_status)
                .unwrap_or(false),
            ErrorCategory::TlsError | ErrorCategory::OtherError => false,
        }
    }
}

impl fmt::Display for CategorizedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(status) = self.status_code {
            write!(f, "[{}] HTTP {}: {}", self.category.label(), status, self.message)
        } else {
            write!(f, "[{}] {}", self.category.label(), self.message)
        }
    }
}
