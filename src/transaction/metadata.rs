//! Request/response metadata and outcome resolution

use serde::Serialize;
use std::collections::BTreeMap;
use std::error::Error;

/// Request metadata captured at transaction start
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RequestMeta {
    pub method: Option<String>,
    pub http_version: Option<String>,
    pub remote_address: Option<String>,
    pub url: UrlMeta,
    /// First value of every header, lowercase names; only when capture is on
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

/// URL parts of the request
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UrlMeta {
    pub protocol: Option<String>,
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub pathname: Option<String>,
    pub search: Option<String>,
}

/// Response metadata recorded at finish
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResponseMeta {
    pub finished: bool,
    pub status_code: Option<u16>,
}

/// Outcome of a transaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    #[default]
    Unknown,
    Success,
    Failure,
}

impl Outcome {
    /// Server-side outcome for an HTTP status: 5xx is a failure
    pub fn from_status(status: u16) -> Self {
        match status {
            100..=499 => Outcome::Success,
            500..=599 => Outcome::Failure,
            _ => Outcome::Unknown,
        }
    }

    /// Label value used in metrics and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Unknown => "unknown",
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        }
    }
}

/// Result code for an HTTP status, `HTTP 2xx` style
pub fn result_for_status(status: u16) -> Option<&'static str> {
    match status {
        100..=199 => Some("HTTP 1xx"),
        200..=299 => Some("HTTP 2xx"),
        300..=399 => Some("HTTP 3xx"),
        400..=499 => Some("HTTP 4xx"),
        500..=599 => Some("HTTP 5xx"),
        _ => None,
    }
}

/// Anything carrying an HTTP status the engine can finish a transaction with
pub trait ResponseStatus {
    fn status_code(&self) -> u16;
}

impl ResponseStatus for u16 {
    fn status_code(&self) -> u16 {
        *self
    }
}

impl ResponseStatus for http::StatusCode {
    fn status_code(&self) -> u16 {
        self.as_u16()
    }
}

impl<B> ResponseStatus for http::Response<B> {
    fn status_code(&self) -> u16 {
        self.status().as_u16()
    }
}

/// Application error observed during request processing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapturedError {
    pub message: String,
    /// Messages of the `source()` chain, outermost first
    pub causes: Vec<String>,
}

impl CapturedError {
    /// Snapshot an error and its source chain
    pub fn from_error(error: &(dyn Error + 'static)) -> Self {
        let mut causes = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }

        Self {
            message: error.to_string(),
            causes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("outer failure")]
    struct Outer {
        #[source]
        inner: std::io::Error,
    }

    #[test]
    fn test_result_for_status() {
        assert_eq!(result_for_status(200), Some("HTTP 2xx"));
        assert_eq!(result_for_status(404), Some("HTTP 4xx"));
        assert_eq!(result_for_status(503), Some("HTTP 5xx"));
        assert_eq!(result_for_status(42), None);
    }

    #[test]
    fn test_outcome_from_status() {
        assert_eq!(Outcome::from_status(200), Outcome::Success);
        assert_eq!(Outcome::from_status(404), Outcome::Success);
        assert_eq!(Outcome::from_status(500), Outcome::Failure);
        assert_eq!(Outcome::from_status(0), Outcome::Unknown);
    }

    #[test]
    fn test_captured_error_chain() {
        let error = Outer {
            inner: std::io::Error::new(std::io::ErrorKind::Other, "disk gone"),
        };

        let captured = CapturedError::from_error(&error);
        assert_eq!(captured.message, "outer failure");
        assert_eq!(captured.causes, vec!["disk gone".to_string()]);
    }

    #[test]
    fn test_outcome_serializes_lowercase() {
        let json = serde_json::to_string(&Outcome::Success).unwrap();
        assert_eq!(json, "\"success\"");
    }
}
