//! Error types for the crud-service client.
//!
//! # Design
//! Every upstream failure (a non-2xx response) is normalized into a single
//! `ResponseError` whose display text is the best message the service gave
//! us. `ResponseError` always reports `UpstreamResponseError` as its source,
//! so callers can ask "did the service reject this?" with
//! `CrudError::is_upstream` instead of matching on message text.
//!
//! Network failures are not normalized: they travel as
//! `CrudError::Transport` with the transport's own error untouched.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::http::HttpResponse;

/// Message used when the service answered with an empty error body.
pub const EMPTY_BODY_MESSAGE: &str = "error body from crud-service is empty";

pub type Result<T> = std::result::Result<T, CrudError>;

/// Errors returned by `CrudClient` operations.
#[derive(Debug, Error)]
pub enum CrudError {
    /// The base URL could not be parsed. No request was attempted.
    #[error("fails to create client: {0}")]
    CreateClient(String),

    /// The request path, query or body could not be encoded.
    #[error("fails to create request: {0}")]
    CreateRequest(String),

    /// The transport failed before a response was received.
    #[error(transparent)]
    Transport(TransportError),

    /// The service answered with a non-2xx status.
    #[error(transparent)]
    Response(#[from] ResponseError),

    /// A body could not be decoded from JSON.
    #[error(transparent)]
    Decode(#[from] serde_json::Error),

    /// A bulk-patch filter did not follow the `_q` encoding.
    #[error(transparent)]
    MalformedFilter(#[from] MalformedFilterError),

    /// A `MockCrud` operation was called without a configured result.
    #[error("no result configured for {0}")]
    NotConfigured(&'static str),
}

impl CrudError {
    /// True when the error chain contains `UpstreamResponseError`.
    pub fn is_upstream(&self) -> bool {
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            if err.is::<UpstreamResponseError>() {
                return true;
            }
            source = err.source();
        }
        false
    }

    pub fn as_response(&self) -> Option<&ResponseError> {
        match self {
            CrudError::Response(err) => Some(err),
            _ => None,
        }
    }

    /// Status code of the upstream response, if this is an upstream error.
    pub fn status_code(&self) -> Option<u16> {
        self.as_response().map(|err| err.status_code)
    }
}

/// Sentinel every `ResponseError` chains to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("upstream response error")]
pub struct UpstreamResponseError;

/// Failure reported by a `Transport`.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A complete exchange whose status was not 2xx.
    #[error("crud-service responded with status {}", .0.status)]
    Status(HttpResponse),

    /// Connection, timeout or I/O failure.
    #[error(transparent)]
    Network(Box<dyn std::error::Error + Send + Sync>),
}

impl From<ureq::Error> for TransportError {
    fn from(err: ureq::Error) -> Self {
        TransportError::Network(Box::new(err))
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Network(Box::new(err))
    }
}

/// JSON error body as produced by the crud service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrudErrorResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Kept wide: the service does not bound it to HTTP status values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A non-2xx response from the crud service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseError {
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    /// Parsed JSON body; default when the body was not JSON or was empty.
    pub body: CrudErrorResponse,
    pub raw: Vec<u8>,
}

impl ResponseError {
    /// Parsed `message`, else the raw body, else `EMPTY_BODY_MESSAGE`.
    pub fn message(&self) -> Cow<'_, str> {
        if let Some(message) = self.body.message.as_deref().filter(|m| !m.is_empty()) {
            return Cow::Borrowed(message);
        }
        if !self.raw.is_empty() {
            return String::from_utf8_lossy(&self.raw);
        }
        Cow::Borrowed(EMPTY_BODY_MESSAGE)
    }
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

impl std::error::Error for ResponseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&UpstreamResponseError)
    }
}

/// Decoding failures of a bulk-patch filter.
#[derive(Debug, Error)]
pub enum MalformedFilterError {
    #[error("bulk filter is not a JSON object: {0}")]
    NotAnObject(#[source] serde_json::Error),

    #[error("bulk filter `_q` is not a JSON string")]
    QueryNotString,

    #[error("bulk filter `_q` is not valid JSON: {0}")]
    InvalidQuery(#[source] serde_json::Error),

    #[error("bulk filter field `{0}` is not a string")]
    FieldNotString(String),
}

/// Classify a transport failure.
///
/// Only `TransportError::Status` is normalized; anything else is returned
/// unchanged. A JSON error body that fails to decode surfaces as
/// `CrudError::Decode`.
pub fn normalize(err: TransportError) -> CrudError {
    let response = match err {
        TransportError::Status(response) => response,
        other => return CrudError::Transport(other),
    };

    let is_json = response
        .header("content-type")
        .is_some_and(|value| value.starts_with("application/json"));

    let mut body = CrudErrorResponse::default();
    if is_json && !response.body.is_empty() {
        body = match serde_json::from_slice(&response.body) {
            Ok(body) => body,
            Err(err) => return CrudError::Decode(err),
        };
    }

    let err = ResponseError {
        status_code: response.status,
        headers: response.headers,
        body,
        raw: response.body,
    };
    tracing::warn!(status = err.status_code, message = %err, "crud-service returned an error");
    CrudError::Response(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn json_failure() -> HttpResponse {
        HttpResponse {
            status: 500,
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: br#"{"message":"Some message","statusCode":500,"error":"my error"}"#.to_vec(),
        }
    }

    fn with_content_type(mut response: HttpResponse, value: Option<&str>) -> HttpResponse {
        response.headers.clear();
        if let Some(value) = value {
            response.headers.push(("Content-Type".to_string(), value.to_string()));
        }
        response
    }

    #[test]
    fn json_body_is_parsed_and_chained_to_sentinel() {
        let err = normalize(TransportError::Status(json_failure()));

        assert!(err.is_upstream());
        assert_eq!(err.to_string(), "Some message");
        let response = err.as_response().unwrap();
        assert_eq!(response.status_code, 500);
        assert_eq!(
            response.body,
            CrudErrorResponse {
                message: Some("Some message".to_string()),
                status_code: Some(500),
                error: Some("my error".to_string()),
            }
        );
        assert_eq!(response.raw, json_failure().body);
    }

    #[test]
    fn content_type_parameters_are_ignored() {
        let response = with_content_type(json_failure(), Some("application/json; charset=utf-8"));
        let err = normalize(TransportError::Status(response));

        assert_eq!(err.to_string(), "Some message");
        assert_eq!(err.as_response().unwrap().body.error.as_deref(), Some("my error"));
    }

    #[test]
    fn invalid_json_body_is_a_decode_error() {
        let mut response = json_failure();
        response.body = br#"{"invalid json"}"#.to_vec();

        let err = normalize(TransportError::Status(response));
        assert!(matches!(err, CrudError::Decode(_)));
        assert!(!err.is_upstream());
    }

    #[test]
    fn html_body_is_used_verbatim() {
        let mut response = with_content_type(json_failure(), Some("text/html"));
        response.body = b"a raw message".to_vec();

        let err = normalize(TransportError::Status(response));
        assert!(err.is_upstream());
        assert_eq!(err.to_string(), "a raw message");
        assert_eq!(err.as_response().unwrap().body, CrudErrorResponse::default());
    }

    #[test]
    fn missing_content_type_uses_raw_body() {
        let mut response = with_content_type(json_failure(), None);
        response.body = b"a raw message".to_vec();

        let err = normalize(TransportError::Status(response));
        assert_eq!(err.to_string(), "a raw message");
        assert_eq!(err.as_response().unwrap().body, CrudErrorResponse::default());
    }

    #[test]
    fn content_type_prefix_is_case_sensitive() {
        let mut response = with_content_type(json_failure(), Some("Application/JSON"));
        response.body = br#"{"message":"ignored"}"#.to_vec();

        let err = normalize(TransportError::Status(response));
        assert_eq!(err.to_string(), r#"{"message":"ignored"}"#);
    }

    #[test]
    fn empty_body_with_json_content_type() {
        let mut response = json_failure();
        response.body.clear();

        let err = normalize(TransportError::Status(response));
        assert!(err.is_upstream());
        assert_eq!(err.to_string(), EMPTY_BODY_MESSAGE);
    }

    #[test]
    fn empty_body_without_content_type() {
        let mut response = with_content_type(json_failure(), None);
        response.body.clear();

        let err = normalize(TransportError::Status(response));
        assert_eq!(err.to_string(), "error body from crud-service is empty");
    }

    #[test]
    fn json_body_without_message_falls_back_to_raw() {
        let mut response = json_failure();
        response.body = br#"{"statusCode":502,"error":"Bad Gateway"}"#.to_vec();

        let err = normalize(TransportError::Status(response));
        assert_eq!(err.to_string(), r#"{"statusCode":502,"error":"Bad Gateway"}"#);
        assert_eq!(err.as_response().unwrap().body.status_code, Some(502));
    }

    #[test]
    fn out_of_range_status_code_keeps_message() {
        let mut response = json_failure();
        response.body = br#"{"message":"boom","statusCode":70000}"#.to_vec();

        let err = normalize(TransportError::Status(response));
        assert!(err.is_upstream());
        assert_eq!(err.to_string(), "boom");
        assert_eq!(err.as_response().unwrap().body.status_code, Some(70000));
    }

    #[test]
    fn network_errors_pass_through() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "deadline exceeded");
        let err = normalize(TransportError::from(io));

        assert!(matches!(err, CrudError::Transport(TransportError::Network(_))));
        assert_eq!(err.to_string(), "deadline exceeded");
        assert!(!err.is_upstream());
    }

    #[test]
    fn status_code_is_exposed() {
        let err = normalize(TransportError::Status(json_failure()));
        assert_eq!(err.status_code(), Some(500));
        assert_eq!(CrudError::NotConfigured("list").status_code(), None);
    }
}
