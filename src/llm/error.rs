//! Typed LLM errors and retryability classification.

use std::fmt;

/// Broad classification of an LLM failure, used to decide retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    /// Connection failure, timeout, or interrupted stream.
    Network,
    /// HTTP 429 from the backend.
    RateLimited,
    /// HTTP 5xx from the backend.
    Server,
    /// HTTP 4xx other than 429 (bad request, auth, missing model).
    Client,
    /// Malformed chunk or response the client could not interpret.
    Protocol,
}

impl fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LlmErrorKind::Network => "network error",
            LlmErrorKind::RateLimited => "rate limited",
            LlmErrorKind::Server => "server error",
            LlmErrorKind::Client => "client error",
            LlmErrorKind::Protocol => "protocol error",
        };
        f.write_str(s)
    }
}

/// Classify an HTTP status code into an error kind.
pub fn classify_http_status(status: u16) -> LlmErrorKind {
    match status {
        429 => LlmErrorKind::RateLimited,
        500..=599 => LlmErrorKind::Server,
        400..=499 => LlmErrorKind::Client,
        _ => LlmErrorKind::Server,
    }
}

/// An error from the LLM transport.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct LlmError {
    pub kind: LlmErrorKind,
    pub message: String,
    /// HTTP status, when the failure came from a response.
    pub status: Option<u16>,
}

impl LlmError {
    pub fn network(message: impl Into<String>) -> Self {
        LlmError {
            kind: LlmErrorKind::Network,
            message: message.into(),
            status: None,
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        LlmError {
            kind: LlmErrorKind::Protocol,
            message: message.into(),
            status: None,
        }
    }

    /// Build an error from an HTTP status and response body.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        LlmError {
            kind: classify_http_status(status),
            message: body.into(),
            status: Some(status),
        }
    }

    /// Whether a caller should retry the request.
    ///
    /// Transient failures (network, rate limit, 5xx) are retryable; malformed
    /// requests and malformed responses are not — retrying will not fix them.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            LlmErrorKind::Network | LlmErrorKind::RateLimited | LlmErrorKind::Server
        )
    }
}
