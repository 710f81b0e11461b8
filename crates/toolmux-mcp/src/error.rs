//! MCP error types.
//!
//! Errors are classified so callers can choose between retrying, surfacing
//! the failure, or starting re-authorization without matching on strings.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for MCP operations.
pub type McpResult<T> = Result<T, McpError>;

/// Why a network request never produced an HTTP response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkFailureKind {
    /// Host could not be resolved or reached.
    Unreachable,
    /// The remote end actively refused the connection.
    ConnectionRefused,
    /// The request did not complete in time.
    Timeout,
}

impl fmt::Display for NetworkFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Unreachable => "unreachable",
            Self::ConnectionRefused => "connection refused",
            Self::Timeout => "timeout",
        };
        f.write_str(text)
    }
}

/// Errors that can occur during MCP operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// The server could not be reached.
    #[error("Network failure ({kind}): {message}")]
    NetworkFailure {
        kind: NetworkFailureKind,
        message: String,
    },

    /// The server needs credentials (HTTP 401 or no token configured).
    #[error("Authentication required: {0}")]
    AuthRequired(String),

    /// The user or the authorization server refused the authorization.
    #[error("Authorization denied: {0}")]
    AuthorizationDenied(String),

    /// The credential lacks the required permissions (HTTP 403).
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The endpoint does not exist (HTTP 404).
    #[error("Endpoint not found: {0}")]
    EndpointMissing(String),

    /// The server asked the client to back off (HTTP 429).
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// The server failed internally (HTTP 5xx).
    #[error("Server unavailable ({status}): {message}")]
    ServerUnavailable { status: u16, message: String },

    /// Any other non-success HTTP status.
    #[error("Unexpected HTTP status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    /// The server answered with a JSON-RPC error envelope.
    #[error("Protocol error {code}: {message}")]
    Protocol { code: i64, message: String },

    /// The server answered with something that is not a valid protocol message.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// No response arrived before the request deadline.
    #[error("Request timed out: {method} after {timeout:?}")]
    RequestTimeout { method: String, timeout: Duration },

    /// The underlying channel is gone (process exited, stream closed).
    #[error("Transport closed: {0}")]
    TransportClosed(String),

    /// The server process could not be started.
    #[error("Server process error: {0}")]
    Process(String),

    /// No server is registered under this name.
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    /// The server is not connected and needs an explicit `connect()`.
    #[error("Server not connected: {0}")]
    NotConnected(String),

    /// A tool call failed; `source` holds the underlying cause.
    #[error("Tool execution failed: {tool}: {source}")]
    ToolExecutionFailed {
        tool: String,
        #[source]
        source: Box<McpError>,
    },

    /// A refresh was requested but no refresh token is stored.
    #[error("No refresh token available for {0}")]
    NoRefreshToken(String),

    /// The token endpoint rejected or garbled an exchange or refresh.
    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    /// Invalid or incomplete configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Token cache failure.
    #[error("Token storage error: {0}")]
    Storage(#[from] toolmux_auth::AuthError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl McpError {
    /// Create a protocol error.
    pub fn protocol(code: i64, message: impl Into<String>) -> Self {
        Self::Protocol {
            code,
            message: message.into(),
        }
    }

    /// Create an invalid response error.
    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse(message.into())
    }

    /// Create a transport closed error.
    pub fn transport_closed(message: impl Into<String>) -> Self {
        Self::TransportClosed(message.into())
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Wrap a failure of `tool`.
    pub fn tool_failed(tool: impl Into<String>, source: McpError) -> Self {
        Self::ToolExecutionFailed {
            tool: tool.into(),
            source: Box::new(source),
        }
    }

    /// Map a non-success HTTP status to its semantic cause.
    pub fn from_status(status: u16, url: &str, body: &str) -> Self {
        match status {
            401 => Self::AuthRequired(format!("{url} returned 401 Unauthorized")),
            403 => Self::PermissionDenied(format!("{url} returned 403 Forbidden")),
            404 => Self::EndpointMissing(url.to_string()),
            429 => Self::RateLimited(format!("{url} returned 429 Too Many Requests")),
            500..=599 => Self::ServerUnavailable {
                status,
                message: truncate(body, 200),
            },
            _ => Self::UnexpectedStatus {
                status,
                body: truncate(body, 200),
            },
        }
    }

    /// Classify a failed HTTP request that produced no response.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        let message = err.to_string();

        if err.is_builder() {
            return Self::Config(message);
        }
        if err.is_timeout() {
            return Self::NetworkFailure {
                kind: NetworkFailureKind::Timeout,
                message,
            };
        }
        if err.is_decode() {
            return Self::InvalidResponse(message);
        }

        let kind = match io_error_kind(&err) {
            Some(std::io::ErrorKind::ConnectionRefused) => NetworkFailureKind::ConnectionRefused,
            Some(std::io::ErrorKind::TimedOut) => NetworkFailureKind::Timeout,
            _ => NetworkFailureKind::Unreachable,
        };
        Self::NetworkFailure { kind, message }
    }

    /// Whether this failure needs a human to (re-)authorize.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, Self::AuthRequired(_) | Self::AuthorizationDenied(_))
    }

    /// Whether the same request may succeed if retried later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NetworkFailure { .. }
            | Self::RateLimited(_)
            | Self::ServerUnavailable { .. }
            | Self::RequestTimeout { .. }
            | Self::TransportClosed(_) => true,
            Self::ToolExecutionFailed { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

/// Find the innermost IO error kind behind a request error.
fn io_error_kind(err: &reqwest::Error) -> Option<std::io::ErrorKind> {
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            return Some(io.kind());
        }
        source = inner.source();
    }
    None
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}
