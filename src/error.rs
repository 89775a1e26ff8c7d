//! Error types for the connector.
//!
//! Driver failures, I/O failures and raw message strings are converted into
//! [`ConnectorError`] once, at the boundary where they are produced. Each
//! error carries an [`ErrorKind`] used by the retry policy. The host only
//! ever sees a [`HostError`]: the flattened, single-line message.

use crate::constants::TRANSIENT_ERROR_SIGNATURES;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use thiserror::Error;

/// Classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or incomplete configuration. Never retried.
    Configuration,
    /// Network, timeout or deadlock failure. Retried per policy.
    TransientConnection,
    /// Any other failure reported by the server or driver. Never retried.
    FatalQuery,
    /// Failure while closing a connection. Logged, never surfaced in place
    /// of the original error.
    ResourceCleanup,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Configuration => write!(f, "configuration"),
            ErrorKind::TransientConnection => write!(f, "transient"),
            ErrorKind::FatalQuery => write!(f, "fatal"),
            ErrorKind::ResourceCleanup => write!(f, "cleanup"),
        }
    }
}

/// Domain errors raised inside the connector.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection error
    #[error("{message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Error reported by the server or while decoding its response
    #[error("{message}")]
    Query { message: String, code: Option<u32> },

    /// Operation exceeded its configured timeout
    #[error("Timeout: {operation} exceeded {millis} ms")]
    Timeout { operation: String, millis: u64 },

    /// Failure while closing a connection
    #[error("Failed to close connection: {0}")]
    Cleanup(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConnectorError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a connection error with a source.
    pub fn connection_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a query execution error.
    pub fn query_error(msg: impl Into<String>) -> Self {
        Self::Query {
            message: msg.into(),
            code: None,
        }
    }

    /// Create a query execution error carrying a SQL Server error number.
    pub fn query_error_with_code(msg: impl Into<String>, code: u32) -> Self {
        Self::Query {
            message: msg.into(),
            code: Some(code),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, millis: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            millis,
        }
    }

    /// Create a cleanup error.
    pub fn cleanup(msg: impl Into<String>) -> Self {
        Self::Cleanup(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Wrap a raw failure message coming from the driver layer.
    ///
    /// The kind is derived from the message itself.
    pub fn from_message(msg: impl Into<String>) -> Self {
        Self::query_error(msg)
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Configuration,
            Self::Cleanup(_) => ErrorKind::ResourceCleanup,
            Self::Timeout { .. } => ErrorKind::TransientConnection,
            Self::Query {
                code: Some(code), ..
            } if is_transient_sql_error(*code) => ErrorKind::TransientConnection,
            other if has_transient_signature(&other.to_string()) => {
                ErrorKind::TransientConnection
            }
            _ => ErrorKind::FatalQuery,
        }
    }

    /// Check if this error is transient and may succeed on retry.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::TransientConnection
    }
}

/// Check whether a message contains one of the transient failure signatures.
pub fn has_transient_signature(message: &str) -> bool {
    let message = message.to_lowercase();
    TRANSIENT_ERROR_SIGNATURES
        .iter()
        .any(|signature| message.contains(signature))
}

/// Check if a SQL Server error number indicates a transient error.
fn is_transient_sql_error(code: u32) -> bool {
    matches!(
        code,
        1205    // Deadlock
        | 10053 // Connection forcibly closed
        | 10054 // Connection reset
        | 10060 // Connection timed out
        | 40197 // Azure: service error
        | 40501 // Azure: service busy
        | 40613 // Azure: database unavailable
        | 49918 // Azure: not enough resources
        | 49919 // Azure: too many requests
        | 49920 // Azure: too busy
    )
}

fn io_error(kind: std::io::ErrorKind, detail: &str) -> ConnectorError {
    use std::io::ErrorKind;

    let message = match kind {
        ErrorKind::ConnectionRefused => format!("Connection refused: {detail}"),
        ErrorKind::ConnectionReset => format!("Connection reset: {detail}"),
        ErrorKind::ConnectionAborted => format!("Connection aborted: {detail}"),
        ErrorKind::NotConnected => format!("Connection lost: {detail}"),
        ErrorKind::BrokenPipe => format!("Broken pipe: {detail}"),
        ErrorKind::UnexpectedEof => format!("Connection lost: {detail}"),
        ErrorKind::TimedOut => format!("Network timeout: {detail}"),
        _ => format!("Network error: {detail}"),
    };
    ConnectorError::connection(message)
}

impl From<tiberius::error::Error> for ConnectorError {
    fn from(e: tiberius::error::Error) -> Self {
        use tiberius::error::Error;

        match e {
            Error::Server(token) => {
                ConnectorError::query_error_with_code(token.message().to_string(), token.code())
            }
            Error::Io { kind, message } => io_error(kind, &message),
            Error::Tls(message) => ConnectorError::connection(format!("TLS error: {message}")),
            Error::Protocol(message) => {
                ConnectorError::connection(format!("Protocol error: {message}"))
            }
            Error::Routing { host, port } => ConnectorError::connection(format!(
                "Server requested routing to {host}:{port}"
            )),
            other => ConnectorError::query_error(other.to_string()),
        }
    }
}

impl From<std::io::Error> for ConnectorError {
    fn from(e: std::io::Error) -> Self {
        io_error(e.kind(), &e.to_string())
    }
}

static LINE_BREAKS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[\r\n]")
        .unwrap_or_else(|e| panic!("Internal error: invalid line break pattern: {}", e))
});

/// Flatten a failure message onto a single line.
///
/// Every `\r` and `\n` character becomes one space, so `\r\n` turns into
/// two.
pub fn normalize_message(message: impl fmt::Display) -> String {
    LINE_BREAKS
        .replace_all(&message.to_string(), " ")
        .into_owned()
}

/// The single error shape handed to the host.
///
/// Structured metadata (kind, SQL error number) does not cross this boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HostError(String);

impl HostError {
    /// Build a host error from any displayable failure.
    pub fn new(message: impl fmt::Display) -> Self {
        Self(normalize_message(message))
    }

    /// The flattened message.
    pub fn message(&self) -> &str {
        &self.0
    }

    /// Consume the error, returning the flattened message.
    pub fn into_message(self) -> String {
        self.0
    }
}

impl From<ConnectorError> for HostError {
    fn from(e: ConnectorError) -> Self {
        HostError::new(e)
    }
}

impl From<&str> for HostError {
    fn from(message: &str) -> Self {
        HostError::new(message)
    }
}

impl From<String> for HostError {
    fn from(message: String) -> Self {
        HostError::new(message)
    }
}
