//! Centralized constants for the connector.
//!
//! This module contains all magic numbers and default values used throughout
//! the codebase, making them easy to find, understand, and modify.

use std::time::Duration;

// =============================================================================
// Connection Defaults
// =============================================================================

/// Default SQL Server port.
pub const DEFAULT_PORT: u16 = 1433;

/// Default connection timeout in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;

/// Default request timeout in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Default connection timeout as Duration.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS);

/// Default request timeout as Duration.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS);

/// Application name reported to SQL Server.
pub const DEFAULT_APPLICATION_NAME: &str = "mssql-stream-connector";

/// Scope requested when acquiring Azure AD tokens for Azure SQL.
pub const AZURE_SQL_SCOPE: &str = "https://database.windows.net/.default";

// =============================================================================
// Retry Defaults
// =============================================================================

/// Default maximum attempts (the first attempt counts).
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay between retries in milliseconds.
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;

/// Default upper bound on a single retry delay in milliseconds.
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 10_000;

/// Lower bound (inclusive) of the backoff jitter factor.
pub const JITTER_MIN: f64 = 1.0;

/// Upper bound (exclusive) of the backoff jitter factor.
pub const JITTER_MAX: f64 = 1.2;

/// Error message fragments that mark a failure as transient.
///
/// Matched case-insensitively against the error message.
pub const TRANSIENT_ERROR_SIGNATURES: &[&str] = &[
    "etimeout",
    "econnreset",
    "econnrefused",
    "esocket",
    "ealreadyconnected",
    "ealreadyconnecting",
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "connection aborted",
    "socket",
    "sequence timeout",
    "already connected",
    "already connecting",
    "failed to connect",
    "connection lost",
    "connection closed",
    "network error",
    "deadlock",
    "broken pipe",
];

// =============================================================================
// Streaming
// =============================================================================

/// Default number of rows per batch.
pub const DEFAULT_BATCH_SIZE: usize = 1_000;

/// Number of batches buffered between the producer and the consumer.
///
/// One batch of read-ahead keeps the row stream pull-driven.
pub const BATCH_CHANNEL_CAPACITY: usize = 1;

/// Upper bound on rows preallocated per batch buffer.
pub const MAX_BATCH_PREALLOCATION: usize = 4_096;

/// Query used to validate credentials.
pub const CONNECTION_TEST_QUERY: &str = "SELECT 1";

/// Maximum query length included in log lines.
pub const LOG_QUERY_MAX_LEN: usize = 200;
