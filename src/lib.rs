//! # MSSQL Stream Connector
//!
//! Executes SQL queries against Microsoft SQL Server and streams the results
//! back as batches of rows annotated with portable column types.
//!
//! This crate provides:
//! - **Credential building**: untyped host options to a validated connection
//!   descriptor with exactly one authentication mode
//! - **Resilience**: retry with exponential backoff around connection
//!   establishment and query execution
//! - **Connection management**: per-query connections or one shared,
//!   lazily established connection per executor
//! - **Streaming**: lazily produced, bounded batches with a best-effort row
//!   count estimate
//! - **Error normalization**: every failure reaches the host as one line
//!
//! ## Example
//!
//! ```ignore
//! use futures_util::StreamExt;
//! use mssql_stream_connector::QueryExecutor;
//!
//! let executor = QueryExecutor::from_env()?;
//! let mut stream = executor.execute_query("SELECT * FROM orders", &options, 1000).await?;
//! while let Some(batch) = stream.next().await {
//!     for row in batch? { /* ... */ }
//! }
//! ```

pub mod config;
pub mod constants;
pub mod database;
pub mod error;
pub mod options;
pub mod resilience;
pub mod telemetry;

pub use config::{Authentication, ConnectionConfig, ConnectionMode, ExecutorSettings};
pub use database::{
    build_connection_config, ColumnDescriptor, ConnectionTest, Fidelity, PortableType,
    QueryExecutor, ResultStream, SqlValue,
};
pub use error::{normalize_message, ConnectorError, ErrorKind, HostError};
pub use options::options_schema;
pub use resilience::RetryConfig;
