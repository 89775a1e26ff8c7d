//! Database connectivity and streaming query execution.

pub mod auth;
pub mod connection;
pub mod driver;
mod query;
pub mod types;

pub use auth::{build_connection_config, create_client_config};
pub use connection::{ConnectionLease, ConnectionManager, SharedConnection};
pub use driver::{Connector, EventStream, QueryConnection, QueryEvent, RawConnection, TiberiusConnector};
pub use query::{count_query, ConnectionTest, QueryExecutor, ResultStream};
pub use types::{Batch, ColumnDescriptor, Fidelity, NativeColumn, PortableType, Row, SqlValue, TypeMapper};
