//! Integration tests against a real SQL Server.
//!
//! These tests support two modes:
//! 1. **Testcontainers** (default): Automatically spins up SQL Server containers
//! 2. **External server**: Connect to existing server via MSSQL_HOST env var
//!
//! ## Running with testcontainers (requires Docker):
//! ```bash
//! cargo test --test integration_tests -- --ignored --test-threads=1
//! ```
//!
//! ## Running against external server:
//! ```bash
//! MSSQL_HOST=localhost MSSQL_PORT=1433 MSSQL_PASSWORD='yourPass' \
//!   cargo test --test integration_tests -- --ignored --test-threads=1
//! ```
//!
//! Note: SQL Server container requires ~2GB RAM and takes 30-60 seconds to start.

use futures_util::StreamExt;
use mssql_stream_connector::config::{ConnectionMode, ExecutorSettings};
use mssql_stream_connector::{
    ConnectionTest, Fidelity, PortableType, QueryExecutor, RetryConfig, SqlValue,
};
use serde_json::{json, Value};
use serial_test::serial;
use std::time::Duration;
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::mssql_server::MssqlServer;

/// Default SA password for testcontainers.
const DEFAULT_SA_PASSWORD: &str = "yourStrong(!)Password";

/// Default SQL Server image tag for tests.
const DEFAULT_VERSION: &str = "2022-latest";

/// Query producing `rows` sequential integers in column `n`, starting at 1.
fn numbers(rows: usize) -> String {
    format!(
        "SELECT TOP {rows} CAST(ROW_NUMBER() OVER (ORDER BY (SELECT NULL)) AS INT) AS n \
         FROM sys.all_objects a CROSS JOIN sys.all_objects b"
    )
}

fn get_test_version() -> String {
    std::env::var("MSSQL_TEST_VERSION").unwrap_or_else(|_| DEFAULT_VERSION.to_string())
}

/// Test database connection source.
#[allow(dead_code)] // Variants held for lifetime management (Drop trait)
enum TestDatabaseSource {
    External,
    Container(Box<ContainerAsync<MssqlServer>>),
}

/// A reachable SQL Server, external or container-managed.
struct TestDatabase {
    #[allow(dead_code)] // Held for lifetime management (Drop trait on Container)
    source: TestDatabaseSource,
    host: String,
    port: u16,
    password: String,
}

impl TestDatabase {
    /// Uses an external server if MSSQL_HOST is set, otherwise testcontainers.
    async fn new() -> Self {
        match std::env::var("MSSQL_HOST") {
            Ok(host) => Self::from_external(host),
            Err(_) => Self::from_testcontainer(&get_test_version()).await,
        }
    }

    fn from_external(host: String) -> Self {
        let port = std::env::var("MSSQL_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(1433);
        let password =
            std::env::var("MSSQL_PASSWORD").unwrap_or_else(|_| DEFAULT_SA_PASSWORD.to_string());

        eprintln!("Using external SQL Server at {}:{}", host, port);

        Self {
            source: TestDatabaseSource::External,
            host,
            port,
            password,
        }
    }

    async fn from_testcontainer(version: &str) -> Self {
        eprintln!(
            "Starting SQL Server {} container via testcontainers...",
            version
        );

        let container = MssqlServer::default()
            .with_accept_eula()
            .with_tag(version)
            .start()
            .await
            .unwrap_or_else(|e| panic!("Failed to start SQL Server {} container: {}", version, e));

        let host = container.get_host().await.expect("Failed to get host");
        let port = container
            .get_host_port_ipv4(1433)
            .await
            .expect("Failed to get port");

        // Wait a bit for SQL Server to fully initialize
        tokio::time::sleep(Duration::from_secs(5)).await;

        Self {
            source: TestDatabaseSource::Container(Box::new(container)),
            host: host.to_string(),
            port,
            password: DEFAULT_SA_PASSWORD.to_string(),
        }
    }

    /// Host options for the `sa` login.
    fn options(&self) -> Value {
        json!({
            "server": self.host,
            "port": self.port,
            "database": "master",
            "authenticationType": "default",
            "user": "sa",
            "password": self.password,
            "trust_server_certificate": true,
            "encrypt": false
        })
    }

    fn executor(&self, mode: ConnectionMode) -> QueryExecutor {
        QueryExecutor::new(ExecutorSettings {
            connection_mode: mode,
            connection_retry: RetryConfig::connection(),
            query_retry: RetryConfig::no_retry(),
        })
    }
}

// =============================================================================
// Streaming
// =============================================================================

mod query_tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_batches_in_order() {
        let db = TestDatabase::new().await;
        let executor = db.executor(ConnectionMode::PerQuery);

        let mut stream = executor
            .execute_query(&numbers(2500), &db.options(), 1000)
            .await
            .expect("Query failed");

        assert_eq!(stream.expected_row_count(), Some(2500));
        assert_eq!(stream.column_types()[0].name, "n");

        let mut sizes = Vec::new();
        let mut expected = 1;
        while let Some(batch) = stream.next().await {
            let batch = batch.expect("Batch failed");
            sizes.push(batch.len());
            for row in batch {
                assert_eq!(row[0], SqlValue::I32(expected));
                expected += 1;
            }
        }
        assert_eq!(sizes, vec![1000, 1000, 500]);

        let metrics = executor.metrics();
        assert_eq!(metrics.queries_success, 1);
        assert_eq!(metrics.open_connections(), 0);
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_column_types() {
        let db = TestDatabase::new().await;
        let executor = db.executor(ConnectionMode::PerQuery);

        let mut stream = executor
            .execute_query(
                "SELECT CAST(1 AS INT) AS i, CAST(100.50 AS DECIMAL(10,2)) AS d, \
                 N'Alice' AS s, CAST(1 AS BIT) AS b, CAST('2024-01-02' AS DATE) AS dt, \
                 CAST(NULL AS NVARCHAR(10)) AS nothing, NEWID() AS g",
                &db.options(),
                10,
            )
            .await
            .expect("Query failed");

        let types: Vec<_> = stream
            .column_types()
            .iter()
            .map(|c| (c.name.as_str(), c.portable_type, c.fidelity))
            .collect();
        assert_eq!(
            types,
            vec![
                ("i", PortableType::Number, Fidelity::Precise),
                ("d", PortableType::Number, Fidelity::Precise),
                ("s", PortableType::String, Fidelity::Precise),
                ("b", PortableType::Boolean, Fidelity::Precise),
                ("dt", PortableType::Date, Fidelity::Precise),
                ("nothing", PortableType::String, Fidelity::Precise),
                ("g", PortableType::String, Fidelity::Inferred),
            ]
        );

        let batch = stream.next().await.unwrap().expect("Batch failed");
        let row = &batch[0];
        assert_eq!(row[0], SqlValue::I32(1));
        assert_eq!(row[2], SqlValue::String("Alice".to_string()));
        assert_eq!(row[3], SqlValue::Bool(true));
        assert!(row[5].is_null());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_count_estimate_unavailable_for_ordered_query() {
        let db = TestDatabase::new().await;
        let executor = db.executor(ConnectionMode::PerQuery);

        // ORDER BY is not allowed inside the derived table of the count query
        let stream = executor
            .execute_query(
                "SELECT name FROM sys.databases ORDER BY name",
                &db.options(),
                100,
            )
            .await
            .expect("Query failed");

        assert_eq!(stream.expected_row_count(), None);
        assert!(stream.drain().await.expect("Drain failed") >= 4);
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_invalid_query_syntax() {
        let db = TestDatabase::new().await;
        let executor = db.executor(ConnectionMode::PerQuery);

        let err = executor
            .execute_query("SELEC * FORM nowhere", &db.options(), 100)
            .await
            .expect_err("Invalid syntax accepted");

        assert!(!err.message().contains('\n'));
        assert!(err.message().contains("syntax"), "{}", err.message());
        assert_eq!(executor.metrics().open_connections(), 0);
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_abandoned_stream_releases_connection() {
        let db = TestDatabase::new().await;
        let executor = db.executor(ConnectionMode::PerQuery);

        let mut stream = executor
            .execute_query(&numbers(50_000), &db.options(), 100)
            .await
            .expect("Query failed");
        stream.next().await.unwrap().expect("Batch failed");
        drop(stream);

        for _ in 0..100 {
            if executor.metrics().open_connections() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(executor.metrics().open_connections(), 0);
        assert_eq!(executor.metrics().queries_abandoned, 1);
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_shared_connection_reused() {
        let db = TestDatabase::new().await;
        let executor = db.executor(ConnectionMode::Shared);

        for _ in 0..3 {
            let stream = executor
                .execute_query(&numbers(10), &db.options(), 4)
                .await
                .expect("Query failed");
            assert_eq!(stream.drain().await.expect("Drain failed"), 10);
        }

        assert_eq!(executor.metrics().connections_opened, 1);
        executor.close().await;
        assert_eq!(executor.metrics().open_connections(), 0);
    }
}

// =============================================================================
// Connection test
// =============================================================================

mod connection_tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_valid_credentials() {
        let db = TestDatabase::new().await;
        let executor = db.executor(ConnectionMode::PerQuery);

        assert_eq!(
            executor.test_connection(&db.options()).await,
            ConnectionTest::Passed
        );
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_invalid_password() {
        let db = TestDatabase::new().await;
        let executor = db.executor(ConnectionMode::PerQuery);

        let mut options = db.options();
        options["password"] = json!("wrong password");

        match executor.test_connection(&options).await {
            ConnectionTest::Failed { reason } => {
                assert!(reason.contains("Login failed"), "{}", reason);
            }
            ConnectionTest::Passed => panic!("wrong password accepted"),
        }
        assert_eq!(executor.metrics().connection_errors, 1);
    }
}
