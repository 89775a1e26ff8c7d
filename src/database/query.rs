//! Streaming query execution.
//!
//! A query runs in three steps on one leased connection: a best-effort row
//! count estimate, the primary statement, and batching of its first result
//! set. The driver's result stream borrows the connection, so a producer task
//! owns the lease and the stream, and feeds batches to the caller's
//! [`ResultStream`] through a channel of capacity one. The caller's pace
//! drives how far ahead of it the producer reads.
//!
//! Everything up to the moment the stream is handed to the caller is one
//! attempt under the query retry policy. A transient failure there restarts
//! from a fresh connection acquisition. Failures after hand-off become the
//! last item of the stream.

use crate::config::{ConnectionConfig, ExecutorSettings};
use crate::constants::{
    BATCH_CHANNEL_CAPACITY, CONNECTION_TEST_QUERY, DEFAULT_BATCH_SIZE, LOG_QUERY_MAX_LEN,
    MAX_BATCH_PREALLOCATION,
};
use crate::database::auth::{build_connection_config, truncate_for_log};
use crate::database::connection::{ConnectionLease, ConnectionManager};
use crate::database::driver::{Connector, QueryConnection, QueryEvent, TiberiusConnector};
use crate::database::types::{Batch, ColumnDescriptor, NativeColumn, SqlValue, TypeMapper};
use crate::error::{ConnectorError, HostError};
use crate::resilience::{with_retry, with_retry_on, within, RetryConfig};
use crate::telemetry::{generate_short_correlation_id, MetricsSnapshot, QueryOutcome, SharedMetrics};
use futures_util::stream::{Stream, StreamExt, TryStreamExt};
use futures_util::FutureExt;
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info_span, warn, Instrument, Span};

type SchemaResult = Result<Vec<NativeColumn>, ConnectorError>;
type BatchResult = Result<Batch, ConnectorError>;

/// Wrap a query for the row count estimate.
///
/// Trailing whitespace and semicolons are removed so the query can sit in a
/// derived table.
pub fn count_query(query: &str) -> String {
    let cleaned = query
        .trim()
        .trim_end_matches(|c: char| c == ';' || c.is_whitespace());
    format!("SELECT COUNT(*) FROM ({cleaned}) AS subquery")
}

/// Outcome of [`QueryExecutor::test_connection`].
///
/// Serialises as `true` or `{"reason": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionTest {
    Passed,
    Failed { reason: String },
}

impl ConnectionTest {
    pub fn is_passed(&self) -> bool {
        matches!(self, ConnectionTest::Passed)
    }
}

impl Serialize for ConnectionTest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ConnectionTest::Passed => serializer.serialize_bool(true),
            ConnectionTest::Failed { reason } => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("reason", reason)?;
                map.end()
            }
        }
    }
}

/// Executes queries and streams their results in batches.
pub struct QueryExecutor<C: Connector = TiberiusConnector> {
    connections: ConnectionManager<C>,
    query_retry: RetryConfig,
    metrics: SharedMetrics,
}

impl QueryExecutor<TiberiusConnector> {
    /// Create an executor talking to SQL Server over TCP.
    pub fn new(settings: ExecutorSettings) -> Self {
        Self::with_connector(TiberiusConnector, settings)
    }

    /// Create an executor configured from environment variables.
    pub fn from_env() -> Result<Self, ConnectorError> {
        Ok(Self::new(ExecutorSettings::from_env()?))
    }
}

impl<C: Connector> QueryExecutor<C> {
    /// Create an executor over a custom connector.
    pub fn with_connector(connector: C, settings: ExecutorSettings) -> Self {
        let metrics = SharedMetrics::default();
        Self {
            connections: ConnectionManager::new(
                Arc::new(connector),
                settings.connection_mode,
                settings.connection_retry,
                metrics.clone(),
            ),
            query_retry: settings.query_retry,
            metrics,
        }
    }

    /// Connection manager used by this executor.
    pub fn connections(&self) -> &ConnectionManager<C> {
        &self.connections
    }

    /// Current metrics.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Execute a query with untyped connection options.
    ///
    /// Every failure is flattened into a [`HostError`].
    pub async fn execute_query(
        &self,
        query: &str,
        options: &Value,
        batch_size: usize,
    ) -> Result<ResultStream, HostError> {
        let config = build_connection_config(options)?;
        Ok(self.execute(query, &config, batch_size).await?)
    }

    /// Execute a query and return its result as a stream of batches.
    pub async fn execute(
        &self,
        query: &str,
        config: &ConnectionConfig,
        batch_size: usize,
    ) -> Result<ResultStream, ConnectorError> {
        if batch_size == 0 {
            return Err(ConnectorError::config("batch size must be at least 1"));
        }

        let span = info_span!("query", id = %generate_short_correlation_id());

        async move {
            debug!("Executing query: {}", truncate_for_log(query, LOG_QUERY_MAX_LEN));
            self.metrics.record_query_start();
            let started = Instant::now();

            let result = with_retry(&self.query_retry, "execute query", move || {
                self.attempt(query, config, batch_size, started)
            })
            .await;

            if let Err(e) = &result {
                self.metrics
                    .record_query_end(QueryOutcome::Failed, started.elapsed());
                warn!(kind = %e.kind(), "Query failed: {}", e);
            }
            result
        }
        .instrument(span)
        .await
    }

    /// One attempt: acquire, estimate, start streaming, wait for the schema.
    async fn attempt(
        &self,
        query: &str,
        config: &ConnectionConfig,
        batch_size: usize,
        started: Instant,
    ) -> Result<ResultStream, ConnectorError> {
        let mut lease = self.connections.acquire(config).await?;

        let expected_row_count = self.estimate_row_count(&mut lease, query, config).await?;

        let (schema_tx, schema_rx) = oneshot::channel();
        let (batch_tx, batch_rx) = mpsc::channel(BATCH_CHANNEL_CAPACITY);
        let producer = BatchProducer {
            schema_tx: Some(schema_tx),
            batch_tx,
            batch_size,
            metrics: self.metrics.clone(),
            started,
            handed_off: false,
        };
        tokio::spawn(
            producer
                .run(lease, query.to_string())
                .instrument(Span::current()),
        );

        let columns = match within(config.request_timeout, schema_rx).await {
            Some(Ok(schema)) => schema?,
            Some(Err(_)) => {
                return Err(ConnectorError::internal(
                    "query producer stopped before reporting columns",
                ))
            }
            None => {
                return Err(ConnectorError::timeout(
                    "waiting for result metadata",
                    config.request_timeout.as_millis() as u64,
                ))
            }
        };

        debug!(
            columns = columns.len(),
            expected_row_count = ?expected_row_count,
            "Result stream ready"
        );

        Ok(ResultStream {
            column_types: TypeMapper::describe_columns(&columns),
            expected_row_count,
            receiver: batch_rx,
            finished: false,
        })
    }

    /// Validate connection options by running a trivial query end to end.
    pub async fn test_connection(&self, options: &Value) -> ConnectionTest {
        let result = async {
            let stream = self
                .execute_query(CONNECTION_TEST_QUERY, options, DEFAULT_BATCH_SIZE)
                .await?;
            stream.drain().await
        }
        .await;

        match result {
            Ok(_) => ConnectionTest::Passed,
            Err(e) if e.message().trim().is_empty() => ConnectionTest::Failed {
                reason: "Connection test failed".to_string(),
            },
            Err(e) => ConnectionTest::Failed {
                reason: e.into_message(),
            },
        }
    }

    /// Run the count query, giving up silently on any failure.
    ///
    /// Retries, and the primary statement afterwards, never reuse a
    /// connection the estimate left busy.
    async fn estimate_row_count(
        &self,
        lease: &mut ConnectionLease<C::Connection>,
        query: &str,
        config: &ConnectionConfig,
    ) -> Result<Option<u64>, ConnectorError> {
        let mut estimate = CountEstimate {
            connections: &self.connections,
            config,
            lease,
            sql: count_query(query),
            stale: false,
        };

        let count = match with_retry_on(
            &self.query_retry,
            "row count estimate",
            &mut estimate,
            |estimate| estimate.run().boxed(),
        )
        .await
        {
            Ok(count) => count,
            Err(e) => {
                debug!("Row count estimate unavailable: {}", e);
                None
            }
        };

        estimate.refresh().await?;
        Ok(count)
    }

    /// Close the shared connection. Call at shutdown.
    pub async fn close(&self) {
        self.connections.close().await;
    }
}

struct CountEstimate<'l, C: Connector> {
    connections: &'l ConnectionManager<C>,
    config: &'l ConnectionConfig,
    lease: &'l mut ConnectionLease<C::Connection>,
    sql: String,
    /// Set when a count timed out or broke the connection. The server may
    /// still be sending the abandoned result, so the connection is unusable.
    stale: bool,
}

impl<C: Connector> CountEstimate<'_, C> {
    /// Swap a stale connection for a freshly acquired one.
    async fn refresh(&mut self) -> Result<(), ConnectorError> {
        if self.stale {
            debug!("Replacing connection left busy by the row count estimate");
            self.lease.close().await;
            *self.lease = self.connections.acquire(self.config).await?;
            self.stale = false;
        }
        Ok(())
    }

    async fn run(&mut self) -> Result<Option<u64>, ConnectorError> {
        self.refresh().await?;

        let request_timeout = self.config.request_timeout;
        let connection = self.lease.connection()?;
        let sql = self.sql.as_str();

        let count = async move {
            let mut events = connection.query_events(sql).await?;
            let mut count = None;
            while let Some(event) = events.try_next().await? {
                if let (None, QueryEvent::Row(row)) = (count, event) {
                    count = row.first().and_then(SqlValue::as_u64);
                }
            }
            Ok::<_, ConnectorError>(count)
        };

        let result = within(request_timeout, count).await.unwrap_or_else(|| {
            Err(ConnectorError::timeout(
                "row count estimate",
                request_timeout.as_millis() as u64,
            ))
        });
        if let Err(e) = &result {
            self.stale = e.is_transient();
        }
        result
    }
}

enum Outcome {
    Completed,
    Failed(ConnectorError),
    Abandoned,
}

/// Reads the primary statement and sends its rows in batches.
struct BatchProducer {
    schema_tx: Option<oneshot::Sender<SchemaResult>>,
    batch_tx: mpsc::Sender<BatchResult>,
    batch_size: usize,
    metrics: SharedMetrics,
    started: Instant,
    /// Whether the executor received the schema and returned the stream.
    handed_off: bool,
}

impl BatchProducer {
    async fn run<T: QueryConnection>(mut self, mut lease: ConnectionLease<T>, sql: String) {
        let closed = self.batch_tx.clone();
        let pumped = tokio::select! {
            result = self.pump(&mut lease, &sql) => Some(result),
            _ = closed.closed() => None,
        };
        drop(closed);

        let outcome = match pumped {
            Some(Ok(())) => Outcome::Completed,
            Some(Err(_)) if self.batch_tx.is_closed() => Outcome::Abandoned,
            Some(Err(e)) => Outcome::Failed(e),
            None => Outcome::Abandoned,
        };

        match outcome {
            Outcome::Completed => {
                lease.release(None).await;
                debug!("Result stream completed");
                self.record(QueryOutcome::Completed);
            }
            Outcome::Failed(e) => {
                lease.release(Some(&e)).await;
                if self.handed_off {
                    self.record(QueryOutcome::Failed);
                    warn!(kind = %e.kind(), "Query failed while streaming: {}", e);
                }
                self.fail(e).await;
            }
            Outcome::Abandoned => {
                lease.close().await;
                debug!("Result stream dropped before completion");
                if self.handed_off {
                    self.record(QueryOutcome::Abandoned);
                }
            }
        }
    }

    async fn pump<T: QueryConnection>(
        &mut self,
        lease: &mut ConnectionLease<T>,
        sql: &str,
    ) -> Result<(), ConnectorError> {
        let connection = lease.connection()?;
        let mut events = connection.query_events(sql).await?;

        let capacity = self.batch_size.min(MAX_BATCH_PREALLOCATION);
        let mut batch: Batch = Vec::with_capacity(capacity);
        let mut in_first_result = false;

        while let Some(event) = events.try_next().await? {
            match event {
                QueryEvent::Columns(columns) => {
                    if in_first_result {
                        debug!("Ignoring additional result set");
                        break;
                    }
                    in_first_result = true;
                    self.announce(Ok(columns));
                }
                QueryEvent::Row(row) => {
                    batch.push(row);
                    if batch.len() >= self.batch_size {
                        let full = std::mem::replace(&mut batch, Vec::with_capacity(capacity));
                        self.deliver(full).await?;
                    }
                }
            }
        }

        // No result set at all: the stream is empty.
        self.announce(Ok(Vec::new()));

        if !batch.is_empty() {
            self.deliver(batch).await?;
        }
        Ok(())
    }

    fn announce(&mut self, schema: SchemaResult) {
        if let Some(tx) = self.schema_tx.take() {
            self.handed_off = tx.send(schema).is_ok();
        }
    }

    async fn deliver(&mut self, batch: Batch) -> Result<(), ConnectorError> {
        let rows = batch.len();
        self.batch_tx
            .send(Ok(batch))
            .await
            .map_err(|_| ConnectorError::internal("result stream closed"))?;
        self.metrics.record_batch(rows);
        Ok(())
    }

    /// Report a failure to whoever is listening: the executor while it
    /// waits for the schema, the stream consumer afterwards.
    async fn fail(mut self, e: ConnectorError) {
        match self.schema_tx.take() {
            Some(tx) => {
                let _ = tx.send(Err(e));
            }
            None => {
                let _ = self.batch_tx.send(Err(e)).await;
            }
        }
    }

    fn record(&self, outcome: QueryOutcome) {
        self.metrics.record_query_end(outcome, self.started.elapsed());
    }
}

/// Ordered, finite stream of row batches for one query.
///
/// Dropping the stream before it ends stops the query and releases its
/// connection.
pub struct ResultStream {
    column_types: Vec<ColumnDescriptor>,
    expected_row_count: Option<u64>,
    receiver: mpsc::Receiver<BatchResult>,
    finished: bool,
}

impl ResultStream {
    /// Column descriptors of the streamed result set.
    pub fn column_types(&self) -> &[ColumnDescriptor] {
        &self.column_types
    }

    /// Row count estimate, when the count query succeeded.
    pub fn expected_row_count(&self) -> Option<u64> {
        self.expected_row_count
    }

    /// Consume the whole stream, returning the number of rows seen.
    pub async fn drain(mut self) -> Result<u64, HostError> {
        let mut rows = 0u64;
        while let Some(batch) = self.next().await {
            rows += batch?.len() as u64;
        }
        Ok(rows)
    }
}

impl Stream for ResultStream {
    type Item = Result<Batch, HostError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        match self.receiver.poll_recv(cx) {
            Poll::Ready(Some(Ok(batch))) => Poll::Ready(Some(Ok(batch))),
            Poll::Ready(Some(Err(e))) => {
                self.finished = true;
                Poll::Ready(Some(Err(HostError::from(e))))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl std::fmt::Debug for ResultStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultStream")
            .field("column_types", &self.column_types)
            .field("expected_row_count", &self.expected_row_count)
            .field("finished", &self.finished)
            .finish()
    }
}
