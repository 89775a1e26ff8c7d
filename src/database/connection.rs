//! Connection acquisition for query execution.
//!
//! Two strategies are supported, selected by [`ConnectionMode`]:
//!
//! - **Per-query**: every query gets a fresh connection that is closed when
//!   the query's lease is released.
//! - **Shared**: one connection per executor, established lazily. The slot
//!   mutex is held while establishing, so concurrent callers wait for the
//!   in-flight attempt instead of opening their own. A lease on the shared
//!   connection holds the slot for the duration of the query, since a TDS
//!   connection runs one statement at a time.
//!
//! Waiting for the shared slot is bounded by the connect timeout. A caller
//! that still holds an unfinished result stream from the same executor gets
//! an error instead of waiting forever.
//!
//! Either way, callers receive a [`ConnectionLease`] that must be released
//! exactly once. Releasing twice is a no-op.

use crate::config::{ConnectionConfig, ConnectionMode};
use crate::database::driver::{Connector, QueryConnection};
use crate::error::ConnectorError;
use crate::resilience::{with_retry, within, RetryConfig};
use crate::telemetry::SharedMetrics;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Contents of the shared connection slot.
pub struct Slot<T> {
    connection: Option<T>,
    config: Option<ConnectionConfig>,
    generation: u64,
}

impl<T> Slot<T> {
    fn reset(&mut self) -> Option<T> {
        self.config = None;
        self.connection.take()
    }
}

/// Executor-owned, lazily established connection.
pub struct SharedConnection<T> {
    slot: Arc<Mutex<Slot<T>>>,
}

impl<T: QueryConnection> SharedConnection<T> {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot {
                connection: None,
                config: None,
                generation: 0,
            })),
        }
    }

    /// Number of connections established so far.
    ///
    /// Waits for any query currently holding the connection.
    pub async fn generation(&self) -> u64 {
        self.slot.lock().await.generation
    }

    /// Whether a connection is currently established.
    pub async fn is_connected(&self) -> bool {
        self.slot.lock().await.connection.is_some()
    }
}

impl<T: QueryConnection> Default for SharedConnection<T> {
    fn default() -> Self {
        Self::new()
    }
}

enum Strategy<T> {
    PerQuery,
    Shared(SharedConnection<T>),
}

/// Hands out connection leases according to the configured mode.
pub struct ConnectionManager<C: Connector> {
    connector: Arc<C>,
    strategy: Strategy<C::Connection>,
    retry: RetryConfig,
    metrics: SharedMetrics,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(
        connector: Arc<C>,
        mode: ConnectionMode,
        retry: RetryConfig,
        metrics: SharedMetrics,
    ) -> Self {
        let strategy = match mode {
            ConnectionMode::PerQuery => Strategy::PerQuery,
            ConnectionMode::Shared => Strategy::Shared(SharedConnection::new()),
        };
        Self {
            connector,
            strategy,
            retry,
            metrics,
        }
    }

    /// The configured mode.
    pub fn mode(&self) -> ConnectionMode {
        match self.strategy {
            Strategy::PerQuery => ConnectionMode::PerQuery,
            Strategy::Shared(_) => ConnectionMode::Shared,
        }
    }

    /// The shared connection slot, in shared mode.
    pub fn shared(&self) -> Option<&SharedConnection<C::Connection>> {
        match &self.strategy {
            Strategy::PerQuery => None,
            Strategy::Shared(shared) => Some(shared),
        }
    }

    /// Acquire a connection for one query.
    pub async fn acquire(
        &self,
        config: &ConnectionConfig,
    ) -> Result<ConnectionLease<C::Connection>, ConnectorError> {
        let shared = match &self.strategy {
            Strategy::PerQuery => {
                let connection = self.establish(config).await?;
                return Ok(ConnectionLease {
                    inner: LeaseInner::Dedicated(connection),
                    metrics: self.metrics.clone(),
                });
            }
            Strategy::Shared(shared) => shared,
        };

        let mut slot = within(config.connect_timeout, shared.slot.clone().lock_owned())
            .await
            .ok_or_else(|| {
                warn!("Shared connection still busy after {:?}", config.connect_timeout);
                ConnectorError::connection(format!(
                    "Shared connection is in use by another query's result stream \
                     (waited {} ms)",
                    config.connect_timeout.as_millis()
                ))
            })?;

        if slot.connection.is_some() && slot.config.as_ref() != Some(config) {
            info!("Connection options changed, replacing shared connection");
            if let Some(stale) = slot.reset() {
                close_connection(stale, &self.metrics).await;
            }
        }

        if slot.connection.is_none() {
            let connection = self.establish(config).await?;
            slot.generation += 1;
            info!(
                generation = slot.generation,
                "Shared connection established to {}",
                config.address()
            );
            slot.connection = Some(connection);
            slot.config = Some(config.clone());
        } else {
            debug!(generation = slot.generation, "Reusing shared connection");
        }

        Ok(ConnectionLease {
            inner: LeaseInner::Shared(slot),
            metrics: self.metrics.clone(),
        })
    }

    async fn establish(&self, config: &ConnectionConfig) -> Result<C::Connection, ConnectorError> {
        let connector = self.connector.as_ref();
        let metrics = &self.metrics;

        with_retry(&self.retry, "connect", || async move {
            match connector.connect(config).await {
                Ok(connection) => {
                    metrics.record_connection_opened();
                    Ok(connection)
                }
                Err(e) => {
                    metrics.record_connection_error();
                    Err(e)
                }
            }
        })
        .await
    }

    /// Close the shared connection, if any. Safe to call repeatedly.
    pub async fn close(&self) {
        if let Strategy::Shared(shared) = &self.strategy {
            let stale = shared.slot.lock().await.reset();
            if let Some(connection) = stale {
                info!("Closing shared connection");
                close_connection(connection, &self.metrics).await;
            }
        }
    }
}

enum LeaseInner<T> {
    Dedicated(T),
    Shared(OwnedMutexGuard<Slot<T>>),
    Released,
}

/// Exclusive use of a connection for the duration of one query.
pub struct ConnectionLease<T> {
    inner: LeaseInner<T>,
    metrics: SharedMetrics,
}

impl<T: QueryConnection> ConnectionLease<T> {
    /// The leased connection.
    pub fn connection(&mut self) -> Result<&mut T, ConnectorError> {
        let connection = match &mut self.inner {
            LeaseInner::Dedicated(connection) => Some(connection),
            LeaseInner::Shared(slot) => slot.connection.as_mut(),
            LeaseInner::Released => None,
        };
        connection.ok_or_else(|| ConnectorError::internal("connection lease already released"))
    }

    /// Whether the lease has been released.
    pub fn is_released(&self) -> bool {
        matches!(self.inner, LeaseInner::Released)
    }

    /// Give the connection back after use.
    ///
    /// A dedicated connection is always closed. A shared connection is kept
    /// unless `failure` is a connection-level (transient) error, in which
    /// case it is closed and the slot reset so the next caller reconnects.
    pub async fn release(&mut self, failure: Option<&ConnectorError>) {
        let broken = failure.is_some_and(ConnectorError::is_transient);
        self.finish(broken).await;
    }

    /// Close the underlying connection regardless of mode.
    ///
    /// Used when a query is abandoned with its result still in flight.
    pub async fn close(&mut self) {
        self.finish(true).await;
    }

    async fn finish(&mut self, discard_shared: bool) {
        match std::mem::replace(&mut self.inner, LeaseInner::Released) {
            LeaseInner::Dedicated(connection) => {
                close_connection(connection, &self.metrics).await;
            }
            LeaseInner::Shared(mut slot) => {
                if discard_shared {
                    warn!(
                        generation = slot.generation,
                        "Discarding shared connection"
                    );
                    if let Some(connection) = slot.reset() {
                        close_connection(connection, &self.metrics).await;
                    }
                }
            }
            LeaseInner::Released => {}
        }
    }
}

/// Close a connection, logging failures as cleanup errors.
async fn close_connection<T: QueryConnection>(connection: T, metrics: &SharedMetrics) {
    metrics.record_connection_closed();
    match connection.close().await {
        Ok(()) => debug!("Connection closed"),
        Err(e) => {
            metrics.record_cleanup_error();
            let e = ConnectorError::cleanup(e.to_string());
            warn!(kind = %e.kind(), "{}", e);
        }
    }
}
