//! Driver seam between the executor and the TDS client.
//!
//! [`Connector`] opens connections, [`QueryConnection`] runs a statement and
//! yields its result as a stream of [`QueryEvent`]s. The executor only talks
//! to these traits. [`TiberiusConnector`] is the production implementation.

use crate::config::ConnectionConfig;
use crate::database::auth::{configure_auth, create_client_config};
use crate::database::types::{NativeColumn, Row, TypeMapper};
use crate::error::ConnectorError;
use crate::resilience::within;
use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use tiberius::{Client, Config, QueryItem};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info};

/// Type alias for a raw tiberius connection.
pub type RawConnection = Client<Compat<TcpStream>>;

/// One item of a statement's result.
#[derive(Debug, Clone)]
pub enum QueryEvent {
    /// Column metadata announcing a new result set.
    Columns(Vec<NativeColumn>),
    /// A row of the current result set.
    Row(Row),
}

/// Result events borrowed from a connection.
pub type EventStream<'a> = BoxStream<'a, Result<QueryEvent, ConnectorError>>;

/// Opens connections to the server.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: QueryConnection;

    /// Establish and authenticate a connection.
    async fn connect(&self, config: &ConnectionConfig) -> Result<Self::Connection, ConnectorError>;
}

/// An open, authenticated connection.
#[async_trait]
pub trait QueryConnection: Send + 'static {
    /// Send a statement and stream its result events.
    ///
    /// The stream borrows the connection until it is dropped.
    async fn query_events<'a>(
        &'a mut self,
        sql: &'a str,
    ) -> Result<EventStream<'a>, ConnectorError>;

    /// Close the connection gracefully.
    async fn close(self) -> Result<(), ConnectorError>
    where
        Self: Sized;
}

/// Connector backed by tiberius over a tokio TCP stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct TiberiusConnector;

impl TiberiusConnector {
    async fn open(config: Config, address: &str) -> tiberius::Result<RawConnection> {
        let tcp = TcpStream::connect(address).await?;
        tcp.set_nodelay(true)?;
        Client::connect(config, tcp.compat_write()).await
    }

    async fn open_within(
        config: Config,
        address: &str,
        connection: &ConnectionConfig,
    ) -> Result<tiberius::Result<RawConnection>, ConnectorError> {
        within(connection.connect_timeout, Self::open(config, address))
            .await
            .ok_or_else(|| {
                ConnectorError::timeout(
                    format!("connect to {address}"),
                    connection.connect_timeout.as_millis() as u64,
                )
            })
    }
}

#[async_trait]
impl Connector for TiberiusConnector {
    type Connection = RawConnection;

    async fn connect(&self, connection: &ConnectionConfig) -> Result<RawConnection, ConnectorError> {
        let mut config = create_client_config(connection);
        configure_auth(&mut config, &connection.authentication).await?;

        let address = connection.address();
        debug!("Creating connection to {}", address);

        let client = match Self::open_within(config.clone(), &address, connection).await? {
            Ok(client) => client,
            Err(tiberius::error::Error::Routing { host, port }) => {
                let routed = format!("{host}:{port}");
                info!("Server redirected connection from {} to {}", address, routed);
                config.host(&host);
                config.port(port);
                Self::open_within(config, &routed, connection)
                    .await?
                    .map_err(ConnectorError::from)?
            }
            Err(e) => {
                debug!("Connection to {} failed: {}", address, e);
                return Err(e.into());
            }
        };

        debug!("Connection established successfully");
        Ok(client)
    }
}

#[async_trait]
impl QueryConnection for RawConnection {
    async fn query_events<'a>(
        &'a mut self,
        sql: &'a str,
    ) -> Result<EventStream<'a>, ConnectorError> {
        let stream = self.simple_query(sql).await?;

        let events = stream.map(|item| match item {
            Ok(QueryItem::Metadata(meta)) => Ok(QueryEvent::Columns(
                meta.columns().iter().map(NativeColumn::from).collect(),
            )),
            Ok(QueryItem::Row(row)) => Ok(QueryEvent::Row(TypeMapper::row_values(&row))),
            Err(e) => Err(ConnectorError::from(e)),
        });

        Ok(events.boxed())
    }

    async fn close(self) -> Result<(), ConnectorError> {
        Client::close(self).await.map_err(ConnectorError::from)
    }
}
