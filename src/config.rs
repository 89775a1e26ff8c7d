//! Configuration types for the connector.
//!
//! Two layers of configuration exist:
//! - [`ConnectionConfig`]: the per-request connection descriptor, built from
//!   the host's untyped options by [`crate::database::build_connection_config`].
//! - [`ExecutorSettings`]: process-level behaviour (connection mode, retry
//!   policies), loaded from environment variables following the 12-factor
//!   app pattern.

use crate::constants::{DEFAULT_APPLICATION_NAME, DEFAULT_CONNECT_TIMEOUT, DEFAULT_PORT, DEFAULT_REQUEST_TIMEOUT};
use crate::error::ConnectorError;
use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Driver-ready connection descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// SQL Server hostname or IP address
    pub server: String,

    /// Database name
    pub database: String,

    /// SQL Server port (default: 1433)
    pub port: u16,

    /// Authentication configuration
    pub authentication: Authentication,

    /// TCP connect and login timeout. Zero means no limit.
    pub connect_timeout: Duration,

    /// Timeout for a single request (count estimate, first result metadata).
    /// Zero means no limit.
    pub request_timeout: Duration,

    /// Trust server certificate (for self-signed certs)
    pub trust_server_certificate: bool,

    /// Enable TLS encryption
    pub encrypt: bool,

    /// Application name sent to SQL Server
    pub application_name: String,
}

impl ConnectionConfig {
    /// Create a descriptor with default transport settings.
    pub fn new(
        server: impl Into<String>,
        database: impl Into<String>,
        authentication: Authentication,
    ) -> Self {
        Self {
            server: server.into(),
            database: database.into(),
            port: DEFAULT_PORT,
            authentication,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            trust_server_certificate: false,
            encrypt: true,
            application_name: DEFAULT_APPLICATION_NAME.to_string(),
        }
    }

    /// `host:port` address used for the TCP connection.
    pub fn address(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }
}

/// Authentication configuration.
///
/// Exactly one variant is active, carrying only the fields its mode needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Authentication {
    /// SQL Server authentication (username/password)
    SqlLogin { user: String, password: String },

    /// Azure AD default credential chain (managed identity, environment, CLI)
    ManagedIdentityDefault { client_id: Option<String> },

    /// Pre-acquired Azure AD access token
    AccessToken { token: String },

    /// Azure AD username/password within an application registration
    ServicePrincipalPassword {
        user: String,
        password: String,
        client_id: String,
        tenant_id: String,
    },

    /// Azure AD service principal with client secret
    ServicePrincipalSecret {
        client_id: String,
        client_secret: String,
        tenant_id: String,
    },
}

impl Authentication {
    /// Discriminator value for SQL Server authentication.
    pub const SQL_LOGIN: &'static str = "default";
    /// Discriminator value for the Azure AD default credential chain.
    pub const MANAGED_IDENTITY_DEFAULT: &'static str = "azure-active-directory-default";
    /// Discriminator value for a pre-acquired Azure AD token.
    pub const ACCESS_TOKEN: &'static str = "azure-active-directory-access-token";
    /// Discriminator value for Azure AD username/password.
    pub const SERVICE_PRINCIPAL_PASSWORD: &'static str = "azure-active-directory-password";
    /// Discriminator value for an Azure AD service principal secret.
    pub const SERVICE_PRINCIPAL_SECRET: &'static str =
        "azure-active-directory-service-principal-secret";

    /// All accepted discriminator values, in presentation order.
    pub const ALL: [&'static str; 5] = [
        Self::SQL_LOGIN,
        Self::MANAGED_IDENTITY_DEFAULT,
        Self::ACCESS_TOKEN,
        Self::SERVICE_PRINCIPAL_PASSWORD,
        Self::SERVICE_PRINCIPAL_SECRET,
    ];

    /// The `authenticationType` discriminator for this variant.
    pub fn discriminator(&self) -> &'static str {
        match self {
            Self::SqlLogin { .. } => Self::SQL_LOGIN,
            Self::ManagedIdentityDefault { .. } => Self::MANAGED_IDENTITY_DEFAULT,
            Self::AccessToken { .. } => Self::ACCESS_TOKEN,
            Self::ServicePrincipalPassword { .. } => Self::SERVICE_PRINCIPAL_PASSWORD,
            Self::ServicePrincipalSecret { .. } => Self::SERVICE_PRINCIPAL_SECRET,
        }
    }
}

/// How connections are obtained for each query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionMode {
    /// Open a fresh connection for every query and close it afterwards.
    #[default]
    PerQuery,
    /// Lazily open one connection and reuse it across queries.
    Shared,
}

impl FromStr for ConnectionMode {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").trim() {
            "per-query" | "perquery" | "fresh" => Ok(ConnectionMode::PerQuery),
            "shared" | "pooled" | "pool" => Ok(ConnectionMode::Shared),
            other => Err(ConnectorError::config(format!(
                "invalid connection mode '{}': expected 'per-query' or 'shared'",
                other
            ))),
        }
    }
}

/// Process-level executor behaviour.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Connection acquisition strategy
    pub connection_mode: ConnectionMode,

    /// Retry policy for establishing connections
    pub connection_retry: RetryConfig,

    /// Retry policy for query execution (count estimate and stream start)
    pub query_retry: RetryConfig,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            connection_mode: ConnectionMode::default(),
            connection_retry: RetryConfig::connection(),
            query_retry: RetryConfig::query(),
        }
    }
}

impl ExecutorSettings {
    /// Load settings from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `MSSQL_CONNECTION_MODE`: `per-query` (default) or `shared`
    /// - `MSSQL_CONNECT_RETRY_MAX`, `MSSQL_CONNECT_RETRY_BASE_DELAY_MS`,
    ///   `MSSQL_CONNECT_RETRY_MAX_DELAY_MS`: connection retry policy
    /// - `MSSQL_QUERY_RETRY_MAX`, `MSSQL_QUERY_RETRY_BASE_DELAY_MS`,
    ///   `MSSQL_QUERY_RETRY_MAX_DELAY_MS`: query retry policy
    pub fn from_env() -> Result<Self, ConnectorError> {
        let connection_mode = match std::env::var("MSSQL_CONNECTION_MODE") {
            Ok(mode) => mode.parse()?,
            Err(_) => ConnectionMode::default(),
        };

        Ok(Self {
            connection_mode,
            connection_retry: RetryConfig::from_env("MSSQL_CONNECT_RETRY", RetryConfig::connection()),
            query_retry: RetryConfig::from_env("MSSQL_QUERY_RETRY", RetryConfig::query()),
        })
    }

    /// Use the given connection mode.
    pub fn with_connection_mode(mut self, mode: ConnectionMode) -> Self {
        self.connection_mode = mode;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_config_defaults() {
        let config = ConnectionConfig::new(
            "localhost",
            "master",
            Authentication::SqlLogin {
                user: "sa".to_string(),
                password: "secret".to_string(),
            },
        );
        assert_eq!(config.port, 1433);
        assert!(config.encrypt);
        assert!(!config.trust_server_certificate);
        assert_eq!(config.connect_timeout, Duration::from_millis(30_000));
        assert_eq!(config.request_timeout, Duration::from_millis(30_000));
        assert_eq!(config.address(), "localhost:1433");
    }

    #[test]
    fn test_connection_mode_parse() {
        assert_eq!("shared".parse::<ConnectionMode>().unwrap(), ConnectionMode::Shared);
        assert_eq!("PER_QUERY".parse::<ConnectionMode>().unwrap(), ConnectionMode::PerQuery);
        assert!("sometimes".parse::<ConnectionMode>().is_err());
    }

    #[test]
    fn test_discriminators_are_distinct() {
        let mut all = Authentication::ALL.to_vec();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 5);

        let auth = Authentication::AccessToken {
            token: "t".to_string(),
        };
        assert_eq!(auth.discriminator(), "azure-active-directory-access-token");
    }

    #[test]
    fn test_executor_settings_default() {
        let settings = ExecutorSettings::default();
        assert_eq!(settings.connection_mode, ConnectionMode::PerQuery);
        assert_eq!(settings.connection_retry.max_retries, 3);
        assert_eq!(settings.query_retry.max_retries, 3);
    }
}
