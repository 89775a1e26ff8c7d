//! Credential building and authentication for SQL Server connections.
//!
//! The host hands over an untyped options object. [`build_connection_config`]
//! validates it into a [`ConnectionConfig`] carrying exactly one
//! [`Authentication`] variant. At connect time the descriptor is turned into
//! a `tiberius::Config` and authentication is applied, acquiring an Azure AD
//! token first when the variant needs one.

use crate::config::{Authentication, ConnectionConfig};
use crate::constants::DEFAULT_PORT;
use crate::error::ConnectorError;
use serde_json::{Map, Value};
use std::time::Duration;
use tiberius::{AuthMethod, Config, EncryptionLevel};
#[cfg(feature = "azure-auth")]
use tracing::debug;

type Options = Map<String, Value>;

/// Build a connection descriptor from the host's options object.
///
/// # Errors
///
/// Returns a configuration error when the options are missing or not an
/// object, when `server`/`database` are absent, when a typed field has the
/// wrong shape, or when `authenticationType` is missing or unknown or lacks
/// one of its variant's required fields.
pub fn build_connection_config(options: &Value) -> Result<ConnectionConfig, ConnectorError> {
    let options = match options {
        Value::Object(map) => map,
        Value::Null => return Err(ConnectorError::config("connection options are missing")),
        _ => {
            return Err(ConnectorError::config(
                "connection options must be an object",
            ))
        }
    };

    let server = match string_field(options, "server")? {
        Some(server) => server,
        None => required(options, "host", "connection options")?,
    };
    let database = required(options, "database", "connection options")?;
    let authentication = build_authentication(options)?;

    let mut config = ConnectionConfig::new(server, database, authentication);
    config.port = port_field(options)?.unwrap_or(DEFAULT_PORT);
    if let Some(ms) = number_field(options, "connection_timeout")? {
        config.connect_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = number_field(options, "request_timeout")? {
        config.request_timeout = Duration::from_millis(ms);
    }
    if let Some(trust) = bool_field(options, "trust_server_certificate")? {
        config.trust_server_certificate = trust;
    }
    if let Some(encrypt) = bool_field(options, "encrypt")? {
        config.encrypt = encrypt;
    }

    Ok(config)
}

fn build_authentication(options: &Options) -> Result<Authentication, ConnectorError> {
    let discriminator = string_field(options, "authenticationType")?.ok_or_else(|| {
        ConnectorError::config(format!(
            "authenticationType is required (one of: {})",
            Authentication::ALL.join(", ")
        ))
    })?;

    let auth = match discriminator.as_str() {
        Authentication::SQL_LOGIN => Authentication::SqlLogin {
            user: required(options, "user", Authentication::SQL_LOGIN)?,
            password: required(options, "password", Authentication::SQL_LOGIN)?,
        },
        Authentication::MANAGED_IDENTITY_DEFAULT => Authentication::ManagedIdentityDefault {
            client_id: string_field(options, "clientId")?,
        },
        Authentication::ACCESS_TOKEN => Authentication::AccessToken {
            token: required(options, "token", Authentication::ACCESS_TOKEN)?,
        },
        Authentication::SERVICE_PRINCIPAL_PASSWORD => {
            let variant = Authentication::SERVICE_PRINCIPAL_PASSWORD;
            Authentication::ServicePrincipalPassword {
                user: required(options, "user", variant)?,
                password: required(options, "password", variant)?,
                client_id: required(options, "clientId", variant)?,
                tenant_id: required(options, "tenantId", variant)?,
            }
        }
        Authentication::SERVICE_PRINCIPAL_SECRET => {
            let variant = Authentication::SERVICE_PRINCIPAL_SECRET;
            Authentication::ServicePrincipalSecret {
                client_id: required(options, "clientId", variant)?,
                client_secret: required(options, "clientSecret", variant)?,
                tenant_id: required(options, "tenantId", variant)?,
            }
        }
        other => {
            return Err(ConnectorError::config(format!(
                "unknown authenticationType '{}' (expected one of: {})",
                other,
                Authentication::ALL.join(", ")
            )))
        }
    };

    Ok(auth)
}

/// Non-empty string field. Numbers are accepted and rendered as text.
fn string_field(options: &Options, key: &str) -> Result<Option<String>, ConnectorError> {
    match options.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(_) => Err(ConnectorError::config(format!("{key} must be a string"))),
    }
}

fn required(options: &Options, key: &str, context: &str) -> Result<String, ConnectorError> {
    string_field(options, key)?
        .ok_or_else(|| ConnectorError::config(format!("{key} is required for {context}")))
}

/// Boolean field accepting `true`/`false` and the strings `"true"`/`"false"`.
fn bool_field(options: &Options, key: &str) -> Result<Option<bool>, ConnectorError> {
    match options.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(Value::String(s)) => match s.trim().to_lowercase().as_str() {
            "true" => Ok(Some(true)),
            "false" => Ok(Some(false)),
            "" => Ok(None),
            _ => Err(ConnectorError::config(format!(
                "{key} must be true or false, got '{s}'"
            ))),
        },
        Some(other) => Err(ConnectorError::config(format!(
            "{key} must be true or false, got {other}"
        ))),
    }
}

/// Non-negative integer field accepting numbers and numeric strings.
fn number_field(options: &Options, key: &str) -> Result<Option<u64>, ConnectorError> {
    let invalid = || ConnectorError::config(format!("{key} must be a non-negative integer"));

    match options.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_u64().map(Some).ok_or_else(invalid),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s.trim().parse().map(Some).map_err(|_| invalid()),
        Some(_) => Err(invalid()),
    }
}

fn port_field(options: &Options) -> Result<Option<u16>, ConnectorError> {
    match number_field(options, "port")? {
        None => Ok(None),
        Some(port) => u16::try_from(port)
            .ok()
            .filter(|p| *p > 0)
            .map(Some)
            .ok_or_else(|| ConnectorError::config(format!("port {port} is out of range"))),
    }
}

/// Create a tiberius Config from a connection descriptor.
///
/// This sets up host, port, database, encryption and application name but
/// does NOT configure authentication. Use [`configure_auth`] for that.
pub fn create_client_config(connection: &ConnectionConfig) -> Config {
    let mut config = Config::new();

    config.host(&connection.server);
    config.port(connection.port);
    config.database(&connection.database);

    if connection.encrypt {
        config.encryption(EncryptionLevel::Required);
    } else {
        config.encryption(EncryptionLevel::Off);
    }

    if connection.trust_server_certificate {
        config.trust_cert();
    }

    config.application_name(&connection.application_name);

    config
}

/// Apply the authentication method to a tiberius Config.
///
/// Azure AD variants other than a pre-acquired token need the `azure-auth`
/// feature to obtain a token.
pub async fn configure_auth(
    config: &mut Config,
    auth: &Authentication,
) -> Result<(), ConnectorError> {
    match auth {
        Authentication::SqlLogin { user, password } => {
            config.authentication(AuthMethod::sql_server(user, password));
            Ok(())
        }
        Authentication::AccessToken { token } => {
            config.authentication(AuthMethod::aad_token(token));
            Ok(())
        }
        Authentication::ServicePrincipalPassword { .. } => Err(ConnectorError::config(format!(
            "authenticationType '{}' is not supported by the TDS driver; use '{}' or '{}'",
            Authentication::SERVICE_PRINCIPAL_PASSWORD,
            Authentication::SERVICE_PRINCIPAL_SECRET,
            Authentication::ACCESS_TOKEN
        ))),
        #[cfg(feature = "azure-auth")]
        other => {
            let token = acquire_azure_ad_token(other).await?;
            config.authentication(AuthMethod::aad_token(token));
            Ok(())
        }
        #[cfg(not(feature = "azure-auth"))]
        other => Err(ConnectorError::config(format!(
            "authenticationType '{}' requires the 'azure-auth' feature. \
             Rebuild with: cargo build --features azure-auth",
            other.discriminator()
        ))),
    }
}

/// Acquire an Azure AD access token for Azure SQL.
#[cfg(feature = "azure-auth")]
async fn acquire_azure_ad_token(auth: &Authentication) -> Result<String, ConnectorError> {
    use crate::constants::AZURE_SQL_SCOPE;
    use azure_core::credentials::{Secret, TokenCredential};
    use azure_identity::{
        ClientSecretCredential, ManagedIdentityCredential, ManagedIdentityCredentialOptions,
        UserAssignedId,
    };
    use std::sync::Arc;

    let credential: Arc<dyn TokenCredential> = match auth {
        Authentication::ManagedIdentityDefault { client_id } => {
            debug!(user_assigned = client_id.is_some(), "Using managed identity credential");
            let options = ManagedIdentityCredentialOptions {
                user_assigned_id: client_id.clone().map(UserAssignedId::ClientId),
                ..Default::default()
            };
            ManagedIdentityCredential::new(Some(options)).map_err(|e| {
                ConnectorError::config(format!("Invalid managed identity configuration: {e}"))
            })?
        }
        Authentication::ServicePrincipalSecret {
            client_id,
            client_secret,
            tenant_id,
        } => {
            debug!(
                "Acquiring Azure AD token for client_id: {}",
                truncate_for_log(client_id, 8)
            );
            ClientSecretCredential::new(
                tenant_id,
                client_id.clone(),
                Secret::new(client_secret.clone()),
                None,
            )
            .map_err(|e| {
                ConnectorError::config(format!("Invalid service principal configuration: {e}"))
            })?
        }
        other => {
            return Err(ConnectorError::internal(format!(
                "no token flow for authenticationType '{}'",
                other.discriminator()
            )))
        }
    };

    let token = credential
        .get_token(&[AZURE_SQL_SCOPE], None)
        .await
        .map_err(|e| ConnectorError::connection(format!("Failed to acquire Azure AD token: {e}")))?;

    debug!("Azure AD token acquired successfully");
    Ok(token.token.secret().to_string())
}

/// Truncate a string for logging purposes, on a character boundary.
pub fn truncate_for_log(s: &str, max_len: usize) -> String {
    match s.char_indices().nth(max_len) {
        None => s.to_string(),
        Some((end, _)) => format!("{}...", &s[..end]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sql_login() -> Value {
        json!({
            "server": "db.example.com",
            "database": "sales",
            "authenticationType": "default",
            "user": "reporter",
            "password": "s3cret"
        })
    }

    #[test]
    fn test_defaults_applied() {
        let config = build_connection_config(&sql_login()).unwrap();
        assert_eq!(config.server, "db.example.com");
        assert_eq!(config.database, "sales");
        assert_eq!(config.port, 1433);
        assert!(config.encrypt);
        assert!(!config.trust_server_certificate);
        assert_eq!(config.connect_timeout, Duration::from_millis(30_000));
        assert_eq!(config.request_timeout, Duration::from_millis(30_000));
        assert_eq!(
            config.authentication,
            Authentication::SqlLogin {
                user: "reporter".to_string(),
                password: "s3cret".to_string()
            }
        );
    }

    #[test]
    fn test_string_booleans_and_numbers() {
        let mut options = sql_login();
        options["trust_server_certificate"] = json!("true");
        options["encrypt"] = json!("false");
        options["port"] = json!("14330");
        options["connection_timeout"] = json!(5000);
        options["request_timeout"] = json!("60000");

        let config = build_connection_config(&options).unwrap();
        assert!(config.trust_server_certificate);
        assert!(!config.encrypt);
        assert_eq!(config.port, 14330);
        assert_eq!(config.connect_timeout, Duration::from_millis(5000));
        assert_eq!(config.request_timeout, Duration::from_millis(60_000));
    }

    #[test]
    fn test_zero_timeouts_kept_as_unbounded() {
        let mut options = sql_login();
        options["request_timeout"] = json!(0);
        options["connection_timeout"] = json!("0");

        let config = build_connection_config(&options).unwrap();
        assert!(config.request_timeout.is_zero());
        assert!(config.connect_timeout.is_zero());
    }

    #[test]
    fn test_host_alias() {
        let mut options = sql_login();
        options.as_object_mut().unwrap().remove("server");
        options["host"] = json!("10.0.0.5");
        assert_eq!(build_connection_config(&options).unwrap().server, "10.0.0.5");
    }

    #[test]
    fn test_missing_or_non_object_options() {
        for options in [Value::Null, json!("server=x"), json!([1, 2])] {
            let err = build_connection_config(&options).unwrap_err();
            assert!(matches!(err, ConnectorError::Config(_)));
        }
    }

    #[test]
    fn test_each_variant_sets_only_its_fields() {
        let base = |auth: Value| {
            let mut options = json!({"server": "s", "database": "d"});
            for (k, v) in auth.as_object().unwrap() {
                options[k] = v.clone();
            }
            build_connection_config(&options).unwrap().authentication
        };

        assert_eq!(
            base(json!({"authenticationType": "azure-active-directory-default"})),
            Authentication::ManagedIdentityDefault { client_id: None }
        );
        assert_eq!(
            base(json!({
                "authenticationType": "azure-active-directory-default",
                "clientId": "abc"
            })),
            Authentication::ManagedIdentityDefault {
                client_id: Some("abc".to_string())
            }
        );
        assert_eq!(
            base(json!({
                "authenticationType": "azure-active-directory-access-token",
                "token": "eyJ0",
                "user": "ignored"
            })),
            Authentication::AccessToken {
                token: "eyJ0".to_string()
            }
        );
        assert_eq!(
            base(json!({
                "authenticationType": "azure-active-directory-password",
                "user": "u@contoso.com",
                "password": "p",
                "clientId": "c",
                "tenantId": "t"
            })),
            Authentication::ServicePrincipalPassword {
                user: "u@contoso.com".to_string(),
                password: "p".to_string(),
                client_id: "c".to_string(),
                tenant_id: "t".to_string()
            }
        );
        assert_eq!(
            base(json!({
                "authenticationType": "azure-active-directory-service-principal-secret",
                "clientId": "c",
                "clientSecret": "x",
                "tenantId": "t"
            })),
            Authentication::ServicePrincipalSecret {
                client_id: "c".to_string(),
                client_secret: "x".to_string(),
                tenant_id: "t".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_or_missing_discriminator_rejected() {
        let mut options = sql_login();
        options["authenticationType"] = json!("kerberos");
        let err = build_connection_config(&options).unwrap_err();
        assert!(matches!(err, ConnectorError::Config(_)));
        assert!(err.to_string().contains("kerberos"));

        options.as_object_mut().unwrap().remove("authenticationType");
        let err = build_connection_config(&options).unwrap_err();
        assert!(err.to_string().contains("authenticationType is required"));
    }

    #[test]
    fn test_variant_required_fields() {
        let mut options = sql_login();
        options["password"] = json!("");
        let err = build_connection_config(&options).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration error: password is required for default"
        );
    }

    #[test]
    fn test_invalid_typed_fields() {
        let mut options = sql_login();
        options["encrypt"] = json!("yes");
        assert!(build_connection_config(&options).is_err());

        let mut options = sql_login();
        options["port"] = json!(70000);
        assert!(build_connection_config(&options).is_err());

        let mut options = sql_login();
        options["request_timeout"] = json!("soon");
        assert!(build_connection_config(&options).is_err());
    }

    #[test]
    fn test_create_client_config() {
        let connection = build_connection_config(&sql_login()).unwrap();
        let _config = create_client_config(&connection);
        // Config doesn't expose getters, so we just verify it doesn't panic
    }

    #[tokio::test]
    async fn test_password_service_principal_rejected_at_connect() {
        let auth = Authentication::ServicePrincipalPassword {
            user: "u".to_string(),
            password: "p".to_string(),
            client_id: "c".to_string(),
            tenant_id: "t".to_string(),
        };
        let mut config = Config::new();
        let err = configure_auth(&mut config, &auth).await.unwrap_err();
        assert!(matches!(err, ConnectorError::Config(_)));
    }

    #[test]
    fn test_truncate_for_log() {
        assert_eq!(truncate_for_log("short", 10), "short");
        assert_eq!(
            truncate_for_log("this is a long string", 10),
            "this is a ..."
        );
        assert_eq!(truncate_for_log("exactly10!", 10), "exactly10!");
        assert_eq!(truncate_for_log("ééééé", 2), "éé...");
    }
}
