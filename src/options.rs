//! Declarative description of the connection options.
//!
//! Hosts render credential forms from this schema. Field order is
//! significant and preserved when serialised. Authentication specific fields
//! are nested under the matching `authenticationType` choice.

use crate::config::Authentication;
use crate::constants::{DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_PORT, DEFAULT_REQUEST_TIMEOUT_MS};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use serde_json::{json, Value};

/// Input kind of an option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionType {
    String,
    Number,
    Boolean,
    Select,
}

/// One selectable value of a [`OptionType::Select`] option.
#[derive(Debug, Clone, Serialize)]
pub struct Choice {
    pub value: &'static str,
    pub title: &'static str,
    #[serde(skip_serializing_if = "OptionGroup::is_empty")]
    pub children: OptionGroup,
}

/// Description of a single option.
#[derive(Debug, Clone, Serialize)]
pub struct OptionSpec {
    pub title: &'static str,
    #[serde(rename = "type")]
    pub kind: OptionType,
    pub secret: bool,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<&'static str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<Choice>,
}

impl OptionSpec {
    fn new(title: &'static str, kind: OptionType) -> Self {
        Self {
            title,
            kind,
            secret: false,
            required: false,
            default: None,
            description: None,
            options: Vec::new(),
        }
    }

    pub fn string(title: &'static str) -> Self {
        Self::new(title, OptionType::String)
    }

    pub fn number(title: &'static str) -> Self {
        Self::new(title, OptionType::Number)
    }

    pub fn boolean(title: &'static str) -> Self {
        Self::new(title, OptionType::Boolean)
    }

    pub fn select(title: &'static str, options: Vec<Choice>) -> Self {
        Self {
            options,
            ..Self::new(title, OptionType::Select)
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn secret(mut self) -> Self {
        self.secret = true;
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn describe(mut self, description: &'static str) -> Self {
        self.description = Some(description);
        self
    }
}

/// Ordered set of named options. Serialises as a JSON object.
#[derive(Debug, Clone, Default)]
pub struct OptionGroup(Vec<(&'static str, OptionSpec)>);

impl OptionGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &'static str, spec: OptionSpec) -> Self {
        self.0.push((key, spec));
        self
    }

    pub fn get(&self, key: &str) -> Option<&OptionSpec> {
        self.0.iter().find(|(k, _)| *k == key).map(|(_, spec)| spec)
    }

    pub fn keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.0.iter().map(|(k, _)| *k)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &OptionSpec)> {
        self.0.iter().map(|(k, spec)| (*k, spec))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for OptionGroup {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, spec) in &self.0 {
            map.serialize_entry(key, spec)?;
        }
        map.end()
    }
}

/// Top-level options schema.
pub type OptionsSchema = OptionGroup;

fn authentication_choices() -> Vec<Choice> {
    let user = || OptionSpec::string("User").required();
    let password = || OptionSpec::string("Password").required().secret();
    let tenant_id = || OptionSpec::string("Tenant ID").required();
    let client_id = || OptionSpec::string("Client ID").required();

    vec![
        Choice {
            value: Authentication::SQL_LOGIN,
            title: "Username and password",
            children: OptionGroup::new()
                .with("user", user())
                .with("password", password()),
        },
        Choice {
            value: Authentication::MANAGED_IDENTITY_DEFAULT,
            title: "Azure AD default credentials",
            children: OptionGroup::new().with(
                "clientId",
                OptionSpec::string("Client ID")
                    .describe("Client ID of a user-assigned managed identity"),
            ),
        },
        Choice {
            value: Authentication::ACCESS_TOKEN,
            title: "Azure AD access token",
            children: OptionGroup::new()
                .with("token", OptionSpec::string("Access token").required().secret()),
        },
        Choice {
            value: Authentication::SERVICE_PRINCIPAL_PASSWORD,
            title: "Azure AD username and password",
            children: OptionGroup::new()
                .with("user", user())
                .with("password", password())
                .with("clientId", client_id())
                .with("tenantId", tenant_id()),
        },
        Choice {
            value: Authentication::SERVICE_PRINCIPAL_SECRET,
            title: "Azure AD service principal",
            children: OptionGroup::new()
                .with("clientId", client_id())
                .with(
                    "clientSecret",
                    OptionSpec::string("Client secret").required().secret(),
                )
                .with("tenantId", tenant_id()),
        },
    ]
}

/// The connection options schema.
pub fn options_schema() -> OptionsSchema {
    OptionGroup::new()
        .with(
            "server",
            OptionSpec::string("Server")
                .required()
                .describe("Hostname or IP address of the SQL Server"),
        )
        .with("database", OptionSpec::string("Database").required())
        .with(
            "port",
            OptionSpec::number("Port").default_value(json!(DEFAULT_PORT)),
        )
        .with(
            "authenticationType",
            OptionSpec::select("Authentication", authentication_choices())
                .required()
                .default_value(json!(Authentication::SQL_LOGIN)),
        )
        .with(
            "trust_server_certificate",
            OptionSpec::boolean("Trust server certificate")
                .default_value(json!(false))
                .describe("Accept self-signed server certificates"),
        )
        .with(
            "encrypt",
            OptionSpec::boolean("Encrypt connection").default_value(json!(true)),
        )
        .with(
            "connection_timeout",
            OptionSpec::number("Connection timeout (ms)")
                .default_value(json!(DEFAULT_CONNECT_TIMEOUT_MS))
                .describe("0 disables the limit"),
        )
        .with(
            "request_timeout",
            OptionSpec::number("Request timeout (ms)")
                .default_value(json!(DEFAULT_REQUEST_TIMEOUT_MS))
                .describe("Limit for the count estimate and first columns, 0 disables it"),
        )
}
