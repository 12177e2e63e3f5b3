// Copyright (c) 2026 FlowPro
// SPDX-License-Identifier: AGPL-3.0

//! Gateway configuration.
//!
//! Everything is environment-derived with defaults; `Configure` merges a
//! partial update into the live configuration, keeping any value the
//! update leaves unset. `not_fail_fast_if_offline` is deliberately
//! tri-state so an absent field never flips the current behavior.

use std::env;
use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::domain::identity::{AgentIdentity, DEFAULT_AGENT_NAME};

pub const DEFAULT_GRPC_PORT: u16 = 50060;
pub const DEFAULT_NAMESPACE: &str = "tnc";

const ENV_GRPC_PORT: &str = "TNC_GRPC_PORT";
const ENV_CONNECTION_URL: &str = "TNC_CONNECTION_URL";
const ENV_NAMESPACE: &str = "TNC_NAMESPACE";
const ENV_IDENTITY_NAME: &str = "TNC_IDENTITY_NAME";
const ENV_IDENTITY_ID: &str = "TNC_IDENTITY_ID";
const ENV_USERNAME: &str = "TNC_USERNAME";
const ENV_PASSWORD: &str = "TNC_PASSWORD";
const ENV_TLS_CERT: &str = "TNC_TLS_CERT";
const ENV_TLS_KEY: &str = "TNC_TLS_KEY";
const ENV_VERIFY_SERVER_CERT: &str = "TNC_VERIFY_SERVER_CERT";
const ENV_FAIL_FAST_IF_OFFLINE: &str = "TNC_FAIL_FAST_IF_OFFLINE";
const ENV_CONSENSUS_DB_FOLDER: &str = "TNC_CONSENSUS_DB_FOLDER";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{variable} is not a valid port: {value}")]
    InvalidPort { variable: &'static str, value: String },

    #[error("{variable} is not a valid boolean: {value}")]
    InvalidBool { variable: &'static str, value: String },

    #[error("agent identity id is not a valid uuid: {0}")]
    InvalidIdentityId(String),
}

/// Transport-level parameters of the bus connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusOptions {
    /// `mqtt://`, `mqtts://`, `ws://` or `wss://` URL. While unset the
    /// bus never autostarts.
    pub connection_url: Option<String>,
    pub namespace: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// PEM string or path to a PEM file.
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub verify_server_cert: bool,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            connection_url: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            username: None,
            password: None,
            tls_cert: None,
            tls_key: None,
            verify_server_cert: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub grpc_port: u16,
    pub identity: AgentIdentity,
    pub bus: BusOptions,
    pub fail_fast_if_offline: bool,
    pub consensus_db_folder: PathBuf,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            grpc_port: DEFAULT_GRPC_PORT,
            identity: AgentIdentity::new(Uuid::new_v4(), DEFAULT_AGENT_NAME),
            bus: BusOptions::default(),
            fail_fast_if_offline: true,
            consensus_db_folder: PathBuf::from("."),
        }
    }
}

impl GatewayConfig {
    /// Builds the configuration from the process environment. Every
    /// variable is optional.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(port) = non_empty(ENV_GRPC_PORT) {
            config.grpc_port = port.parse().map_err(|_| ConfigError::InvalidPort {
                variable: ENV_GRPC_PORT,
                value: port.clone(),
            })?;
        }
        config.bus.connection_url = non_empty(ENV_CONNECTION_URL);
        if let Some(namespace) = non_empty(ENV_NAMESPACE) {
            config.bus.namespace = namespace;
        }
        if let Some(name) = non_empty(ENV_IDENTITY_NAME) {
            config.identity.name = name;
        }
        if let Some(id) = non_empty(ENV_IDENTITY_ID) {
            config.identity.id = id
                .parse()
                .map_err(|_| ConfigError::InvalidIdentityId(id.clone()))?;
        }
        config.bus.username = non_empty(ENV_USERNAME);
        config.bus.password = non_empty(ENV_PASSWORD);
        config.bus.tls_cert = non_empty(ENV_TLS_CERT);
        config.bus.tls_key = non_empty(ENV_TLS_KEY);
        if let Some(value) = non_empty(ENV_VERIFY_SERVER_CERT) {
            config.bus.verify_server_cert = parse_bool(ENV_VERIFY_SERVER_CERT, &value)?;
        }
        if let Some(value) = non_empty(ENV_FAIL_FAST_IF_OFFLINE) {
            config.fail_fast_if_offline = parse_bool(ENV_FAIL_FAST_IF_OFFLINE, &value)?;
        }
        if let Some(folder) = non_empty(ENV_CONSENSUS_DB_FOLDER) {
            config.consensus_db_folder = PathBuf::from(folder);
        }

        Ok(config)
    }

    /// Merges a partial update. Returns true when the agent identity (id
    /// or name) changed, which forces a new bus client rather than a
    /// restart of the existing one.
    pub fn apply(&mut self, update: ConfigureUpdate) -> Result<bool, ConfigError> {
        let before = self.identity.clone();

        if let Some(url) = update.connection_url {
            self.bus.connection_url = Some(url);
        }
        if let Some(namespace) = update.namespace {
            self.bus.namespace = namespace;
        }
        if let Some(name) = update.identity_name {
            self.identity.name = name;
        }
        if let Some(id) = update.identity_id {
            self.identity.id = id
                .parse()
                .map_err(|_| ConfigError::InvalidIdentityId(id.clone()))?;
        }
        if let Some(username) = update.username {
            self.bus.username = Some(username);
        }
        if let Some(password) = update.password {
            self.bus.password = Some(password);
        }
        if let Some(cert) = update.tls_cert {
            self.bus.tls_cert = Some(cert);
        }
        if let Some(key) = update.tls_key {
            self.bus.tls_key = Some(key);
        }
        if let Some(verify) = update.verify_server_cert {
            self.bus.verify_server_cert = verify;
        }
        if let Some(not_fail_fast) = update.not_fail_fast_if_offline {
            self.fail_fast_if_offline = !not_fail_fast;
        }

        Ok(self.identity.id != before.id || self.identity.name != before.name)
    }
}

/// Partial configuration as received over `Configure`. Unset fields keep
/// their prior values.
#[derive(Debug, Clone, Default)]
pub struct ConfigureUpdate {
    pub connection_url: Option<String>,
    pub namespace: Option<String>,
    pub identity_name: Option<String>,
    pub identity_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub verify_server_cert: Option<bool>,
    pub not_fail_fast_if_offline: Option<bool>,
}

fn non_empty(variable: &str) -> Option<String> {
    env::var(variable).ok().filter(|v| !v.is_empty())
}

fn parse_bool(variable: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            variable,
            value: value.to_string(),
        }),
    }
}
