//! Client configuration.
//!
//! [`ClientConfig`] is the typed replacement for an option bag: unknown keys
//! are rejected when deserialising, defaults are explicit, and
//! [`ClientConfig::resolve`] turns it into the validated list of sessions to
//! create. Every failure is a [`ClientError::Configuration`] raised before any
//! socket is opened.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    ClientError, FirstServer, LoadBalancer, RoundRobin, ServerAddress, SessionId, SessionIdScheme,
    DEFAULT_HOST, DEFAULT_MAX_PACKET_SIZE, DEFAULT_PORT,
};

/// Built-in load-balancing strategies selectable from configuration.
///
/// Custom strategies are injected through the client builder instead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancing {
    /// [`FirstServer`].
    #[default]
    First,
    /// [`RoundRobin`].
    RoundRobin,
}

impl LoadBalancing {
    /// Instantiates the selected strategy.
    pub fn build(self) -> Arc<dyn LoadBalancer> {
        match self {
            LoadBalancing::First => Arc::new(FirstServer),
            LoadBalancing::RoundRobin => Arc::new(RoundRobin::default()),
        }
    }
}

/// Construction options for a client.
///
/// Either a single `{host, port}` or an explicit `servers` list; when
/// `servers` is present `host` and `port` are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub servers: Option<Vec<ServerAddress>>,
    #[serde(default)]
    pub load_balancing: LoadBalancing,
    /// Upper bound on establishing one connection, in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Largest argument section accepted from a server, in bytes.
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_max_packet_size() -> usize {
    DEFAULT_MAX_PACKET_SIZE
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            servers: None,
            load_balancing: LoadBalancing::default(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_packet_size: default_max_packet_size(),
        }
    }
}

impl ClientConfig {
    /// Configuration for one server.
    pub fn single(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Configuration for several servers.
    pub fn with_servers(servers: Vec<ServerAddress>) -> Self {
        Self {
            servers: Some(servers),
            ..Self::default()
        }
    }

    pub fn load_balancing(mut self, load_balancing: LoadBalancing) -> Self {
        self.load_balancing = load_balancing;
        self
    }

    /// Parses a JSON configuration document.
    ///
    /// # Errors
    ///
    /// [`ClientError::Configuration`] for malformed JSON, unknown keys or
    /// mistyped values (e.g. `"servers": 1`).
    pub fn from_json_str(json: &str) -> Result<Self, ClientError> {
        serde_json::from_str(json)
            .map_err(|e| ClientError::configuration(format!("invalid client configuration: {e}")))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Returns the validated server list.
    ///
    /// # Errors
    ///
    /// [`ClientError::Configuration`] if `servers` is an empty list, or any
    /// host is empty, any port is zero, the connect timeout is zero, or the
    /// packet size limit is zero.
    pub fn server_addresses(&self) -> Result<Vec<ServerAddress>, ClientError> {
        if self.connect_timeout_ms == 0 {
            return Err(ClientError::configuration("connect_timeout_ms: must be positive"));
        }
        if self.max_packet_size == 0 {
            return Err(ClientError::configuration("max_packet_size: must be positive"));
        }

        let servers = match &self.servers {
            Some(servers) if servers.is_empty() => {
                return Err(ClientError::configuration("servers: empty array"));
            }
            Some(servers) => servers.clone(),
            None => vec![ServerAddress::new(self.host.clone(), self.port)],
        };

        for (i, server) in servers.iter().enumerate() {
            if server.host.trim().is_empty() {
                return Err(ClientError::configuration(format!("servers[{i}].host: empty")));
            }
            if server.port == 0 {
                return Err(ClientError::configuration(format!("servers[{i}].port: must be non-zero")));
            }
        }
        Ok(servers)
    }

    /// Validates the configuration and derives one session id per server.
    ///
    /// # Errors
    ///
    /// Everything [`Self::server_addresses`] rejects, plus a scheme that
    /// yields no id or the same id twice.
    pub fn resolve(
        &self,
        scheme: &dyn SessionIdScheme,
    ) -> Result<Vec<(SessionId, ServerAddress)>, ClientError> {
        let servers = self.server_addresses()?;
        let mut seen = HashSet::new();
        let mut resolved = Vec::with_capacity(servers.len());
        for (i, address) in servers.into_iter().enumerate() {
            let id = scheme.derive(i, &address).ok_or_else(|| {
                ClientError::configuration(format!("servers[{i}]: no session id derived for {address}"))
            })?;
            if !seen.insert(id.clone()) {
                return Err(ClientError::configuration(format!(
                    "servers[{i}]: duplicate session id {id}"
                )));
            }
            resolved.push((id, address));
        }
        tracing::debug!(sessions = resolved.len(), "Resolved job server configuration");
        Ok(resolved)
    }
}
