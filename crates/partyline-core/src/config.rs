//! Connection configuration consumed by transport implementations.

use serde::{Deserialize, Serialize};

/// Broker connection settings.
///
/// Endpoints may be a single `uri` or a `servers` list; the list wins when
/// both are set. Retry policy defaults to reconnecting forever with
/// server-list shuffling on. Pacing and credential handling belong to the
/// transport, which consumes this struct at connect time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Single broker endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    /// Broker endpoints; takes precedence over `uri` when non-empty.
    #[serde(default, alias = "uris", skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<String>,
    /// Reconnect attempts before the transport gives up. `None` retries
    /// forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_reconnect_attempts: Option<u32>,
    /// Shuffle the server list before connecting.
    #[serde(default = "default_randomize")]
    pub randomize_servers: bool,
}

fn default_randomize() -> bool {
    true
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            uri: None,
            servers: Vec::new(),
            max_reconnect_attempts: None,
            randomize_servers: true,
        }
    }
}

impl BusConfig {
    /// Config pointing at a single endpoint.
    #[must_use]
    pub fn with_uri(uri: impl Into<String>) -> Self {
        Self {
            uri: Some(uri.into()),
            ..Self::default()
        }
    }

    /// Config pointing at an endpoint list.
    #[must_use]
    pub fn with_servers<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            servers: servers.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Endpoints in connection order: the server list when present,
    /// otherwise the single URI.
    #[must_use]
    pub fn endpoints(&self) -> Vec<String> {
        if self.servers.is_empty() {
            self.uri.clone().into_iter().collect()
        } else {
            self.servers.clone()
        }
    }
}
