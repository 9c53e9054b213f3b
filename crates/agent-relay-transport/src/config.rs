//! Relay server and client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default relay port.
pub const DEFAULT_PORT: u16 = 4722;

/// Relay server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayServerConfig {
    pub host: String,
    /// `0` binds an ephemeral port.
    pub port: u16,
    /// Fail a run whose handler stays silent this long. `None` waits forever.
    pub handler_idle_timeout_secs: Option<u64>,
    /// Largest accepted WebSocket message, in bytes.
    pub max_message_size: usize,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            handler_idle_timeout_secs: None,
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

impl RelayServerConfig {
    /// `host:port` to bind.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[must_use]
    pub fn handler_idle_timeout(&self) -> Option<Duration> {
        self.handler_idle_timeout_secs.map(Duration::from_secs)
    }
}

/// Relay client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayClientConfig {
    /// WebSocket endpoint of the relay.
    pub url: String,
    /// Delay between reconnect attempts after an unexpected close.
    pub reconnect_interval_ms: u64,
    /// How long `check_connection` waits for the first handler list.
    pub handshake_timeout_ms: u64,
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        Self {
            url: format!("ws://127.0.0.1:{DEFAULT_PORT}/ws"),
            reconnect_interval_ms: 3000,
            handshake_timeout_ms: 1000,
        }
    }
}

impl RelayClientConfig {
    /// Client config pointing at `url`.
    #[must_use]
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults() {
        let config = RelayServerConfig::default();
        assert_eq!(config.bind_addr(), "127.0.0.1:4722");
        assert!(config.handler_idle_timeout().is_none());
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: RelayServerConfig =
            serde_json::from_str(r#"{"port":0,"handler_idle_timeout_secs":5}"#).unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.handler_idle_timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn client_defaults_target_local_relay() {
        let config = RelayClientConfig::default();
        assert_eq!(config.url, "ws://127.0.0.1:4722/ws");
        assert_eq!(config.reconnect_interval(), Duration::from_secs(3));
    }
}
