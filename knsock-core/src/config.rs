//! Connection, listener and client configuration
//!
//! These are plain values shared by both execution models. Each adapter wraps
//! [`ListenerConfig`] in its own builder that also binds the socket.

use crate::error::{ConfigError, Result};
use crate::protocol::constants::{
    DEFAULT_CLOSE_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_MAX_FRAME_SIZE,
    DEFAULT_MAX_MESSAGE_SIZE,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Default listener address
pub const DEFAULT_BIND_ADDRESS: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8765);

/// Default cap on concurrently open server connections
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

/// Default interval at which the blocking accept loop checks for shutdown
pub const DEFAULT_ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Per-connection limits and policies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Maximum payload of a single incoming frame
    pub max_frame_size: usize,
    /// Maximum size of a reassembled incoming message
    pub max_message_size: usize,
    /// How long `close()` waits for the peer's Close echo
    pub close_timeout: Duration,
    /// Split outgoing data messages into frames of at most this many bytes
    pub fragment_size: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            fragment_size: None,
        }
    }
}

impl Config {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum incoming frame size
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Set the maximum incoming message size
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set the close handshake timeout
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Enable outbound fragmentation with the given frame payload size
    pub fn fragment_size(mut self, size: Option<usize>) -> Self {
        self.fragment_size = size;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_size == 0 {
            return Err(ConfigError::Validation(
                "max_frame_size must be greater than 0".to_string(),
            )
            .into());
        }

        if self.max_message_size < self.max_frame_size {
            return Err(ConfigError::Validation(
                "max_message_size must be greater than or equal to max_frame_size".to_string(),
            )
            .into());
        }

        if self.close_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "close_timeout",
                value: format!("{:?}", self.close_timeout),
            }
            .into());
        }

        if self.fragment_size == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "fragment_size",
                value: "0".to_string(),
            }
            .into());
        }

        Ok(())
    }
}

/// Listener configuration
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Bind address
    pub bind_address: SocketAddr,
    /// Upper bound for reading and answering the upgrade request
    pub handshake_timeout: Duration,
    /// Maximum concurrent connections; further peers are refused
    pub max_connections: usize,
    /// Extra headers appended to every 101 response, in order
    pub extra_headers: Vec<(String, String)>,
    /// How often the blocking accept loop checks for shutdown
    pub accept_poll_interval: Duration,
    /// Per-connection configuration
    pub connection: Config,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            extra_headers: Vec::new(),
            accept_poll_interval: DEFAULT_ACCEPT_POLL_INTERVAL,
            connection: Config::default(),
        }
    }
}

impl ListenerConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(ConfigError::Validation(
                "max_connections must be greater than 0".to_string(),
            )
            .into());
        }

        if self.handshake_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "handshake_timeout",
                value: format!("{:?}", self.handshake_timeout),
            }
            .into());
        }

        if self.accept_poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "accept_poll_interval",
                value: format!("{:?}", self.accept_poll_interval),
            }
            .into());
        }

        validate_headers(&self.extra_headers)?;
        self.connection.validate()
    }
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Request target, `/` by default
    pub resource: String,
    /// Extra headers appended to the upgrade request, in order
    pub extra_headers: Vec<(String, String)>,
    /// Upper bound for the whole upgrade exchange
    pub handshake_timeout: Duration,
    /// Per-connection configuration
    pub connection: Config,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            resource: "/".to_string(),
            extra_headers: Vec::new(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            connection: Config::default(),
        }
    }
}

impl ClientConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the request target
    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = resource.into();
        self
    }

    /// Append a header to the upgrade request
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }

    /// Set the handshake timeout
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the per-connection configuration
    pub fn connection_config(mut self, config: Config) -> Self {
        self.connection = config;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !self.resource.starts_with('/') {
            return Err(ConfigError::InvalidValue {
                field: "resource",
                value: self.resource.clone(),
            }
            .into());
        }

        if self.handshake_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "handshake_timeout",
                value: format!("{:?}", self.handshake_timeout),
            }
            .into());
        }

        validate_headers(&self.extra_headers)?;
        self.connection.validate()
    }
}

fn validate_headers(headers: &[(String, String)]) -> Result<()> {
    for (name, value) in headers {
        if http::HeaderName::from_bytes(name.as_bytes()).is_err() {
            return Err(ConfigError::InvalidValue {
                field: "header name",
                value: name.clone(),
            }
            .into());
        }
        if http::HeaderValue::from_str(value).is_err() {
            return Err(ConfigError::InvalidValue {
                field: "header value",
                value: value.clone(),
            }
            .into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.max_frame_size, 16 * 1024 * 1024);
        assert_eq!(config.max_message_size, 64 * 1024 * 1024);
        assert_eq!(config.close_timeout, Duration::from_secs(5));
        assert_eq!(config.fragment_size, None);
        assert!(config.validate().is_ok());

        let listener = ListenerConfig::default();
        assert_eq!(listener.bind_address.to_string(), "127.0.0.1:8765");
        assert_eq!(listener.handshake_timeout, Duration::from_secs(10));
        assert_eq!(listener.max_connections, 10_000);
        assert!(listener.validate().is_ok());

        assert_eq!(ClientConfig::default().resource, "/");
    }

    #[test]
    fn test_config_validation() {
        assert!(Config::new().max_frame_size(0).validate().is_err());
        assert!(Config::new()
            .max_frame_size(1024)
            .max_message_size(512)
            .validate()
            .is_err());
        assert!(Config::new().fragment_size(Some(0)).validate().is_err());
        assert!(Config::new().close_timeout(Duration::ZERO).validate().is_err());

        let listener = ListenerConfig {
            max_connections: 0,
            ..Default::default()
        };
        assert!(listener.validate().is_err());
    }

    #[test]
    fn test_client_config_validation() {
        assert!(ClientConfig::new().resource("chat").validate().is_err());
        assert!(ClientConfig::new()
            .header("Bad Name", "x")
            .validate()
            .is_err());
        assert!(ClientConfig::new()
            .resource("/chat")
            .header("X-Token", "abc")
            .validate()
            .is_ok());
    }
}
