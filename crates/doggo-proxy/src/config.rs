//! Listener configuration.
//!
//! Describes where the local proxy listens and how chatty it is. The
//! listener endpoint shown to users is derived from this value every time
//! the server is configured and is never stored separately.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};

/// Port used when no preference has been saved yet.
pub const DEFAULT_PORT: u16 = 8080;

/// Configuration for the local proxy listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,

    /// Bind port (0 = OS-assigned ephemeral port)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log every relayed connection at info level instead of debug.
    #[serde(default)]
    pub verbose: bool,

    /// Maximum concurrent connections (0 = unlimited).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: DEFAULT_PORT,
            verbose: false,
            max_connections: default_max_connections(),
        }
    }
}

impl ProxyConfig {
    /// Loopback config on `port`, the shape produced by `configure(port, verbose)`.
    #[must_use]
    pub fn local(port: u16, verbose: bool) -> Self {
        Self {
            port,
            verbose,
            ..Default::default()
        }
    }

    /// Listening address in `scheme://host:port` form.
    ///
    /// Loopback binds are reported as `localhost`, which is what users
    /// paste into their browser or `HTTP_PROXY` settings.
    #[must_use]
    pub fn endpoint(&self) -> String {
        let host = if self.bind_addr.is_loopback() {
            "localhost".to_string()
        } else {
            match self.bind_addr {
                IpAddr::V4(ip) => ip.to_string(),
                IpAddr::V6(ip) => format!("[{}]", ip),
            }
        };
        format!("http://{}:{}", host, self.port)
    }
}

fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_max_connections() -> usize {
    256
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    #[test]
    fn test_default_config() {
        let config = ProxyConfig::default();
        assert_eq!(config.bind_addr, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(!config.verbose);
        assert_eq!(config.max_connections, 256);
    }

    #[test]
    fn test_endpoint_loopback_is_localhost() {
        assert_eq!(ProxyConfig::local(9000, false).endpoint(), "http://localhost:9000");
    }

    #[test]
    fn test_endpoint_non_loopback() {
        let config = ProxyConfig {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 3128,
            ..Default::default()
        };
        assert_eq!(config.endpoint(), "http://0.0.0.0:3128");

        let config = ProxyConfig {
            bind_addr: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            port: 3128,
            ..Default::default()
        };
        assert_eq!(config.endpoint(), "http://[::]:3128");
    }

    #[test]
    fn test_config_deserialize_fills_defaults() {
        let config: ProxyConfig = serde_json::from_str(r#"{"port": 9000}"#).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.bind_addr, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.max_connections, 256);
    }
}
