//! Error types for the doggo-proxy crate.

use thiserror::Error;

/// Errors that can occur in the routing core and the forwarding engine.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Proxy bind failed on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Proxy server is not configured; call configure() before start()")]
    NotConfigured,

    #[error("Proxy server is running; stop it before reconfiguring")]
    ReconfigureWhileRunning,

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Upstream index {index} is out of range ({len} upstreams defined)")]
    UpstreamIndex { index: usize, len: usize },

    #[error("Upstream connection failed to {host}: {reason}")]
    UpstreamConnect { host: String, reason: String },

    #[error("Upstream proxy error: {0}")]
    UpstreamProxy(String),

    #[error("Preference store error: {0}")]
    Preferences(String),

    #[error("HTTP parse error: {0}")]
    HttpParse(String),

    #[error("Proxy shutdown")]
    Shutdown,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
