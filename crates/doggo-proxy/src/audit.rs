//! Audit logging for relayed connections.
//!
//! Logs every relay decision with structured fields via `tracing`.
//! Upstream credentials and `Proxy-Authorization` values are never
//! included; an upstream is identified by `host:port` only.
//!
//! When the server is configured `verbose`, records are emitted at info
//! level; otherwise at debug, so they only show up when asked for.

use tracing::{debug, info};

/// How a connection reached its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    /// Straight to the requested origin
    Direct,
    /// Through the selected upstream proxy
    Upstream,
}

impl std::fmt::Display for RelayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayMode::Direct => write!(f, "direct"),
            RelayMode::Upstream => write!(f, "upstream"),
        }
    }
}

/// Log a connection that was relayed.
///
/// `via` is the upstream `host:port` for [`RelayMode::Upstream`].
pub fn log_relayed(verbose: bool, mode: RelayMode, method: &str, target: &str, via: Option<&str>) {
    let via = via.unwrap_or("-");
    if verbose {
        info!(
            target: "doggo_proxy::audit",
            mode = %mode,
            method = method,
            target = target,
            via = via,
            "connection relayed"
        );
    } else {
        debug!(
            target: "doggo_proxy::audit",
            mode = %mode,
            method = method,
            target = target,
            via = via,
            "connection relayed"
        );
    }
}

/// Log a connection that could not be relayed.
pub fn log_failed(verbose: bool, mode: RelayMode, target: &str, reason: &str) {
    if verbose {
        info!(
            target: "doggo_proxy::audit",
            mode = %mode,
            target = target,
            reason = reason,
            "connection failed"
        );
    } else {
        debug!(
            target: "doggo_proxy::audit",
            mode = %mode,
            target = target,
            reason = reason,
            "connection failed"
        );
    }
}
