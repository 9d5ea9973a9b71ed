//! Upstream selection.
//!
//! [`UpstreamSelector`] is the single source of truth for where the next
//! accepted connection goes. It holds one `Option<Arc<UpstreamTarget>>`
//! behind a read/write lock: the accept path clones the `Arc` and never
//! observes a half-written target, while a selection change swaps the
//! whole value.
//!
//! `None` means direct connection. It is an explicit state, never a
//! fallback for a target that failed to validate.

use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Username and password presented to an upstream proxy.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub password: Zeroizing<String>,
}

impl Credentials {
    #[must_use]
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: Zeroizing::new(password.into()),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// An upstream proxy that outgoing connections are relayed through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamTarget {
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
}

impl UpstreamTarget {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            credentials: None,
        }
    }

    #[must_use]
    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials::new(user, password));
        self
    }

    /// Check that the target can be turned into a usable authority.
    ///
    /// The host must parse as a URL host (domain, IPv4, or bracketed IPv6),
    /// the port must be non-zero, and a credential user must be present.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(ProxyError::Validation("host is empty".to_string()));
        }
        url::Host::parse(&self.host).map_err(|e| {
            ProxyError::Validation(format!("malformed host '{}': {}", self.host, e))
        })?;
        if self.port == 0 {
            return Err(ProxyError::Validation(format!(
                "port for '{}' must be between 1 and 65535",
                self.host
            )));
        }
        if let Some(ref creds) = self.credentials {
            if creds.user.is_empty() {
                return Err(ProxyError::Validation(format!(
                    "credentials for '{}' have an empty user",
                    self.host
                )));
            }
            if creds.user.chars().chain(creds.password.chars()).any(char::is_control) {
                return Err(ProxyError::Validation(format!(
                    "credentials for '{}' contain control characters",
                    self.host
                )));
            }
        }
        Ok(())
    }

    /// `host:port` without credentials.
    #[must_use]
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Authority string consumed by the forwarding engine.
    ///
    /// `user:password@host:port` with both user and password
    /// percent-escaped, or `host:port` when there are no credentials.
    #[must_use]
    pub fn authority(&self) -> String {
        match self.credentials {
            Some(ref creds) => format!(
                "{}:{}@{}:{}",
                urlencoding::encode(&creds.user),
                urlencoding::encode(&creds.password),
                self.host,
                self.port
            ),
            None => self.host_port(),
        }
    }
}

/// Holds the currently selected upstream.
#[derive(Debug, Default)]
pub struct UpstreamSelector {
    current: RwLock<Option<Arc<UpstreamTarget>>>,
}

impl UpstreamSelector {
    /// Create a selector in direct-connection mode.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current target.
    ///
    /// A malformed target is rejected here and the previous selection stays
    /// in place. Connections already accepted keep the route they resolved.
    pub fn set_upstream(&self, target: Option<UpstreamTarget>) -> Result<()> {
        if let Some(ref t) = target {
            t.validate()?;
        }
        let next = target.map(Arc::new);
        match next {
            Some(ref t) => info!("Upstream set to {}", t.host_port()),
            None => info!("Upstream cleared, connecting directly"),
        }
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = next;
        Ok(())
    }

    /// Snapshot of the current target.
    #[must_use]
    pub fn get_upstream(&self) -> Option<Arc<UpstreamTarget>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Formatted authority for the current target, `None` for direct.
    ///
    /// Runs on the accept path: one `Arc` clone under the read lock, then
    /// formatting outside it.
    #[must_use]
    pub fn authority(&self) -> Option<String> {
        let target = self.get_upstream()?;
        let authority = target.authority();
        debug!("Resolved upstream {}", target.host_port());
        Some(authority)
    }
}
