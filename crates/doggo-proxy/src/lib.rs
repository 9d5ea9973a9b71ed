//! Local forward-proxy routing core for doggo.
//!
//! `doggo-proxy` runs an HTTP proxy on a loopback port and decides, per
//! accepted connection, whether traffic goes straight to the origin or
//! through a chosen upstream proxy:
//!
//! 1. **Upstream selector** (`upstream`) - holds the currently selected
//!    upstream and renders it as a percent-escaped
//!    `user:password@host:port` authority. Readers always see a complete
//!    value.
//!
//! 2. **Proxy controller** (`controller`) - owns the listener lifecycle
//!    (configure, start, stop), the endpoint string, and the
//!    running/stopped status with a single change observer.
//!
//! 3. **Forwarding engine** (`server`, `connect`, `external`) - accepts
//!    connections, resolves the route once per connection, and either
//!    tunnels/forwards directly or chains through the upstream with
//!    `Proxy-Authorization: Basic`.
//!
//! Front ends drive the core through [`command`] and persist choices
//! through a [`preferences::PreferenceStore`].

pub mod audit;
pub mod command;
pub mod config;
pub mod connect;
pub mod controller;
pub mod error;
pub mod external;
pub mod http;
pub mod preferences;
pub mod server;
pub mod upstream;

pub use command::{Command, CommandClient, CommandHandler, CommandResponse, StatusReport};
pub use config::ProxyConfig;
pub use controller::{ProxyController, ServerStatus};
pub use error::{ProxyError, Result};
pub use preferences::{
    InMemoryPreferenceStore, PreferenceStore, ProxyPreference, UpstreamDefinition,
    UpstreamsPreference,
};
pub use server::{EngineHandle, ForwardingEngine};
pub use upstream::{Credentials, UpstreamSelector, UpstreamTarget};
