//! Forwarding engine: TCP listener, per-connection routing, and teardown.
//!
//! The engine binds `config.bind_addr:config.port`, accepts TCP
//! connections, and for every accepted connection calls the resolve
//! callback exactly once. The resulting [`Route`] is captured in the
//! connection's [`ConnectionContext`] and never re-read, so changing the
//! selected upstream only affects connections accepted afterwards.
//!
//! CONNECT method         -> [`connect`] (direct) or [`external`] (upstream)
//! Absolute-form request  -> same split, forwarding instead of tunnelling
//! Anything else          -> 400

use crate::config::ProxyConfig;
use crate::connect;
use crate::error::{ProxyError, Result};
use crate::external::{self, UpstreamAuthority};
use crate::http::{self, ReadHead};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Per-connection hook returning the upstream authority, `None` for direct.
pub type ResolveUpstream = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// Destination decided for one accepted connection.
#[derive(Debug, Clone)]
pub enum Route {
    /// Connect to the requested origin
    Direct,
    /// Relay through an upstream proxy
    Upstream(UpstreamAuthority),
}

impl Route {
    /// Turn a resolve-callback result into a route.
    ///
    /// An authority that does not parse is an error, never a silent
    /// fallback to direct.
    pub fn from_authority(authority: Option<&str>) -> Result<Self> {
        match authority {
            Some(authority) => Ok(Route::Upstream(UpstreamAuthority::parse(authority)?)),
            None => Ok(Route::Direct),
        }
    }
}

/// What the engine knows about one connection, fixed at accept time.
#[derive(Debug)]
pub struct ConnectionContext {
    pub peer: SocketAddr,
    pub route: Route,
    pub verbose: bool,
}

struct EngineState {
    config: ProxyConfig,
    resolve_upstream: ResolveUpstream,
}

/// A configured, not yet listening forwarding engine.
///
/// `listen()` may be called again after the previous handle was closed.
#[derive(Clone)]
pub struct ForwardingEngine {
    state: Arc<EngineState>,
}

impl std::fmt::Debug for ForwardingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardingEngine")
            .field("config", &self.state.config)
            .finish_non_exhaustive()
    }
}

impl ForwardingEngine {
    #[must_use]
    pub fn new(config: ProxyConfig, resolve_upstream: ResolveUpstream) -> Self {
        Self {
            state: Arc::new(EngineState {
                config,
                resolve_upstream,
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ProxyConfig {
        &self.state.config
    }

    /// Run the resolve callback, as the accept path does for each connection.
    #[must_use]
    pub fn resolve_upstream(&self) -> Option<String> {
        (self.state.resolve_upstream)()
    }

    /// Bind the listener and start accepting.
    ///
    /// Returning `Ok` is the "listening" signal: the socket is bound and
    /// the accept loop is running.
    pub async fn listen(&self) -> Result<EngineHandle> {
        let config = &self.state.config;
        let bind_addr = SocketAddr::new(config.bind_addr, config.port);
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| ProxyError::Bind {
                port: config.port,
                source: e,
            })?;

        let local_addr = listener.local_addr().map_err(|e| ProxyError::Bind {
            port: config.port,
            source: e,
        })?;

        info!("Proxy server listening on {}", local_addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(listener, Arc::clone(&self.state), shutdown_rx));

        Ok(EngineHandle {
            local_addr,
            shutdown_tx,
            task,
        })
    }
}

/// Handle to a listening engine.
///
/// Dropping the handle stops the accept loop and aborts all connections.
pub struct EngineHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<JoinSet<()>>,
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl EngineHandle {
    /// The address the listener is actually bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Close the listener.
    ///
    /// With `force`, every open connection is aborted; otherwise the call
    /// waits for them to finish on their own. Returning is the "closed"
    /// signal: the listening socket is released.
    pub async fn close(self, force: bool) {
        let _ = self.shutdown_tx.send(true);

        let mut connections = match self.task.await {
            Ok(connections) => connections,
            Err(e) => {
                warn!("Accept loop ended abnormally: {}", e);
                return;
            }
        };

        if force {
            connections.abort_all();
        }
        while connections.join_next().await.is_some() {}

        info!("Proxy server on {} closed", self.local_addr);
    }
}

/// Accept loop: listen for connections until shutdown.
///
/// Returns the set of still-running connection tasks so the caller decides
/// whether to abort or drain them. The listener is dropped on return.
async fn accept_loop(
    listener: TcpListener,
    state: Arc<EngineState>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinSet<()> {
    let mut connections = JoinSet::new();
    let verbose = state.config.verbose;

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let max = state.config.max_connections;
                        if max > 0 && connections.len() >= max {
                            warn!("Connection limit reached ({}/{}), rejecting {}", connections.len(), max, peer);
                            drop(stream);
                            continue;
                        }

                        let resolved = (state.resolve_upstream)();
                        let route = match Route::from_authority(resolved.as_deref()) {
                            Ok(route) => route,
                            Err(e) => {
                                warn!("Rejecting {}: {}", peer, e);
                                drop(stream);
                                continue;
                            }
                        };

                        debug!("Accepted connection from {} ({:?})", peer, route);
                        let ctx = ConnectionContext { peer, route, verbose };
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(stream, &ctx).await {
                                debug!("Connection handler error for {}: {}", ctx.peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Accept error: {}", e);
                    }
                }
            }
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        warn!("Connection task panicked: {}", e);
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Proxy server shutting down");
                    return connections;
                }
            }
        }
    }
}

/// Handle a single client connection along its pre-resolved route.
async fn handle_connection(mut stream: TcpStream, ctx: &ConnectionContext) -> Result<()> {
    let head = match http::read_request_head(&mut stream).await? {
        ReadHead::Head(head) => head,
        ReadHead::Closed => return Ok(()),
        ReadHead::TooLarge => {
            http::send_response(&mut stream, 431, "Request Header Fields Too Large").await?;
            return Ok(());
        }
    };

    if head.request_line.starts_with("CONNECT ") {
        let (host, port) = match http::parse_connect_target(&head.request_line) {
            Ok(target) => target,
            Err(e) => {
                http::send_response(&mut stream, 400, "Bad Request").await?;
                return Err(e);
            }
        };
        match ctx.route {
            Route::Direct => {
                connect::handle_connect(&mut stream, &host, port, &head.buffered, ctx.verbose)
                    .await
            }
            Route::Upstream(ref upstream) => {
                external::handle_connect(
                    &mut stream,
                    &host,
                    port,
                    &head.buffered,
                    upstream,
                    ctx.verbose,
                )
                .await
            }
        }
    } else if is_absolute_form(&head.request_line) {
        match ctx.route {
            Route::Direct => connect::handle_forward(&mut stream, &head, ctx.verbose).await,
            Route::Upstream(ref upstream) => {
                external::handle_forward(&mut stream, &head, upstream, ctx.verbose).await
            }
        }
    } else {
        // Origin-form request addressed to the proxy itself
        http::send_response(&mut stream, 400, "Bad Request").await?;
        Ok(())
    }
}

fn is_absolute_form(request_line: &str) -> bool {
    http::parse_request_line(request_line)
        .map(|(_, target, _)| target.starts_with("http://") || target.starts_with("https://"))
        .unwrap_or(false)
}
