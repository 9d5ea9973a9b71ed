//! Proxy controller: listener lifecycle and status.
//!
//! ```text
//! Stopped --start()--> Running --stop()--> Stopped
//! ```
//!
//! The controller owns the forwarding engine and its listening handle. It
//! wires the engine's resolve callback to the shared [`UpstreamSelector`],
//! so selection changes reach new connections without touching the
//! listener.
//!
//! `configure()` on a running server is rejected with
//! [`ProxyError::ReconfigureWhileRunning`]; callers that want a new port
//! stop, configure, and start explicitly.

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::server::{EngineHandle, ForwardingEngine, ResolveUpstream};
use crate::upstream::UpstreamSelector;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, info};

/// Whether the listener is up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    #[default]
    Stopped,
    Running,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerStatus::Stopped => write!(f, "stopped"),
            ServerStatus::Running => write!(f, "running"),
        }
    }
}

/// Observer invoked on every status transition.
pub type StatusCallback = Arc<dyn Fn(ServerStatus) + Send + Sync>;

#[derive(Default)]
struct Lifecycle {
    engine: Option<ForwardingEngine>,
    running: Option<EngineHandle>,
}

/// Owns the local proxy listener and reports its status.
///
/// The status observer is a single slot: registering a new callback
/// replaces the previous one. The tray-style front end is the only
/// consumer, so there is no subscriber list.
pub struct ProxyController {
    selector: Arc<UpstreamSelector>,
    lifecycle: AsyncMutex<Lifecycle>,
    endpoint: RwLock<Option<String>>,
    status: watch::Sender<ServerStatus>,
    on_status_change: Mutex<Option<StatusCallback>>,
}

impl fmt::Debug for ProxyController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyController")
            .field("status", &self.status())
            .field("endpoint", &self.current_endpoint())
            .finish_non_exhaustive()
    }
}

impl ProxyController {
    /// Create a stopped, unconfigured controller routing through `selector`.
    #[must_use]
    pub fn new(selector: Arc<UpstreamSelector>) -> Self {
        let (status, _) = watch::channel(ServerStatus::Stopped);
        Self {
            selector,
            lifecycle: AsyncMutex::new(Lifecycle::default()),
            endpoint: RwLock::new(None),
            status,
            on_status_change: Mutex::new(None),
        }
    }

    /// The selector consulted for every new connection.
    #[must_use]
    pub fn selector(&self) -> &Arc<UpstreamSelector> {
        &self.selector
    }

    /// Configure a loopback listener on `port`.
    pub async fn configure(&self, port: u16, verbose: bool) -> Result<()> {
        self.configure_with(ProxyConfig::local(port, verbose)).await
    }

    /// (Re)create the forwarding engine from `config`.
    ///
    /// Only allowed while stopped.
    pub async fn configure_with(&self, config: ProxyConfig) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.running.is_some() {
            return Err(ProxyError::ReconfigureWhileRunning);
        }

        let selector = Arc::clone(&self.selector);
        let resolve: ResolveUpstream = Arc::new(move || selector.authority());

        let endpoint = config.endpoint();
        debug!("Proxy init config: {:?}", config);
        info!("New proxy server endpoint: {}", endpoint);

        lifecycle.engine = Some(ForwardingEngine::new(config, resolve));
        *self.endpoint.write().unwrap_or_else(PoisonError::into_inner) = Some(endpoint);
        Ok(())
    }

    /// Bind the listener and transition to Running.
    ///
    /// A no-op when already running. On bind failure the status stays
    /// Stopped and the error is returned.
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.running.is_some() {
            debug!("Proxy server already running");
            return Ok(());
        }

        let engine = lifecycle.engine.as_ref().ok_or(ProxyError::NotConfigured)?;
        let handle = engine.listen().await?;
        info!("Proxy server is listening on port {}", handle.local_addr().port());

        lifecycle.running = Some(handle);
        self.set_status(ServerStatus::Running);
        Ok(())
    }

    /// Close the listener, abort open connections, and transition to Stopped.
    ///
    /// A no-op when already stopped.
    pub async fn stop(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(handle) = lifecycle.running.take() else {
            debug!("Proxy server already stopped");
            return Ok(());
        };

        handle.close(true).await;
        info!("Proxy server was closed");

        self.set_status(ServerStatus::Stopped);
        Ok(())
    }

    /// Listening address (`http://localhost:PORT`) once configured.
    ///
    /// Independent of run state.
    #[must_use]
    pub fn current_endpoint(&self) -> Option<String> {
        self.endpoint
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The address actually bound, while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle
            .lock()
            .await
            .running
            .as_ref()
            .map(EngineHandle::local_addr)
    }

    #[must_use]
    pub fn status(&self) -> ServerStatus {
        *self.status.borrow()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status() == ServerStatus::Running
    }

    /// Register the status observer, replacing any previous one.
    pub fn on_status_change<F>(&self, callback: F)
    where
        F: Fn(ServerStatus) + Send + Sync + 'static,
    {
        *self
            .on_status_change
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    fn set_status(&self, next: ServerStatus) {
        let previous = self.status.send_replace(next);
        if previous == next {
            return;
        }
        debug!("Proxy status {} -> {}", previous, next);
        // Called outside the slot lock so the observer may re-register.
        let callback = self
            .on_status_change
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(next);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::upstream::UpstreamTarget;
    use tokio::net::TcpListener;

    fn controller() -> ProxyController {
        ProxyController::new(Arc::new(UpstreamSelector::new()))
    }

    fn recorder(controller: &ProxyController) -> Arc<Mutex<Vec<ServerStatus>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        controller.on_status_change(move |status| sink.lock().unwrap().push(status));
        events
    }

    async fn free_port() -> u16 {
        let spare = TcpListener::bind("127.0.0.1:0").await.unwrap();
        spare.local_addr().unwrap().port()
    }

    async fn resolve_new_connection(controller: &ProxyController) -> Option<String> {
        let lifecycle = controller.lifecycle.lock().await;
        lifecycle.engine.as_ref().unwrap().resolve_upstream()
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&ServerStatus::Running).unwrap(), "\"running\"");
        assert_eq!(ServerStatus::Stopped.to_string(), "stopped");
    }

    #[tokio::test]
    async fn test_initial_state() {
        let controller = controller();
        assert_eq!(controller.status(), ServerStatus::Stopped);
        assert!(!controller.is_running());
        assert!(controller.current_endpoint().is_none());
        assert!(controller.local_addr().await.is_none());
    }

    #[tokio::test]
    async fn test_start_before_configure_fails() {
        let controller = controller();
        let events = recorder(&controller);
        let err = controller.start().await.unwrap_err();
        assert!(matches!(err, ProxyError::NotConfigured));
        assert!(!controller.is_running());
        assert!(events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_endpoint_reported_before_start() {
        let controller = controller();
        controller.configure(9000, false).await.unwrap();
        assert_eq!(
            controller.current_endpoint().as_deref(),
            Some("http://localhost:9000")
        );
        assert!(!controller.is_running());
    }

    #[tokio::test]
    async fn test_routing_scenario() {
        let controller = controller();
        let events = recorder(&controller);
        let port = free_port().await;

        controller.configure(port, false).await.unwrap();
        controller.start().await.unwrap();
        assert!(controller.is_running());
        assert_eq!(
            controller.current_endpoint(),
            Some(format!("http://localhost:{}", port))
        );
        assert_eq!(controller.local_addr().await.unwrap().port(), port);

        controller
            .selector()
            .set_upstream(Some(UpstreamTarget::new("proxy.example", 3128)))
            .unwrap();
        assert_eq!(
            resolve_new_connection(&controller).await.as_deref(),
            Some("proxy.example:3128")
        );

        controller.selector().set_upstream(None).unwrap();
        assert!(resolve_new_connection(&controller).await.is_none());

        controller.stop().await.unwrap();
        assert_eq!(controller.status(), ServerStatus::Stopped);
        assert_eq!(
            controller.current_endpoint(),
            Some(format!("http://localhost:{}", port))
        );
        assert_eq!(
            *events.lock().unwrap(),
            vec![ServerStatus::Running, ServerStatus::Stopped]
        );
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let controller = controller();
        let events = recorder(&controller);
        controller.configure(0, false).await.unwrap();

        controller.start().await.unwrap();
        let first = controller.local_addr().await.unwrap();
        controller.start().await.unwrap();
        let second = controller.local_addr().await.unwrap();

        assert_eq!(first, second);
        assert!(controller.is_running());
        assert_eq!(*events.lock().unwrap(), vec![ServerStatus::Running]);

        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_silent() {
        let controller = controller();
        let events = recorder(&controller);

        controller.stop().await.unwrap();
        controller.configure(0, false).await.unwrap();
        controller.stop().await.unwrap();

        assert!(events.lock().unwrap().is_empty());

        controller.start().await.unwrap();
        controller.stop().await.unwrap();
        controller.stop().await.unwrap();
        assert_eq!(
            *events.lock().unwrap(),
            vec![ServerStatus::Running, ServerStatus::Stopped]
        );
    }

    #[tokio::test]
    async fn test_bind_failure_keeps_stopped() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = occupied.local_addr().unwrap().port();

        let controller = controller();
        let events = recorder(&controller);
        controller.configure(port, false).await.unwrap();

        let err = controller.start().await.unwrap_err();
        match err {
            ProxyError::Bind { port: p, .. } => assert_eq!(p, port),
            other => panic!("expected bind error, got {other}"),
        }
        assert!(!controller.is_running());
        assert!(controller.local_addr().await.is_none());
        assert!(events.lock().unwrap().is_empty());

        // Once the port frees up the same configuration starts fine.
        drop(occupied);
        controller.start().await.unwrap();
        assert!(controller.is_running());
        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_reconfigure_while_running_rejected() {
        let controller = controller();
        controller.configure(0, false).await.unwrap();
        controller.start().await.unwrap();

        let err = controller.configure(9000, true).await.unwrap_err();
        assert!(matches!(err, ProxyError::ReconfigureWhileRunning));
        assert_eq!(
            controller.current_endpoint().as_deref(),
            Some("http://localhost:0")
        );

        controller.stop().await.unwrap();
        controller.configure(9000, true).await.unwrap();
        assert_eq!(
            controller.current_endpoint().as_deref(),
            Some("http://localhost:9000")
        );
    }

    #[tokio::test]
    async fn test_last_registered_observer_wins() {
        let controller = controller();
        let first = recorder(&controller);
        let second = recorder(&controller);

        controller.configure(0, false).await.unwrap();
        controller.start().await.unwrap();
        controller.stop().await.unwrap();

        assert!(first.lock().unwrap().is_empty());
        assert_eq!(second.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_observer_can_replace_itself() {
        let controller = Arc::new(controller());
        let events = Arc::new(Mutex::new(Vec::new()));

        let weak = Arc::downgrade(&controller);
        let sink = Arc::clone(&events);
        controller.on_status_change(move |_| {
            if let Some(controller) = weak.upgrade() {
                let sink = Arc::clone(&sink);
                controller.on_status_change(move |status| sink.lock().unwrap().push(status));
            }
        });

        controller.configure(0, false).await.unwrap();
        controller.start().await.unwrap();
        controller.stop().await.unwrap();

        // The first callback swapped in the recorder, which saw only the stop.
        assert_eq!(*events.lock().unwrap(), vec![ServerStatus::Stopped]);
    }
}
