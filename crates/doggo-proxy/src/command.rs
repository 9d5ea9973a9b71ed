//! Command surface for front ends.
//!
//! Front ends (console, tray, settings window) never touch the controller
//! directly; they send a [`Command`] and get a [`CommandResponse`] back.
//! [`CommandHandler`] executes commands against the controller and the
//! preference store, and [`spawn`] puts it behind an in-process
//! request/response channel. Both types are serde-serializable, so the
//! same shapes could be carried over a socket one RPC per command.

use crate::config::ProxyConfig;
use crate::controller::{ProxyController, ServerStatus};
use crate::error::{ProxyError, Result};
use crate::preferences::{PreferenceStore, UpstreamsPreference};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// How often a spawned handler re-reads the stored selection, so edits made
/// by another process reach new connections without a command.
pub const SELECTION_REFRESH_INTERVAL: Duration = Duration::from_secs(2);

/// Requests accepted from a front end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    StartServer,
    StopServer,
    /// Select the stored upstream at `index`.
    SelectUpstream { index: usize },
    /// Stop, reconfigure, and restart if the server was running.
    Reconfigure { port: u16, verbose: bool },
    ListUpstreams,
    IsRunning,
    Endpoint,
    Status,
}

/// Replies to [`Command`]s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandResponse {
    Status(StatusReport),
    Selected { index: usize, name: String, summary: String },
    Upstreams(UpstreamsPreference),
    Running { running: bool },
    Endpoint { endpoint: Option<String> },
}

/// Snapshot of everything a status display needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: ServerStatus,
    pub endpoint: Option<String>,
    /// Address actually bound while running (differs from the endpoint
    /// port when configured with port 0).
    pub local_addr: Option<SocketAddr>,
    /// `host:port` of the active upstream, `None` when direct.
    pub upstream: Option<String>,
}

/// Executes commands against a controller and a preference store.
pub struct CommandHandler<S> {
    controller: Arc<ProxyController>,
    store: S,
}

impl<S: PreferenceStore> CommandHandler<S> {
    #[must_use]
    pub fn new(controller: Arc<ProxyController>, store: S) -> Self {
        Self { controller, store }
    }

    #[must_use]
    pub fn controller(&self) -> &Arc<ProxyController> {
        &self.controller
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn handle(&self, command: Command) -> Result<CommandResponse> {
        debug!("Handling command: {:?}", command);
        if !matches!(command, Command::SelectUpstream { .. }) {
            self.refresh_selection();
        }
        match command {
            Command::StartServer => {
                self.controller.start().await?;
                Ok(CommandResponse::Status(self.status_report().await))
            }
            Command::StopServer => {
                self.controller.stop().await?;
                Ok(CommandResponse::Status(self.status_report().await))
            }
            Command::SelectUpstream { index } => self.select_upstream(index),
            Command::Reconfigure { port, verbose } => {
                self.reconfigure(ProxyConfig::local(port, verbose)).await?;
                Ok(CommandResponse::Status(self.status_report().await))
            }
            Command::ListUpstreams => Ok(CommandResponse::Upstreams(
                self.store.upstreams_preference()?,
            )),
            Command::IsRunning => Ok(CommandResponse::Running {
                running: self.controller.is_running(),
            }),
            Command::Endpoint => Ok(CommandResponse::Endpoint {
                endpoint: self.controller.current_endpoint(),
            }),
            Command::Status => Ok(CommandResponse::Status(self.status_report().await)),
        }
    }

    /// Select stored upstream `index`, update the selector, persist the choice.
    ///
    /// Indices past the end are rejected with [`ProxyError::UpstreamIndex`];
    /// neither the selector nor the store changes in that case.
    pub fn select_upstream(&self, index: usize) -> Result<CommandResponse> {
        let mut pref = self.store.upstreams_preference()?;
        let definition = pref.select(index)?.clone();

        self.controller
            .selector()
            .set_upstream(definition.connection_setting.clone())?;
        self.store.set_upstreams_preference(&pref)?;

        info!("Selected upstream {} ({})", index, definition.name);
        Ok(CommandResponse::Selected {
            index,
            name: definition.name.clone(),
            summary: definition.summary(),
        })
    }

    /// Push the stored selection into the selector.
    ///
    /// The selector is only written when the stored target differs from the
    /// live one. Returns whether it changed.
    pub fn sync_selected_upstream(&self) -> Result<bool> {
        let pref = self.store.upstreams_preference()?;
        let target = pref.selected_target()?;
        let selector = self.controller.selector();
        if selector.get_upstream().as_deref() == target.as_ref() {
            return Ok(false);
        }
        selector.set_upstream(target)?;
        info!("Applied stored upstream selection {}", pref.selected_index);
        Ok(true)
    }

    /// Like [`sync_selected_upstream`](Self::sync_selected_upstream), but a
    /// broken store only logs; the live selection stays as it is.
    pub fn refresh_selection(&self) {
        if let Err(e) = self.sync_selected_upstream() {
            warn!("Keeping current upstream, stored selection unusable: {}", e);
        }
    }

    /// Apply a new listener config, restarting if the server was running.
    pub async fn reconfigure(&self, config: ProxyConfig) -> Result<()> {
        let was_running = self.controller.is_running();
        if was_running {
            self.controller.stop().await?;
        }
        self.controller.configure_with(config).await?;
        if was_running {
            self.controller.start().await?;
        }
        Ok(())
    }

    pub async fn status_report(&self) -> StatusReport {
        StatusReport {
            status: self.controller.status(),
            endpoint: self.controller.current_endpoint(),
            local_addr: self.controller.local_addr().await,
            upstream: self
                .controller
                .selector()
                .get_upstream()
                .map(|t| t.host_port()),
        }
    }
}

type Request = (Command, oneshot::Sender<Result<CommandResponse>>);

/// Sending half of the command channel.
#[derive(Debug, Clone)]
pub struct CommandClient {
    tx: mpsc::Sender<Request>,
}

impl CommandClient {
    /// Send a command and wait for its response.
    ///
    /// Fails with [`ProxyError::Shutdown`] once the handler task is gone.
    pub async fn send(&self, command: Command) -> Result<CommandResponse> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((command, reply_tx))
            .await
            .map_err(|_| ProxyError::Shutdown)?;
        reply_rx.await.map_err(|_| ProxyError::Shutdown)?
    }
}

/// Run `handler` on its own task and return a client for it.
///
/// Commands are executed one at a time in arrival order. The task ends when
/// every client has been dropped.
pub fn spawn<S>(handler: CommandHandler<S>) -> CommandClient
where
    S: PreferenceStore + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Request>(16);
    tokio::spawn(async move {
        let mut refresh = tokio::time::interval(SELECTION_REFRESH_INTERVAL);
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                request = rx.recv() => {
                    let Some((command, reply)) = request else {
                        break;
                    };
                    let result = handler.handle(command).await;
                    let _ = reply.send(result);
                }
                _ = refresh.tick() => handler.refresh_selection(),
            }
        }
        debug!("Command channel closed");
    });
    CommandClient { tx }
}
