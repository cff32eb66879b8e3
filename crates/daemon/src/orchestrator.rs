//! Daemon orchestrator for wiring together all components.
//!
//! This module provides the `DaemonOrchestrator` that builds the session
//! store, rate limiter, process manager and channel gateway from the
//! configuration, runs the HTTP listener, and tears everything down again.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{LoginRateLimiter, SessionStore};
use crate::config::Config;
use crate::gateway::ChannelGateway;
use crate::process::ProcessManager;
use crate::server::{build_router, AppState};

/// Interval between sweeps of expired sessions and idle rate-limit entries.
const CLEANUP_INTERVAL_SECS: u64 = 60;

/// How long `stop` waits for open channels to wind down.
const CHANNEL_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Binding the listener.
    Starting,
    /// Running and accepting channels.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// A channel was bound to a new process.
    ChannelOpened { channel_id: String, username: String },
    /// A channel closed.
    ChannelClosed { channel_id: String, reason: String },
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    /// Configuration.
    config: Config,
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    /// Session tokens.
    store: Arc<SessionStore>,
    /// Login rate limiter.
    limiter: Arc<LoginRateLimiter>,
    /// Registry of live processes.
    processes: Arc<ProcessManager>,
    /// Channel gateway.
    gateway: Arc<ChannelGateway>,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
    /// Event sender.
    event_tx: broadcast::Sender<OrchestratorEvent>,
    /// Address actually bound, once started.
    local_addr: Option<SocketAddr>,
    /// HTTP server task.
    server_task: Option<JoinHandle<std::io::Result<()>>>,
}

impl DaemonOrchestrator {
    /// Creates a new daemon orchestrator.
    pub fn new(config: Config) -> Result<Self> {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

        let store = Arc::new(SessionStore::from_config(&config.auth));
        let limiter = Arc::new(LoginRateLimiter::from_config(&config.auth));
        let processes = Arc::new(ProcessManager::new(config.terminal.clone()));
        let shutdown_token = CancellationToken::new();
        let (event_tx, _) = broadcast::channel(256);

        let gateway = Arc::new(ChannelGateway::new(
            &config,
            Arc::clone(&store),
            Arc::clone(&processes),
            shutdown_token.clone(),
            event_tx.clone(),
        ));

        if !config.auth.enabled {
            warn!("Authentication is disabled; anyone who can reach the listener gets a shell");
        }

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            store,
            limiter,
            processes,
            gateway,
            shutdown_token,
            event_tx,
            local_addr: None,
            server_task: None,
        })
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Handler state shared by every request.
    pub fn app_state(&self) -> AppState {
        AppState {
            store: Arc::clone(&self.store),
            limiter: Arc::clone(&self.limiter),
            gateway: Arc::clone(&self.gateway),
            shutdown: self.shutdown_token.clone(),
        }
    }

    /// Binds the configured address and starts serving.
    ///
    /// Failure to bind is returned as an error; the caller should treat it
    /// as fatal.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.state().await != OrchestratorState::Stopped {
            anyhow::bail!("Orchestrator is already running");
        }

        let bind_address = self.config.server.bind_address();
        let listener = TcpListener::bind(&bind_address)
            .await
            .with_context(|| format!("Failed to bind {}", bind_address))?;

        self.start_with_listener(listener).await
    }

    /// Starts serving on an already bound listener.
    pub async fn start_with_listener(&mut self, listener: TcpListener) -> Result<SocketAddr> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        let local_addr = listener
            .local_addr()
            .context("Failed to read bound address")?;
        self.local_addr = Some(local_addr);

        self.spawn_cleanup_task();

        let app = build_router(self.app_state())
            .into_make_service_with_connect_info::<SocketAddr>();
        let token = self.shutdown_token.clone();
        self.server_task = Some(tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
        }));

        *self.state.write().await = OrchestratorState::Running;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!(
            addr = %local_addr,
            shell = %self.config.terminal.shell,
            cols = self.config.terminal.cols,
            rows = self.config.terminal.rows,
            auth = self.config.auth.enabled,
            "Listening"
        );
        Ok(local_addr)
    }

    /// Periodically purges expired sessions and idle rate-limit entries.
    fn spawn_cleanup_task(&self) {
        let store = Arc::clone(&self.store);
        let limiter = Arc::clone(&self.limiter);
        let token = self.shutdown_token.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(CLEANUP_INTERVAL_SECS));
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let purged = store.purge_expired();
                        if purged > 0 {
                            debug!(count = purged, "Purged expired sessions");
                        }
                        limiter.cleanup();
                    }
                }
            }
        });
    }

    /// Stops the daemon orchestrator gracefully.
    ///
    /// Open channels are told to close, which kills their processes; any
    /// process still registered afterwards is killed directly.
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping daemon orchestrator...");
        self.shutdown_token.cancel();

        let drained = tokio::time::timeout(CHANNEL_DRAIN_TIMEOUT, async {
            while self.gateway.open_channels() > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                open = self.gateway.open_channels(),
                "Channels still open after drain timeout"
            );
        }

        self.processes.kill_all();

        if let Some(task) = self.server_task.take() {
            match tokio::time::timeout(CHANNEL_DRAIN_TIMEOUT, task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => warn!("HTTP server exited with error: {}", e),
                Ok(Err(e)) => warn!("HTTP server task failed: {}", e),
                Err(_) => warn!("HTTP server did not stop in time"),
            }
        }

        *self.state.write().await = OrchestratorState::Stopped;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    /// Emits an orchestrator event.
    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Returns the bound address once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Returns the session store.
    pub fn session_store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Returns the process manager.
    pub fn process_manager(&self) -> &Arc<ProcessManager> {
        &self.processes
    }

    /// Returns the number of open channels.
    pub fn channel_count(&self) -> usize {
        self.gateway.open_channels()
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}
