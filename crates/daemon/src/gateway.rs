//! Channel gateway.
//!
//! Admits websocket channels and runs each one to completion. Every channel
//! follows the same lifecycle:
//!
//! ```text
//! Connecting ──spawn ok──▶ Open ──exit / close / error / shutdown──▶ Closing ──▶ Closed
//!      │                                                              ▲
//!      └────────────────────────spawn failed──────────────────────────┘
//! ```
//!
//! A channel owns exactly one process for its whole life. Whatever ends the
//! channel, the process is killed (unless it already exited) before the
//! channel reaches `Closed`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::{ChannelNotice, FrameKind};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::{AuthError, SessionStore, SessionToken};
use crate::config::Config;
use crate::orchestrator::OrchestratorEvent;
use crate::process::{
    ExitInfo, InputWriter, ProcessError, ProcessEvent, ProcessId, ProcessManager, PtyProcess,
};
use crate::router::{route_outbound, MessageRouter, OutboundFrame, Routed};

/// Unique identifier for a channel.
pub type ChannelId = String;

/// Inbound input frames buffered ahead of the process.
const INPUT_QUEUE_CAPACITY: usize = 64;

type ChannelSink = SplitSink<WebSocket, Message>;
type ChannelStream = SplitStream<WebSocket>;

/// Channel lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Admitted; the process is being spawned.
    Connecting,
    /// Bound to a running process.
    Open,
    /// Tearing down.
    Closing,
    /// Finished. Terminal.
    Closed,
}

/// Transport failures on an open channel.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("send did not complete within {0:?}")]
    SendTimeout(Duration),
}

/// Why a channel closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The process exited on its own. Its notice has already been sent.
    ProcessExited(ExitInfo),
    /// The process event queue ended without an exit status.
    ProcessLost,
    /// The process could not be started.
    SpawnFailed(String),
    /// The client closed the channel.
    ClientClosed,
    /// The transport failed.
    Transport(String),
    /// The client stopped draining output.
    ClientTooSlow,
    /// The server is shutting down.
    ServerShutdown,
    /// The session behind the channel expired.
    SessionExpired,
}

impl CloseReason {
    /// Notice to send before closing, if the client can still receive one.
    fn notice(&self) -> Option<ChannelNotice> {
        match self {
            CloseReason::SpawnFailed(reason) => Some(ChannelNotice::SpawnFailed {
                reason: reason.clone(),
            }),
            CloseReason::ServerShutdown => Some(ChannelNotice::ServerShutdown),
            CloseReason::SessionExpired => Some(ChannelNotice::SessionExpired),
            _ => None,
        }
    }

    /// Close frame to send, or `None` if the transport is already unusable.
    fn close_frame(&self) -> Option<CloseFrame<'static>> {
        let (code, reason) = match self {
            CloseReason::ProcessExited(_) | CloseReason::ProcessLost => {
                (close_code::NORMAL, "process exited")
            }
            CloseReason::SpawnFailed(_) => (close_code::ERROR, "spawn failed"),
            CloseReason::ServerShutdown => (close_code::AWAY, "server shutting down"),
            CloseReason::SessionExpired => (close_code::POLICY, "session expired"),
            CloseReason::ClientClosed | CloseReason::Transport(_) | CloseReason::ClientTooSlow => {
                return None
            }
        };
        Some(CloseFrame {
            code,
            reason: reason.into(),
        })
    }
}

impl From<ChannelError> for CloseReason {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Transport(e) => CloseReason::Transport(e),
            ChannelError::SendTimeout(_) => CloseReason::ClientTooSlow,
        }
    }
}

/// Result of admitting a channel.
#[derive(Debug, Clone)]
pub struct Admission {
    /// Username the channel runs as.
    pub username: String,
    /// Token kept only when periodic re-checks are enabled.
    token: Option<SessionToken>,
}

/// Per-channel bookkeeping.
struct Channel {
    id: ChannelId,
    state: ChannelState,
    username: String,
    process_id: Option<ProcessId>,
}

impl Channel {
    fn new(username: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            state: ChannelState::Connecting,
            username,
            process_id: None,
        }
    }

    fn transition(&mut self, next: ChannelState) {
        debug!(channel_id = %self.id, from = ?self.state, to = ?next, "Channel state change");
        self.state = next;
    }

    fn bind(&mut self, process_id: ProcessId) {
        self.process_id = Some(process_id);
        self.transition(ChannelState::Open);
    }
}

/// Decrements the open-channel counter when a channel task ends, however it
/// ends.
struct OpenChannelGuard<'a>(&'a AtomicUsize);

impl<'a> OpenChannelGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for OpenChannelGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Accepts channels and binds each to its own process.
pub struct ChannelGateway {
    store: Arc<SessionStore>,
    processes: Arc<ProcessManager>,
    send_timeout: Duration,
    recheck_interval: Option<Duration>,
    shutdown: CancellationToken,
    events: broadcast::Sender<OrchestratorEvent>,
    open_channels: AtomicUsize,
}

impl ChannelGateway {
    /// Creates a gateway.
    pub fn new(
        config: &Config,
        store: Arc<SessionStore>,
        processes: Arc<ProcessManager>,
        shutdown: CancellationToken,
        events: broadcast::Sender<OrchestratorEvent>,
    ) -> Self {
        Self {
            store,
            processes,
            send_timeout: config.terminal.send_timeout(),
            recheck_interval: config.auth.recheck_interval(),
            shutdown,
            events,
            open_channels: AtomicUsize::new(0),
        }
    }

    /// Number of channels currently being served.
    pub fn open_channels(&self) -> usize {
        self.open_channels.load(Ordering::SeqCst)
    }

    /// Decides whether a channel presenting `token` may be established.
    ///
    /// Runs before the upgrade; a rejected caller never gets a process.
    pub fn admit(&self, token: Option<&str>) -> Result<Admission, AuthError> {
        let username = self.store.authorize(token)?;
        let token = match (self.recheck_interval, self.store.auth_enabled()) {
            (Some(_), true) => token.map(str::to_string),
            _ => None,
        };
        Ok(Admission { username, token })
    }

    /// Runs an admitted channel until it closes.
    pub async fn serve(&self, socket: WebSocket, admission: Admission) {
        let _guard = OpenChannelGuard::new(&self.open_channels);
        let mut channel = Channel::new(admission.username);
        let (mut sink, mut stream) = socket.split();

        info!(channel_id = %channel.id, username = %channel.username, "Channel connecting");

        let processes = Arc::clone(&self.processes);
        let spawned = tokio::task::spawn_blocking(move || processes.spawn())
            .await
            .unwrap_or_else(|e| Err(ProcessError::SpawnFailed(e.to_string())));

        let reason = match spawned {
            Ok((process, mut events)) => {
                channel.bind(process.id().clone());
                info!(
                    channel_id = %channel.id,
                    process_id = %process.id(),
                    "Channel open"
                );
                let _ = self.events.send(OrchestratorEvent::ChannelOpened {
                    channel_id: channel.id.clone(),
                    username: channel.username.clone(),
                });

                let reason = self
                    .run_open(
                        &channel,
                        &process,
                        &mut events,
                        &mut sink,
                        &mut stream,
                        admission.token.as_deref(),
                    )
                    .await;

                channel.transition(ChannelState::Closing);
                if let Err(e) = process.kill() {
                    warn!(channel_id = %channel.id, error = %e, "Failed to kill process");
                }
                self.processes.release(process.id());
                reason
            }
            Err(e) => {
                error!(channel_id = %channel.id, error = %e, "Failed to spawn process");
                channel.transition(ChannelState::Closing);
                CloseReason::SpawnFailed(e.to_string())
            }
        };

        self.finish(&channel, &mut sink, &reason).await;
        channel.transition(ChannelState::Closed);

        info!(
            channel_id = %channel.id,
            process_id = ?channel.process_id,
            reason = ?reason,
            "Channel closed"
        );
        let _ = self.events.send(OrchestratorEvent::ChannelClosed {
            channel_id: channel.id.clone(),
            reason: format!("{:?}", reason),
        });
    }

    /// Shuttles frames until something ends the channel.
    ///
    /// Input is written by a separate task fed through a bounded queue, so a
    /// process that stops reading its input never stalls output, shutdown or
    /// the session re-check. While that queue is full the channel stops
    /// reading from the client.
    async fn run_open(
        &self,
        channel: &Channel,
        process: &PtyProcess,
        events: &mut mpsc::Receiver<ProcessEvent>,
        sink: &mut ChannelSink,
        stream: &mut ChannelStream,
        token: Option<&str>,
    ) -> CloseReason {
        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_CAPACITY);
        let _writer = AbortOnDropHandle::new(tokio::spawn(write_input(
            process.input_writer(),
            input_rx,
            channel.id.clone(),
        )));

        let router = MessageRouter::new(process, &channel.id);
        let mut pending: Option<Vec<u8>> = None;
        let mut recheck = self.recheck_interval.map(|period| {
            tokio::time::interval_at(tokio::time::Instant::now() + period, period)
        });

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return CloseReason::ServerShutdown,

                event = events.recv() => {
                    let Some(event) = event else {
                        return CloseReason::ProcessLost;
                    };
                    let exit = match &event {
                        ProcessEvent::Exit(info) => Some(info.clone()),
                        ProcessEvent::Data(_) => None,
                    };
                    if let Err(e) = self.send(sink, route_outbound(event)).await {
                        warn!(channel_id = %channel.id, error = %e, "Failed to send to client");
                        return e.into();
                    }
                    if let Some(info) = exit {
                        return CloseReason::ProcessExited(info);
                    }
                }

                message = stream.next(), if pending.is_none() => {
                    let (kind, payload) = match message {
                        Some(Ok(Message::Text(text))) => (FrameKind::Text, text.into_bytes()),
                        Some(Ok(Message::Binary(bytes))) => (FrameKind::Binary, bytes),
                        Some(Ok(Message::Close(_))) | None => return CloseReason::ClientClosed,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return CloseReason::Transport(e.to_string()),
                    };
                    if let Routed::Input(bytes) = router.dispatch(kind, &payload) {
                        pending = Some(bytes.to_vec());
                    }
                }

                permit = input_tx.reserve(), if pending.is_some() => {
                    match (permit, pending.take()) {
                        (Ok(permit), Some(bytes)) => permit.send(bytes),
                        _ => debug!(channel_id = %channel.id, "Input writer gone, dropped input"),
                    }
                }

                _ = tick(&mut recheck) => {
                    if !token.is_some_and(|t| self.store.is_valid(t)) {
                        info!(channel_id = %channel.id, "Session expired on open channel");
                        return CloseReason::SessionExpired;
                    }
                }
            }
        }
    }

    /// Sends the final notice and close frame where the client can still
    /// receive them.
    async fn finish(&self, channel: &Channel, sink: &mut ChannelSink, reason: &CloseReason) {
        if let Some(notice) = reason.notice() {
            if let Err(e) = self
                .send(sink, OutboundFrame::Notice(notice.to_string()))
                .await
            {
                debug!(channel_id = %channel.id, error = %e, "Could not deliver notice");
                return;
            }
        }

        if let Some(frame) = reason.close_frame() {
            let _ = tokio::time::timeout(self.send_timeout, sink.send(Message::Close(Some(frame))))
                .await;
        }
    }

    /// Sends one frame, bounded by the send timeout.
    async fn send(&self, sink: &mut ChannelSink, frame: OutboundFrame) -> Result<(), ChannelError> {
        let message = match frame {
            OutboundFrame::Output(bytes) => Message::Binary(bytes),
            OutboundFrame::Notice(text) => Message::Text(text),
        };

        match tokio::time::timeout(self.send_timeout, sink.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ChannelError::Transport(e.to_string())),
            Err(_) => Err(ChannelError::SendTimeout(self.send_timeout)),
        }
    }
}

/// Writes queued input to the process in arrival order.
async fn write_input(
    writer: InputWriter,
    mut input: mpsc::Receiver<Vec<u8>>,
    channel_id: ChannelId,
) {
    while let Some(bytes) = input.recv().await {
        if let Err(e) = writer.write(bytes).await {
            // The exit event follows shortly.
            debug!(channel_id = %channel_id, error = %e, "Dropped input");
        }
    }
}

/// Ticks an optional interval; pends forever when disabled.
async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
