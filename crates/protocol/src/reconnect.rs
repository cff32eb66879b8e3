//! Client reconnection policy.
//!
//! The server keeps no state across channels, so recovering from a dropped
//! channel is entirely the client's job. This module encodes that contract as
//! a small state machine with no I/O so every client (the browser bundle, the
//! daemon's reference client) follows the same schedule:
//!
//! - on unexpected loss the status becomes [`ConnectionStatus::Disconnected`]
//!   and the next attempt waits `min(attempt * 1s, 5s)`;
//! - after [`DEFAULT_MAX_ATTEMPTS`] consecutive failures the status becomes
//!   [`ConnectionStatus::Failed`] and no further attempt is made;
//! - every successful open resets the counter and must be followed
//!   immediately by a resize frame carrying the current viewport.

use std::fmt;
use std::time::Duration;

use crate::frames::ControlFrame;

/// Delay unit multiplied by the attempt number.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Upper bound for any single delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(5000);

/// Number of reconnection attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Message shown once the client stops retrying.
pub const CONNECTION_LOST_MESSAGE: &str = "Connection lost. Refresh the page to reconnect.";

/// Visual connection status reported to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// An attempt is in flight.
    Connecting,
    /// The channel is open.
    Connected,
    /// The channel dropped; a retry may be scheduled.
    Disconnected,
    /// Retries exhausted. Only a manual reload recovers.
    Failed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionStatus::Connecting => "Connecting...",
            ConnectionStatus::Connected => "Connected",
            ConnectionStatus::Disconnected => "Disconnected",
            ConnectionStatus::Failed => "Connection lost",
        };
        f.write_str(label)
    }
}

/// Bounded linear backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay unit multiplied by the attempt number.
    pub base_delay: Duration,
    /// Cap applied to every delay.
    pub max_delay: Duration,
    /// Attempts allowed before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given 1-based attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .checked_mul(attempt)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Full delay schedule, one entry per allowed attempt.
    pub fn schedule(&self) -> Vec<Duration> {
        (1..=self.max_attempts).map(|a| self.delay_for(a)).collect()
    }
}

/// What the client should do after a channel loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectAction {
    /// Wait `delay`, then make attempt number `attempt`.
    Retry {
        /// 1-based attempt number.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// Stop retrying and surface [`CONNECTION_LOST_MESSAGE`].
    GiveUp,
}

/// Reconnection state machine driven by channel events.
#[derive(Debug, Clone)]
pub struct Reconnector {
    policy: ReconnectPolicy,
    attempts: u32,
    status: ConnectionStatus,
}

impl Reconnector {
    /// Creates a state machine in the `Connecting` state.
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            status: ConnectionStatus::Connecting,
        }
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Attempts made since the last successful open.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// The policy in use.
    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Records that a connection attempt has started.
    pub fn on_connecting(&mut self) {
        if self.status != ConnectionStatus::Failed {
            self.status = ConnectionStatus::Connecting;
        }
    }

    /// Records a successful open and returns the resize frame that must be
    /// sent before anything else.
    pub fn on_open(&mut self, cols: u16, rows: u16) -> ControlFrame {
        self.status = ConnectionStatus::Connected;
        self.attempts = 0;
        ControlFrame::resize(cols.max(1), rows.max(1))
    }

    /// Records a channel loss (or a failed attempt) and decides what to do.
    pub fn on_close(&mut self) -> ReconnectAction {
        if self.status == ConnectionStatus::Failed {
            return ReconnectAction::GiveUp;
        }

        if self.attempts < self.policy.max_attempts {
            self.attempts += 1;
            self.status = ConnectionStatus::Disconnected;
            ReconnectAction::Retry {
                attempt: self.attempts,
                delay: self.policy.delay_for(self.attempts),
            }
        } else {
            self.status = ConnectionStatus::Failed;
            ReconnectAction::GiveUp
        }
    }
}

impl Default for Reconnector {
    fn default() -> Self {
        Self::new(ReconnectPolicy::default())
    }
}
