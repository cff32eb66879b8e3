//! HTTP payloads and channel notices.
//!
//! The JSON shapes here are what the browser client consumes, so field names
//! follow its conventions (`authEnabled`) rather than Rust's.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Synthetic username used when authentication is disabled.
pub const ANONYMOUS_USER: &str = "anonymous";

/// Body of `POST /api/auth/login`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    /// Supplied username.
    pub username: String,
    /// Supplied password, in clear text over the (TLS-terminated) transport.
    pub password: String,
}

/// Generic `{success, message}` response used by the auth endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiResponse {
    /// Whether the operation succeeded.
    pub success: bool,
    /// Human-readable outcome.
    pub message: String,
}

impl ApiResponse {
    /// Successful response with a message.
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    /// Failed response with a message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Body of `GET /api/auth/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthStatus {
    /// Whether the caller holds a valid session.
    pub authenticated: bool,
    /// Whether the server requires authentication at all.
    #[serde(rename = "authEnabled")]
    pub auth_enabled: bool,
    /// Username bound to the caller's session, if any.
    pub username: Option<String>,
}

/// Human-readable notices written to the channel as plain text frames.
///
/// These are never control-typed; the client renders them in the terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelNotice {
    /// The bound process exited on its own.
    ProcessExited {
        /// Exit code reported by the OS.
        code: u32,
        /// Terminating signal name, if the process was signalled.
        signal: Option<String>,
    },
    /// The process could not be spawned.
    SpawnFailed {
        /// Underlying reason.
        reason: String,
    },
    /// The server is shutting down.
    ServerShutdown,
    /// The session used to open the channel has expired.
    SessionExpired,
}

impl fmt::Display for ChannelNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelNotice::ProcessExited {
                signal: Some(signal),
                ..
            } => write!(f, "\r\n[process terminated by signal {}]\r\n", signal),
            ChannelNotice::ProcessExited { code, signal: None } => {
                write!(f, "\r\n[process exited with code {}]\r\n", code)
            }
            ChannelNotice::SpawnFailed { reason } => {
                write!(f, "\r\n[failed to start shell: {}]\r\n", reason)
            }
            ChannelNotice::ServerShutdown => write!(f, "\r\n[server shutting down]\r\n"),
            ChannelNotice::SessionExpired => {
                write!(f, "\r\n[session expired, please log in again]\r\n")
            }
        }
    }
}
