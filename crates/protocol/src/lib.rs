//! # termhost Protocol Library
//!
//! Transport-independent definitions shared by the termhost daemon and its
//! clients.
//!
//! ## Overview
//!
//! - **Control Frames**: `resize` and `theme` objects multiplexed with raw
//!   terminal bytes on one channel, plus the deterministic classifier that
//!   separates them
//! - **HTTP Payloads**: login, logout and status bodies used by the auth API
//! - **Channel Notices**: human-readable lines written before a channel closes
//! - **Reconnection Policy**: the backoff contract every client follows
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{classify, ControlFrame, FrameKind, Inbound};
//!
//! let resize = ControlFrame::resize(120, 40).to_json().unwrap();
//! assert_eq!(
//!     classify(FrameKind::Text, resize.as_bytes()),
//!     Inbound::Control(ControlFrame::resize(120, 40))
//! );
//!
//! // Keystrokes pass through untouched.
//! assert_eq!(classify(FrameKind::Text, b"ls\r"), Inbound::Input(b"ls\r"));
//! ```
//!
//! ## Modules
//!
//! - [`frames`]: Control frames and inbound classification
//! - [`messages`]: HTTP payloads and channel notices
//! - [`reconnect`]: Client reconnection policy
//! - [`error`]: Error types

pub mod error;
pub mod frames;
pub mod messages;
pub mod reconnect;

pub use error::{ProtocolError, Result};
pub use frames::{classify, ControlFrame, FrameKind, Inbound};
pub use messages::{ApiResponse, AuthStatus, ChannelNotice, LoginRequest, ANONYMOUS_USER};
pub use reconnect::{
    ConnectionStatus, ReconnectAction, ReconnectPolicy, Reconnector, CONNECTION_LOST_MESSAGE,
    DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY,
};
