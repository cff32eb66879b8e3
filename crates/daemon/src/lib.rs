//! # termhost Daemon Library
//!
//! Bridges browser websocket channels to shells running on the host.
//!
//! ## Overview
//!
//! Each authenticated websocket channel gets its own freshly spawned shell
//! behind a pseudo-terminal. Keystrokes flow from the channel into the
//! shell, output flows back, and a small set of JSON control frames
//! (resize, theme) travels over the same connection.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Daemon Orchestrator                     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐  │
//! │  │ HTTP server  │  │   Session    │  │  Login rate      │  │
//! │  │ (axum)       │  │   store      │  │  limiter         │  │
//! │  └──────┬───────┘  └──────────────┘  └──────────────────┘  │
//! │         │ /ws                                               │
//! │  ┌──────▼───────────────────────────────────────────────┐  │
//! │  │                Channel gateway                        │  │
//! │  │   message router  <->  PTY process (process manager)  │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut orchestrator = DaemonOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading, layering and validation
//! - [`auth`]: Credentials, session tokens and login rate limiting
//! - [`process`]: PTY-backed processes and their registry
//! - [`router`]: Splits inbound frames into control and input
//! - [`gateway`]: Per-channel lifecycle
//! - [`server`]: HTTP routes
//! - [`orchestrator`]: Startup and shutdown
//! - [`client`]: Reconnecting reference client

pub mod auth;
pub mod client;
pub mod config;
pub mod gateway;
pub mod orchestrator;
pub mod process;
pub mod router;
pub mod server;

// Re-export protocol for convenience
pub use protocol;

pub use auth::{AuthError, Credentials, LoginRateLimiter, SessionStore, SESSION_COOKIE};
pub use client::{ChannelClient, ClientConfig, ClientError, ClientEvent, ClientInput};
pub use config::Config;
pub use gateway::{ChannelGateway, ChannelId, ChannelState, CloseReason};
pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
pub use process::{
    ExitInfo, InputWriter, ProcessError, ProcessEvent, ProcessManager, PtyProcess, SpawnOptions,
};
pub use router::{MessageRouter, OutboundFrame, RouteOutcome, Routed, Terminal};
pub use server::{build_router, AppState};
