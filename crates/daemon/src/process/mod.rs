//! Process management module.
//!
//! This module provides PTY spawning and the registry used to terminate
//! every live shell on shutdown.

pub mod manager;
pub mod pty;

pub use manager::{ProcessInfo, ProcessManager, SharedProcessManager};
pub use pty::{
    ExitInfo, InputWriter, KillHandle, ProcessError, ProcessEvent, ProcessId, ProcessState,
    PtyProcess, SpawnOptions,
};
