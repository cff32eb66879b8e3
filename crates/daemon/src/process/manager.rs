//! Process manager.
//!
//! Spawns shells with the configured terminal settings and keeps a kill
//! handle for every live process so shutdown can terminate all of them.
//! The manager never owns a process: each [`PtyProcess`] belongs to the
//! channel that spawned it.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use super::pty::{KillHandle, ProcessError, ProcessEvent, ProcessId, PtyProcess, SpawnOptions};
use crate::config::TerminalConfig;

/// Information about a live process.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    /// Process identifier.
    pub id: ProcessId,
    /// Whether the process has exited.
    pub exited: bool,
}

/// Thread-safe process registry backed by DashMap.
pub struct ProcessManager {
    terminal: TerminalConfig,
    processes: DashMap<ProcessId, KillHandle>,
}

impl ProcessManager {
    /// Creates a manager that spawns shells using `terminal` settings.
    pub fn new(terminal: TerminalConfig) -> Self {
        Self {
            terminal,
            processes: DashMap::new(),
        }
    }

    /// Terminal settings used for new processes.
    pub fn terminal(&self) -> &TerminalConfig {
        &self.terminal
    }

    /// Spawns the configured shell and registers it.
    pub fn spawn(&self) -> Result<(PtyProcess, mpsc::Receiver<ProcessEvent>), ProcessError> {
        let options = SpawnOptions {
            cols: self.terminal.cols,
            rows: self.terminal.rows,
            cwd: self.terminal.cwd.clone(),
            env: vec![("TERM".to_string(), self.terminal.term.clone())],
            queue_capacity: self.terminal.output_queue,
        };

        let (process, events) = PtyProcess::spawn(&self.terminal.shell, options)?;
        self.processes
            .insert(process.id().clone(), process.kill_handle());

        Ok((process, events))
    }

    /// Forgets a process once its channel is done with it.
    pub fn release(&self, id: &ProcessId) {
        if self.processes.remove(id).is_some() {
            tracing::debug!(process_id = %id, "Released process");
        }
    }

    /// Kills every registered process. Returns how many were signalled.
    pub fn kill_all(&self) -> usize {
        let mut killed = 0;

        for entry in self.processes.iter() {
            let handle = entry.value();
            if handle.has_exited() {
                continue;
            }
            match handle.kill() {
                Ok(()) => killed += 1,
                Err(e) => {
                    tracing::warn!(process_id = %handle.id(), error = %e, "Failed to kill process");
                }
            }
        }

        if killed > 0 {
            tracing::info!(count = killed, "Killed remaining processes");
        }
        killed
    }

    /// Lists registered processes.
    pub fn list(&self) -> Vec<ProcessInfo> {
        self.processes
            .iter()
            .map(|entry| ProcessInfo {
                id: entry.key().clone(),
                exited: entry.value().has_exited(),
            })
            .collect()
    }

    /// Number of registered processes that are still running.
    pub fn active_count(&self) -> usize {
        self.processes
            .iter()
            .filter(|entry| !entry.value().has_exited())
            .count()
    }
}

/// Shared process manager.
pub type SharedProcessManager = Arc<ProcessManager>;
