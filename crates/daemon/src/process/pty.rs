//! PTY-backed child processes.
//!
//! A [`PtyProcess`] owns one shell running inside a pseudo-terminal. Output
//! and the final exit status are delivered on a bounded event queue. One
//! thread reads the PTY, one reaps the child and a third merges both into
//! the queue, which guarantees that:
//!
//! - data events arrive in the order the process produced them,
//! - exactly one [`ProcessEvent::Exit`] is sent per process,
//! - no data event follows the exit event.
//!
//! The exit event does not wait for PTY EOF: a background job that inherited
//! the terminal keeps it open after the shell is gone. Output still in
//! flight is drained briefly, then the exit is reported.
//!
//! When the queue is full the forwarder and then the reader block, which
//! stops draining the PTY and lets the kernel apply backpressure to the
//! process.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Unique identifier for a spawned process.
pub type ProcessId = String;

/// Buffer size for reading from the PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Errors that can occur during process operations.
#[derive(Error, Debug)]
pub enum ProcessError {
    /// The command could not be located.
    #[error("command not found: {0}")]
    CommandNotFound(String),

    /// The pseudo-terminal could not be allocated.
    #[error("failed to allocate PTY: {0}")]
    PtyUnavailable(String),

    /// The process could not be started.
    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),

    /// The process has already exited.
    #[error("process already exited: {0}")]
    AlreadyExited(ProcessId),

    /// Failed to write to the PTY.
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),

    /// Failed to signal the process.
    #[error("failed to kill process: {0}")]
    KillFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProcessError {
    /// Whether the error happened while starting the process.
    pub fn is_spawn_error(&self) -> bool {
        matches!(
            self,
            ProcessError::CommandNotFound(_)
                | ProcessError::PtyUnavailable(_)
                | ProcessError::SpawnFailed(_)
        )
    }
}

/// Lifecycle of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Spawn is in progress.
    Starting,
    /// The process is running.
    Running,
    /// The process has exited and been reaped.
    Exited,
}

impl ProcessState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ProcessState::Starting,
            1 => ProcessState::Running,
            _ => ProcessState::Exited,
        }
    }
}

/// Final status of a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code. Non-zero when terminated by a signal.
    pub code: u32,
    /// Name of the terminating signal, if any.
    pub signal: Option<String>,
}

impl ExitInfo {
    /// Whether the process exited successfully.
    pub fn success(&self) -> bool {
        self.code == 0 && self.signal.is_none()
    }
}

/// Event emitted by a running process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// A chunk of output, unmodified.
    Data(Vec<u8>),
    /// The process exited. Always the last event.
    Exit(ExitInfo),
}

/// Options for spawning a process.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Terminal width in columns.
    pub cols: u16,
    /// Terminal height in rows.
    pub rows: u16,
    /// Working directory. `None` inherits the daemon's.
    pub cwd: Option<PathBuf>,
    /// Extra environment variables, applied over the inherited environment.
    pub env: Vec<(String, String)>,
    /// Capacity of the event queue.
    pub queue_capacity: usize,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            cols: 80,
            rows: 24,
            cwd: None,
            env: Vec::new(),
            queue_capacity: 256,
        }
    }
}

/// State shared between the owning handle, the reader thread, and any
/// [`KillHandle`]s.
struct ProcessControl {
    id: ProcessId,
    state: AtomicU8,
    kill_requested: AtomicBool,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

impl ProcessControl {
    fn state(&self) -> ProcessState {
        ProcessState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn mark_running(&self) {
        let _ = self.state.compare_exchange(
            ProcessState::Starting as u8,
            ProcessState::Running as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    fn mark_exited(&self) {
        self.state
            .store(ProcessState::Exited as u8, Ordering::SeqCst);
    }

    /// Signals the process at most once. A no-op after exit.
    fn kill(&self) -> Result<(), ProcessError> {
        if self.state() == ProcessState::Exited {
            return Ok(());
        }
        if self.kill_requested.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut killer = self
            .killer
            .lock()
            .map_err(|_| ProcessError::KillFailed("killer lock poisoned".to_string()))?;

        match killer.kill() {
            Ok(()) => {
                tracing::debug!(process_id = %self.id, "Sent kill to process");
                Ok(())
            }
            // Exit raced with the kill.
            Err(_) if self.state() == ProcessState::Exited => Ok(()),
            Err(e) => Err(ProcessError::KillFailed(e.to_string())),
        }
    }
}

/// Cloneable handle that can only terminate a process.
#[derive(Clone)]
pub struct KillHandle {
    control: Arc<ProcessControl>,
}

impl KillHandle {
    /// Process this handle belongs to.
    pub fn id(&self) -> &ProcessId {
        &self.control.id
    }

    /// Terminates the process. Idempotent.
    pub fn kill(&self) -> Result<(), ProcessError> {
        self.control.kill()
    }

    /// Whether the process has exited.
    pub fn has_exited(&self) -> bool {
        self.control.state() == ProcessState::Exited
    }
}

/// Owned write side of a process's terminal.
///
/// Writes through clones of one handle are serialized and land in the order
/// they were issued.
#[derive(Clone)]
pub struct InputWriter {
    control: Arc<ProcessControl>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl InputWriter {
    /// Writes `data` to the process. Blocks a pool thread, never the runtime,
    /// while the terminal's input buffer is full.
    pub async fn write(&self, data: Vec<u8>) -> Result<(), ProcessError> {
        if self.control.state() == ProcessState::Exited {
            return Err(ProcessError::AlreadyExited(self.control.id.clone()));
        }

        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || {
            let mut writer = writer
                .lock()
                .map_err(|_| ProcessError::WriteFailed("writer lock poisoned".to_string()))?;
            writer
                .write_all(&data)
                .and_then(|_| writer.flush())
                .map_err(|e| ProcessError::WriteFailed(e.to_string()))
        })
        .await
        .map_err(|e| ProcessError::WriteFailed(e.to_string()))?
    }
}

/// A shell process attached to a pseudo-terminal.
///
/// Dropping the handle kills the process if it is still running, so a
/// process can never outlive its owner.
pub struct PtyProcess {
    control: Arc<ProcessControl>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    input: InputWriter,
    size: Mutex<(u16, u16)>,
    command: String,
    pid: Option<u32>,
}

impl PtyProcess {
    /// Spawns `command` inside a new PTY.
    ///
    /// Returns the process handle and the receiving end of its event queue.
    pub fn spawn(
        command: &str,
        options: SpawnOptions,
    ) -> Result<(Self, mpsc::Receiver<ProcessEvent>), ProcessError> {
        let program = resolve_command(command)?;
        let id = Uuid::new_v4().to_string();

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: options.rows,
                cols: options.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ProcessError::PtyUnavailable(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&program);
        if let Some(ref dir) = options.cwd {
            cmd.cwd(dir);
        }
        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| ProcessError::SpawnFailed(e.to_string()))?;
        // Only the child may hold the slave side, otherwise the reader never
        // sees EOF.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();

        let control = Arc::new(ProcessControl {
            id: id.clone(),
            state: AtomicU8::new(ProcessState::Starting as u8),
            kill_requested: AtomicBool::new(false),
            killer: Mutex::new(killer),
        });

        let started = start_reader(pair.master.as_ref(), child, &control, options.queue_capacity);
        let (writer, events) = match started {
            Ok(parts) => parts,
            Err(e) => {
                let _ = control.kill();
                return Err(e);
            }
        };

        control.mark_running();

        tracing::info!(
            process_id = %id,
            pid = ?pid,
            command = %program,
            cols = options.cols,
            rows = options.rows,
            "Spawned PTY process"
        );

        let input = InputWriter {
            control: Arc::clone(&control),
            writer: Arc::new(Mutex::new(writer)),
        };

        Ok((
            Self {
                control,
                master: Mutex::new(pair.master),
                input,
                size: Mutex::new((options.cols, options.rows)),
                command: program,
                pid,
            },
            events,
        ))
    }

    /// Returns the process ID.
    pub fn id(&self) -> &ProcessId {
        &self.control.id
    }

    /// Returns the OS process ID, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns the resolved command.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> ProcessState {
        self.control.state()
    }

    /// Returns the last applied terminal size.
    pub fn size(&self) -> (u16, u16) {
        self.size.lock().map(|s| *s).unwrap_or((0, 0))
    }

    /// Returns a handle that can terminate this process from elsewhere.
    pub fn kill_handle(&self) -> KillHandle {
        KillHandle {
            control: Arc::clone(&self.control),
        }
    }

    /// Returns an owned handle for writing input, usable from another task.
    pub fn input_writer(&self) -> InputWriter {
        self.input.clone()
    }

    /// Writes input to the process.
    ///
    /// Bytes are delivered unmodified and in call order. The blocking write
    /// runs off the async runtime.
    pub async fn write(&self, data: &[u8]) -> Result<(), ProcessError> {
        self.input.write(data.to_vec()).await
    }

    /// Resizes the terminal.
    ///
    /// Best-effort: failures are logged and a resize after exit is ignored.
    pub fn resize(&self, cols: u16, rows: u16) {
        if self.state() == ProcessState::Exited {
            tracing::debug!(process_id = %self.id(), "Ignoring resize after exit");
            return;
        }

        let result = match self.master.lock() {
            Ok(master) => master
                .resize(PtySize {
                    rows,
                    cols,
                    pixel_width: 0,
                    pixel_height: 0,
                })
                .map_err(|e| e.to_string()),
            Err(_) => Err("master lock poisoned".to_string()),
        };

        match result {
            Ok(()) => {
                if let Ok(mut size) = self.size.lock() {
                    *size = (cols, rows);
                }
                tracing::debug!(process_id = %self.id(), cols, rows, "Resized PTY");
            }
            Err(e) => {
                tracing::warn!(process_id = %self.id(), error = %e, "Failed to resize PTY");
            }
        }
    }

    /// Terminates the process.
    ///
    /// Idempotent: a no-op if the process already exited or a kill was
    /// already sent. The exit event still arrives on the queue.
    pub fn kill(&self) -> Result<(), ProcessError> {
        self.control.kill()
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        if let Err(e) = self.control.kill() {
            tracing::warn!(process_id = %self.id(), error = %e, "Failed to kill process on drop");
        }
    }
}

/// Output arriving after the child was reaped is still forwarded until the
/// PTY has been quiet this long.
const DRAIN_QUIET: Duration = Duration::from_millis(50);

/// Upper bound on draining after exit. A background job that inherited the
/// terminal can keep it open and busy indefinitely.
const DRAIN_LIMIT: Duration = Duration::from_secs(1);

/// Messages from the reader and waiter threads to the forwarder.
enum Pumped {
    Data(Vec<u8>),
    Eof,
    Exited(ExitInfo),
}

/// Takes the PTY writer and starts the reader, waiter and forwarder threads.
fn start_reader(
    master: &(dyn MasterPty + Send),
    child: Box<dyn Child + Send + Sync>,
    control: &Arc<ProcessControl>,
    queue_capacity: usize,
) -> Result<(Box<dyn Write + Send>, mpsc::Receiver<ProcessEvent>), ProcessError> {
    let writer = master
        .take_writer()
        .map_err(|e| ProcessError::SpawnFailed(e.to_string()))?;
    let reader = master
        .try_clone_reader()
        .map_err(|e| ProcessError::SpawnFailed(e.to_string()))?;

    let capacity = queue_capacity.max(1);
    let (event_tx, event_rx) = mpsc::channel(capacity);
    let (pumped_tx, pumped_rx) = std_mpsc::sync_channel(capacity);
    let short_id = &control.id[..8];

    let forward_control = Arc::clone(control);
    spawn_thread(format!("pty-events-{}", short_id), move || {
        forward(pumped_rx, event_tx, forward_control)
    })?;

    let wait_tx = pumped_tx.clone();
    let wait_control = Arc::clone(control);
    spawn_thread(format!("pty-waiter-{}", short_id), move || {
        wait_child(child, wait_tx, wait_control)
    })?;

    let read_control = Arc::clone(control);
    spawn_thread(format!("pty-reader-{}", short_id), move || {
        read_output(reader, pumped_tx, read_control)
    })?;

    Ok((writer, event_rx))
}

fn spawn_thread<F>(name: String, body: F) -> Result<(), ProcessError>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name)
        .spawn(body)
        .map(drop)
        .map_err(|e| ProcessError::SpawnFailed(e.to_string()))
}

/// Reader thread body: copies PTY output until the last slave fd closes.
fn read_output(
    mut reader: Box<dyn Read + Send>,
    pumped: std_mpsc::SyncSender<Pumped>,
    control: Arc<ProcessControl>,
) {
    let mut buffer = [0u8; READ_BUFFER_SIZE];

    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                if pumped.send(Pumped::Data(buffer[..n].to_vec())).is_err() {
                    return;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            // Linux reports EIO once the slave side is gone.
            Err(e) => {
                tracing::trace!(process_id = %control.id, error = %e, "PTY read ended");
                break;
            }
        }
    }

    let _ = pumped.send(Pumped::Eof);
}

/// Waiter thread body: reaps the child as soon as it exits, independent of
/// whether the PTY has reached EOF.
fn wait_child(
    mut child: Box<dyn Child + Send + Sync>,
    pumped: std_mpsc::SyncSender<Pumped>,
    control: Arc<ProcessControl>,
) {
    let info = match child.wait() {
        Ok(status) => exit_info(&status),
        Err(e) => {
            tracing::warn!(process_id = %control.id, error = %e, "Failed to reap process");
            ExitInfo {
                code: 1,
                signal: None,
            }
        }
    };

    control.mark_exited();
    let _ = pumped.send(Pumped::Exited(info));
}

/// Forwarder thread body: delivers output in order, then exactly one exit
/// event once the child is reaped and its remaining output drained.
fn forward(
    pumped: std_mpsc::Receiver<Pumped>,
    events: mpsc::Sender<ProcessEvent>,
    control: Arc<ProcessControl>,
) {
    let mut exit: Option<ExitInfo> = None;
    let mut eof = false;
    let mut drain_deadline: Option<Instant> = None;

    loop {
        let next = match drain_deadline {
            None => match pumped.recv() {
                Ok(next) => next,
                Err(_) => break,
            },
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    tracing::debug!(process_id = %control.id, "PTY still busy after exit, stopped draining");
                    break;
                }
                match pumped.recv_timeout(DRAIN_QUIET.min(remaining)) {
                    Ok(next) => next,
                    Err(_) => break,
                }
            }
        };

        match next {
            Pumped::Data(bytes) => {
                let started = Instant::now();
                if events.blocking_send(ProcessEvent::Data(bytes)).is_err() {
                    // Nobody is listening. The waiter still reaps the child.
                    let _ = control.kill();
                    return;
                }
                // Time spent waiting on a slow consumer does not count.
                if let Some(deadline) = drain_deadline.as_mut() {
                    *deadline += started.elapsed();
                }
            }
            Pumped::Eof => {
                eof = true;
                if exit.is_some() {
                    break;
                }
            }
            Pumped::Exited(info) => {
                exit = Some(info);
                if eof {
                    break;
                }
                drain_deadline = Some(Instant::now() + DRAIN_LIMIT);
            }
        }
    }

    let info = exit.unwrap_or(ExitInfo {
        code: 1,
        signal: None,
    });

    tracing::info!(
        process_id = %control.id,
        code = info.code,
        signal = ?info.signal,
        "Process exited"
    );

    let _ = events.blocking_send(ProcessEvent::Exit(info));
}

/// Maps a reaped status to [`ExitInfo`].
///
/// `portable_pty` exposes the signal name only through `Display`.
fn exit_info(status: &portable_pty::ExitStatus) -> ExitInfo {
    let rendered = status.to_string();
    ExitInfo {
        code: status.exit_code(),
        signal: rendered
            .strip_prefix("Terminated by ")
            .map(str::to_string),
    }
}

/// Resolves a command to an executable path.
fn resolve_command(command: &str) -> Result<String, ProcessError> {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return Err(ProcessError::CommandNotFound(command.to_string()));
    }

    let path = std::path::Path::new(trimmed);
    if path.is_absolute() {
        if path.exists() {
            return Ok(trimmed.to_string());
        }
        return Err(ProcessError::CommandNotFound(trimmed.to_string()));
    }

    which::which(trimmed)
        .map(|p| p.to_string_lossy().into_owned())
        .map_err(|_| ProcessError::CommandNotFound(trimmed.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn sh() -> (PtyProcess, mpsc::Receiver<ProcessEvent>) {
        PtyProcess::spawn("/bin/sh", SpawnOptions::default()).unwrap()
    }

    /// Drains events until exit, returning collected output and the exit info.
    async fn drain(rx: &mut mpsc::Receiver<ProcessEvent>) -> (String, ExitInfo, usize) {
        let mut output = Vec::new();
        let mut exits = 0;
        let mut info = None;

        while let Ok(Some(event)) = timeout(Duration::from_secs(5), rx.recv()).await {
            match event {
                ProcessEvent::Data(bytes) => {
                    assert!(info.is_none(), "data after exit");
                    output.extend_from_slice(&bytes);
                }
                ProcessEvent::Exit(i) => {
                    exits += 1;
                    info = Some(i);
                }
            }
        }

        (
            String::from_utf8_lossy(&output).into_owned(),
            info.expect("no exit event"),
            exits,
        )
    }

    #[test]
    fn test_resolve_command() {
        assert!(resolve_command("/bin/sh").is_ok());
        assert!(resolve_command("sh").is_ok());
        assert!(matches!(
            resolve_command("/nonexistent/shell"),
            Err(ProcessError::CommandNotFound(_))
        ));
        assert!(matches!(
            resolve_command("  "),
            Err(ProcessError::CommandNotFound(_))
        ));
    }

    #[test]
    fn test_spawn_missing_command_is_spawn_error() {
        let err = PtyProcess::spawn("/nonexistent/shell", SpawnOptions::default())
            .err()
            .unwrap();
        assert!(err.is_spawn_error());
        assert!(!ProcessError::AlreadyExited("x".into()).is_spawn_error());
    }

    #[tokio::test]
    async fn test_spawn_and_initial_state() {
        let (process, _rx) = sh();
        assert_eq!(process.state(), ProcessState::Running);
        assert_eq!(process.size(), (80, 24));
        assert!(process.pid().is_some());
        assert_eq!(process.command(), "/bin/sh");
        process.kill().unwrap();
    }

    #[tokio::test]
    async fn test_write_and_read_output() {
        let (process, mut rx) = sh();
        process.write(b"echo pty_output_$((40+2))\n").await.unwrap();
        process.write(b"exit\n").await.unwrap();

        let (output, info, exits) = drain(&mut rx).await;
        assert!(output.contains("pty_output_42"));
        assert!(info.success());
        assert_eq!(exits, 1);
    }

    #[tokio::test]
    async fn test_exit_code_is_reported() {
        let (process, mut rx) = sh();
        process.write(b"exit 42\n").await.unwrap();

        let (_, info, exits) = drain(&mut rx).await;
        assert_eq!(info.code, 42);
        assert_eq!(exits, 1);
        assert_eq!(process.state(), ProcessState::Exited);
    }

    #[tokio::test]
    async fn test_env_and_cwd() {
        let dir = tempfile::TempDir::new().unwrap();
        let options = SpawnOptions {
            cwd: Some(dir.path().to_path_buf()),
            env: vec![("TERMHOST_TEST_VAR".to_string(), "env_marker".to_string())],
            ..SpawnOptions::default()
        };
        let (process, mut rx) = PtyProcess::spawn("/bin/sh", options).unwrap();
        process
            .write(b"echo $TERMHOST_TEST_VAR; pwd; exit\n")
            .await
            .unwrap();

        let (output, _, _) = drain(&mut rx).await;
        assert!(output.contains("env_marker"));
        let dir_name = dir.path().file_name().unwrap().to_string_lossy();
        assert!(output.contains(dir_name.as_ref()));
    }

    #[tokio::test]
    async fn test_resize_updates_size() {
        let (process, _rx) = sh();
        process.resize(120, 40);
        assert_eq!(process.size(), (120, 40));
        process.kill().unwrap();
    }

    #[tokio::test]
    async fn test_kill_is_idempotent_and_exits_once() {
        let (process, mut rx) = sh();
        process.kill().unwrap();
        process.kill().unwrap();
        process.kill_handle().kill().unwrap();

        let (_, info, exits) = drain(&mut rx).await;
        assert_eq!(exits, 1);
        assert!(!info.success());

        process.kill().unwrap();
    }

    #[tokio::test]
    async fn test_write_and_resize_after_exit() {
        let (process, mut rx) = sh();
        process.write(b"exit 0\n").await.unwrap();
        let _ = drain(&mut rx).await;

        let result = process.write(b"echo hi\n").await;
        assert!(matches!(result, Err(ProcessError::AlreadyExited(_))));

        process.resize(100, 50);
        assert_eq!(process.size(), (80, 24));
    }

    #[tokio::test]
    async fn test_drop_kills_process() {
        let (process, mut rx) = sh();
        let handle = process.kill_handle();
        drop(process);

        let (_, _, exits) = drain(&mut rx).await;
        assert_eq!(exits, 1);
        assert!(handle.has_exited());
    }

    #[tokio::test]
    async fn test_exit_reported_while_background_job_holds_terminal() {
        let (process, mut rx) = sh();
        process.write(b"sleep 5 &\nexit 0\n").await.unwrap();

        let started = std::time::Instant::now();
        let mut exits = 0;
        let mut info = None;
        while let Ok(Some(event)) = timeout(Duration::from_secs(3), rx.recv()).await {
            if let ProcessEvent::Exit(i) = event {
                exits += 1;
                info = Some(i);
                break;
            }
        }

        assert_eq!(exits, 1);
        assert!(info.unwrap().success());
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(process.state(), ProcessState::Exited);
    }

    #[tokio::test]
    async fn test_output_before_exit_is_not_lost() {
        let (process, mut rx) = sh();
        process
            .write(b"sleep 5 & echo tail_marker; exit 3\n")
            .await
            .unwrap();

        let (output, info, exits) = drain(&mut rx).await;
        assert!(output.contains("tail_marker"));
        assert_eq!(info.code, 3);
        assert_eq!(exits, 1);
    }

    #[test]
    fn test_exit_info_from_status() {
        let info = exit_info(&portable_pty::ExitStatus::with_exit_code(3));
        assert_eq!(
            info,
            ExitInfo {
                code: 3,
                signal: None
            }
        );

        let info = exit_info(&portable_pty::ExitStatus::with_signal("Hangup"));
        assert_eq!(info.signal.as_deref(), Some("Hangup"));
        assert!(!info.success());
    }

    #[tokio::test]
    async fn test_input_writer_outlives_borrow() {
        let (process, mut rx) = sh();
        let input = process.input_writer();

        let task = tokio::spawn(async move {
            input.write(b"echo owned_$((6*7))\n".to_vec()).await?;
            input.write(b"exit\n".to_vec()).await
        });
        task.await.unwrap().unwrap();

        let (output, _, exits) = drain(&mut rx).await;
        assert!(output.contains("owned_42"));
        assert_eq!(exits, 1);

        let late = process.input_writer().write(b"x".to_vec()).await;
        assert!(matches!(late, Err(ProcessError::AlreadyExited(_))));
    }

    #[tokio::test]
    async fn test_small_queue_applies_backpressure_without_loss() {
        let options = SpawnOptions {
            queue_capacity: 1,
            ..SpawnOptions::default()
        };
        let (process, mut rx) = PtyProcess::spawn("/bin/sh", options).unwrap();
        process
            .write(b"i=0; while [ $i -lt 200 ]; do echo line$i; i=$((i+1)); done; exit\n")
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let (output, _, exits) = drain(&mut rx).await;
        assert!(output.contains("line199"));
        assert_eq!(exits, 1);
    }
}
