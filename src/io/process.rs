//! Process management layer
//!
//! Handles external process lifecycle and stdout/stderr monitoring,
//! completely separate from transport concerns.

use async_trait::async_trait;
use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, trace, warn};

// ============================================================================
// Process State Management
// ============================================================================

/// How to stop a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Ask the process to terminate (SIGTERM)
    Graceful,
    /// Force kill immediately (SIGKILL)
    Force,
}

/// Process lifecycle states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    /// Process has not been started yet
    NotStarted,
    /// Process is currently running
    Running { pid: u32 },
    /// Process has exited; `code` is None when it was terminated by a signal
    Exited { code: Option<i32> },
}

impl ProcessState {
    /// Get the process ID if the process is running
    pub fn pid(&self) -> Option<u32> {
        match self {
            ProcessState::Running { pid } => Some(*pid),
            _ => None,
        }
    }

    /// Check if the process is currently running
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running { .. })
    }
}

// ============================================================================
// Process Exit Events
// ============================================================================

/// Event fired when the process exits, for whatever reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExitEvent {
    /// PID of the process that exited
    pub pid: Option<u32>,
    /// Exit code, None when terminated by a signal or when waiting failed
    pub code: Option<i32>,
}

/// Trait for handling process exit events
#[async_trait]
pub trait ProcessExitHandler: Send + Sync {
    /// Called once the child has been reaped
    async fn on_process_exit(&self, event: ProcessExitEvent);
}

// ============================================================================
// Output Monitoring Trait
// ============================================================================

type LineHandler = Box<dyn Fn(String) + Send + Sync>;

/// Trait for monitoring stdout/stderr output from external processes
///
/// Handlers are called once per non-empty, trimmed line. Only one handler per
/// stream can be active at a time; installing a new one replaces the previous.
/// Handlers must be installed before the process is started.
pub trait OutputMonitor: Send + Sync {
    fn on_stdout_line<F>(&mut self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static;

    fn on_stderr_line<F>(&mut self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static;
}

// ============================================================================
// Process Management
// ============================================================================

/// Error types for process management
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Process not started")]
    NotStarted,

    #[error("Process already started")]
    AlreadyStarted,

    #[error("Stdout not available")]
    StdoutNotAvailable,

    #[error("Stderr not available")]
    StderrNotAvailable,
}

/// Trait for managing external process lifecycle
#[async_trait]
pub trait ProcessManager: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Start the external process
    async fn start(&mut self) -> Result<(), Self::Error>;

    /// Signal the external process to stop; does not wait for it to exit
    async fn stop(&mut self, mode: StopMode) -> Result<(), Self::Error>;

    /// Check if the process is currently running
    fn is_running(&self) -> bool;

    /// PID of the spawned process while it is running
    fn pid(&self) -> Option<u32>;

    /// Wait until the process has exited and return its exit code
    async fn wait_for_exit(&self) -> Option<i32>;

    /// Synchronous force kill for Drop trait implementations
    fn kill_sync(&mut self);
}

/// Manages child processes spawned via Command
pub struct ChildProcessManager {
    /// Command to execute
    command: String,

    /// Command arguments
    args: Vec<String>,

    /// Working directory for the process (optional)
    working_directory: Option<PathBuf>,

    /// Extra environment variables layered over the inherited environment
    env: Vec<(String, OsString)>,

    /// Process state, written by start() and the wait task
    state: watch::Sender<ProcessState>,

    /// Stdout handler
    stdout_handler: Option<LineHandler>,

    /// Stderr handler
    stderr_handler: Option<LineHandler>,

    /// Output monitoring task handles
    stdout_task: Option<JoinHandle<()>>,
    stderr_task: Option<JoinHandle<()>>,

    /// Process wait task handle (waits for child to exit)
    wait_task: Option<JoinHandle<()>>,

    /// Asks the wait task to kill the child
    kill_sender: Option<oneshot::Sender<()>>,

    /// Process exit event handler
    exit_handler: Option<Arc<dyn ProcessExitHandler>>,
}

impl ChildProcessManager {
    /// Create a new child process manager
    ///
    /// # Arguments
    /// * `command` - The command to execute
    /// * `args` - Command line arguments
    /// * `working_dir` - Optional working directory for the process
    pub fn new(command: String, args: Vec<String>, working_dir: Option<PathBuf>) -> Self {
        let (state, _) = watch::channel(ProcessState::NotStarted);
        Self {
            command,
            args,
            working_directory: working_dir,
            env: Vec::new(),
            state,
            stdout_handler: None,
            stderr_handler: None,
            stdout_task: None,
            stderr_task: None,
            wait_task: None,
            kill_sender: None,
            exit_handler: None,
        }
    }

    /// Add an environment variable for the child
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Install the handler fired when the child exits
    pub fn on_process_exit(&mut self, handler: Arc<dyn ProcessExitHandler>) {
        self.exit_handler = Some(handler);
    }

    /// Get current process state
    pub fn get_state(&self) -> ProcessState {
        self.state.borrow().clone()
    }

    /// Command line this manager spawns, for diagnostics
    pub fn command_line(&self) -> (&str, &[String]) {
        (&self.command, &self.args)
    }

    /// Spawn a task that forwards lines of `stream` to `handler`
    ///
    /// Always drains the stream so the child never blocks on a full pipe.
    fn spawn_line_monitor<R>(
        stream: R,
        name: &'static str,
        handler: Option<LineHandler>,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stream);
            let mut line = String::new();

            trace!(
                "ChildProcessManager: Starting {} monitoring (handler: {})",
                name,
                if handler.is_some() {
                    "installed"
                } else {
                    "draining only"
                }
            );

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        trace!("ChildProcessManager: {} EOF reached", name);
                        break;
                    }
                    Ok(_) => {
                        let line_content = line.trim().to_string();
                        if line_content.is_empty() {
                            continue;
                        }
                        match handler {
                            Some(ref handler) => handler(line_content),
                            None => trace!("ChildProcessManager: {} drained: {}", name, line_content),
                        }
                    }
                    Err(e) => {
                        error!("Failed to read from {}: {}", name, e);
                        break;
                    }
                }
            }

            trace!("ChildProcessManager: {} monitoring finished", name);
        })
    }

    /// Spawn the wait task that monitors child process exit
    fn spawn_wait_task(&mut self, mut child: Child, pid: u32) {
        let exit_handler = self.exit_handler.clone();
        let state = self.state.clone();
        let (kill_sender, mut kill_receiver) = oneshot::channel::<()>();
        self.kill_sender = Some(kill_sender);

        let task = tokio::spawn(async move {
            trace!("ChildProcessManager: Starting wait task for PID {}", pid);

            let status = tokio::select! {
                status = child.wait() => status,
                Ok(()) = &mut kill_receiver => {
                    if let Err(e) = child.start_kill() {
                        warn!("Failed to kill process {}: {}", pid, e);
                    }
                    child.wait().await
                }
            };

            let code = match status {
                Ok(exit_status) => {
                    info!("Process PID {} exited with status: {}", pid, exit_status);
                    exit_status.code()
                }
                Err(e) => {
                    error!("Error waiting for child process {}: {}", pid, e);
                    None
                }
            };

            state.send_replace(ProcessState::Exited { code });

            if let Some(handler) = &exit_handler {
                handler
                    .on_process_exit(ProcessExitEvent {
                        pid: Some(pid),
                        code,
                    })
                    .await;
            }

            trace!("ChildProcessManager: Wait task finished for PID {}", pid);
        });

        self.wait_task = Some(task);
    }
}

#[async_trait]
impl ProcessManager for ChildProcessManager {
    type Error = ProcessError;

    async fn start(&mut self) -> Result<(), Self::Error> {
        if !matches!(self.get_state(), ProcessState::NotStarted) {
            return Err(ProcessError::AlreadyStarted);
        }

        info!("Starting process: {} {:?}", self.command, self.args);

        let mut command_builder = Command::new(&self.command);
        command_builder
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(working_dir) = &self.working_directory {
            command_builder.current_dir(working_dir);
        }

        for (key, value) in &self.env {
            command_builder.env(key, value);
        }

        let mut child = command_builder.spawn()?;

        let pid = child.id().ok_or_else(|| {
            ProcessError::Io(std::io::Error::other("Failed to get process ID"))
        })?;
        info!("Process started with PID: {}", pid);

        self.state.send_replace(ProcessState::Running { pid });

        let stdout = child
            .stdout
            .take()
            .ok_or(ProcessError::StdoutNotAvailable)?;
        let stderr = child
            .stderr
            .take()
            .ok_or(ProcessError::StderrNotAvailable)?;

        self.stdout_task = Some(Self::spawn_line_monitor(
            stdout,
            "stdout",
            self.stdout_handler.take(),
        ));
        self.stderr_task = Some(Self::spawn_line_monitor(
            stderr,
            "stderr",
            self.stderr_handler.take(),
        ));

        // Consumes the child
        self.spawn_wait_task(child, pid);

        Ok(())
    }

    async fn stop(&mut self, mode: StopMode) -> Result<(), Self::Error> {
        let pid = match self.get_state().pid() {
            Some(pid) => pid,
            None => return Err(ProcessError::NotStarted),
        };

        match mode {
            StopMode::Graceful => {
                info!("Gracefully stopping process with PID: {}", pid);
                if let Err(e) = send_signal(pid, StopMode::Graceful) {
                    // Fall back to a hard kill where SIGTERM is unavailable
                    warn!("Failed to send SIGTERM to {}: {}, killing", pid, e);
                    if let Some(sender) = self.kill_sender.take() {
                        let _ = sender.send(());
                    }
                }
            }
            StopMode::Force => {
                info!("Force killing process with PID: {}", pid);
                if let Some(sender) = self.kill_sender.take() {
                    let _ = sender.send(());
                }
            }
        }

        Ok(())
    }

    fn is_running(&self) -> bool {
        self.get_state().is_running()
    }

    fn pid(&self) -> Option<u32> {
        self.get_state().pid()
    }

    async fn wait_for_exit(&self) -> Option<i32> {
        let mut receiver = self.state.subscribe();
        let result = receiver
            .wait_for(|state| !state.is_running())
            .await
            .map(|state| match *state {
                ProcessState::Exited { code } => code,
                _ => None,
            });
        result.unwrap_or(None)
    }

    fn kill_sync(&mut self) {
        let pid = match self.get_state().pid() {
            Some(pid) => pid,
            None => return,
        };

        info!("Synchronously force killing process with PID: {}", pid);

        if let Some(sender) = self.kill_sender.take() {
            let _ = sender.send(());
        } else if let Err(e) = send_signal(pid, StopMode::Force) {
            warn!("Failed to kill process {}: {}", pid, e);
        }
    }
}

impl OutputMonitor for ChildProcessManager {
    fn on_stdout_line<F>(&mut self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.stdout_handler = Some(Box::new(handler));
    }

    fn on_stderr_line<F>(&mut self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.stderr_handler = Some(Box::new(handler));
    }
}

impl Drop for ChildProcessManager {
    fn drop(&mut self) {
        if let Some(task) = self.stdout_task.take() {
            task.abort();
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

/// Send a termination signal to an arbitrary PID
///
/// Used for processes the manager did not spawn itself, such as the service
/// process an interpreter wrapper forks and announces on stdout.
#[cfg(unix)]
pub fn send_signal(pid: u32, mode: StopMode) -> io::Result<()> {
    let signal = match mode {
        StopMode::Graceful => libc::SIGTERM,
        StopMode::Force => libc::SIGKILL,
    };

    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "PID out of range"))?;

    // SAFETY: kill(2) has no memory-safety preconditions
    let result = unsafe { libc::kill(pid, signal) };
    if result == 0 {
        trace!("Sent signal {} to process {}", signal, pid);
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
pub fn send_signal(_pid: u32, _mode: StopMode) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "signals are not supported on this platform",
    ))
}
