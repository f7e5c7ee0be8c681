//! Backend process supervisor
//!
//! Owns the lifecycle of the out-of-process analysis backend: spawning it,
//! watching stdout for the readiness handshake, restarting it after
//! unexpected exits and shutting it down on request.
//!
//! State machine:
//!
//! ```text
//! Stopped --start()--> Starting --(port+pid announced)--> Started --stop()--> Stopping --(exit)--> Stopped
//! Started --(unexpected exit)--> Restarting --(backoff)--> Starting --> ...
//! Started --restart()--> Restarting --(old process reaped)--> Starting --> ...
//! ```
//!
//! All state is published through a `watch` channel so readers never block
//! on lifecycle operations. Lifecycle transitions are serialized by an async
//! mutex; event callbacks always run with no internal lock held.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Level, debug, error, info, warn};

use crate::io::{
    ChildProcessManager, OutputMonitor, ProcessExitEvent, ProcessExitHandler, ProcessManager,
    StopMode, send_signal,
};
use crate::log_timing;
use crate::process::config::{RestartPolicy, SupervisorConfig};
use crate::process::error::SupervisorError;
use crate::process::handshake::{HandshakeUpdate, ReadinessTracker};

// ============================================================================
// Public State Types
// ============================================================================

/// Lifecycle status of the supervised backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Stopped,
    Starting,
    Started,
    Restarting,
    Stopping,
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::Starting => "starting",
            ProcessStatus::Started => "started",
            ProcessStatus::Restarting => "restarting",
            ProcessStatus::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Externally visible view of the supervised process
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessSnapshot {
    pub status: ProcessStatus,

    /// PID announced by the backend (may differ from the spawned interpreter)
    pub pid: Option<u32>,

    /// Loopback port announced by the backend
    pub port: Option<u16>,

    /// Incremented for every spawn
    pub generation: u64,

    /// True until the first spawn has been attempted
    pub first_start: bool,

    /// Consecutive automatic restart attempts
    pub restart_attempts: u32,

    /// Automatic restarts exhausted
    pub failing: bool,

    /// When the current process became ready
    pub started_at: Option<DateTime<Utc>>,
}

impl Default for ProcessSnapshot {
    fn default() -> Self {
        Self {
            status: ProcessStatus::Stopped,
            pid: None,
            port: None,
            generation: 0,
            first_start: true,
            restart_attempts: 0,
            failing: false,
            started_at: None,
        }
    }
}

/// Lifecycle events delivered to registered callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// The backend announced its port and pid
    Started,
    /// The backend process exited
    Stopped { code: Option<i32> },
    /// A restart is about to spawn a new process; open sockets are stale
    Restarting,
}

/// Event selector for [`Supervisor::on`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Started,
    Stopped,
    Restarting,
}

impl SupervisorEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SupervisorEvent::Started => EventKind::Started,
            SupervisorEvent::Stopped { .. } => EventKind::Stopped,
            SupervisorEvent::Restarting => EventKind::Restarting,
        }
    }
}

type EventCallback = Arc<dyn Fn(&SupervisorEvent) + Send + Sync>;

// ============================================================================
// Supervisor
// ============================================================================

struct Inner {
    config: SupervisorConfig,

    /// Single writer: the supervisor itself
    state: watch::Sender<ProcessSnapshot>,

    /// Current child process, if one was spawned
    process: tokio::sync::Mutex<Option<ChildProcessManager>>,

    /// Serializes start/stop/restart
    lifecycle: tokio::sync::Mutex<()>,

    /// Handshake progress, tagged with the generation it belongs to
    tracker: Mutex<(u64, ReadinessTracker)>,

    callbacks: Mutex<Vec<(EventKind, EventCallback)>>,

    startup_timer: Mutex<Option<JoinHandle<()>>>,
    restart_task: Mutex<Option<JoinHandle<()>>>,

    spawned_at: Mutex<Option<Instant>>,
}

/// Supervisor handle; cheap to clone, all clones share one backend
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Routes a child's exit back to the supervisor, tagged with its generation
struct GenerationExitHandler {
    supervisor: Weak<Inner>,
    generation: u64,
}

#[async_trait]
impl ProcessExitHandler for GenerationExitHandler {
    async fn on_process_exit(&self, event: ProcessExitEvent) {
        if let Some(inner) = self.supervisor.upgrade() {
            Supervisor { inner }.handle_exit(self.generation, event.code);
        }
    }
}

/// Outcome of an exit, decided under the state lock and acted on outside it
enum ExitOutcome {
    Stale,
    Requested,
    Unexpected(Recovery),
}

/// What happens after a failed generation
#[derive(Debug, Clone, Copy)]
enum Recovery {
    Restart { attempt: u32 },
    GiveUp { attempts: u32 },
}

impl Recovery {
    /// Count a failed generation against the policy and move the status to
    /// `Restarting`, or to `Stopped` with the breaker open
    fn plan(s: &mut ProcessSnapshot, policy: &RestartPolicy, uptime: Option<Duration>) -> Self {
        if uptime.is_some_and(|uptime| uptime >= policy.reset_after) {
            s.restart_attempts = 0;
        }
        let attempt = s.restart_attempts + 1;
        if policy.allows_attempt(attempt) {
            s.restart_attempts = attempt;
            s.status = ProcessStatus::Restarting;
            Recovery::Restart { attempt }
        } else {
            s.status = ProcessStatus::Stopped;
            s.failing = true;
            Recovery::GiveUp {
                attempts: s.restart_attempts,
            }
        }
    }
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let (state, _) = watch::channel(ProcessSnapshot::default());
        Self {
            inner: Arc::new(Inner {
                config,
                state,
                process: tokio::sync::Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
                tracker: Mutex::new((0, ReadinessTracker::new())),
                callbacks: Mutex::new(Vec::new()),
                startup_timer: Mutex::new(None),
                restart_task: Mutex::new(None),
                spawned_at: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn snapshot(&self) -> ProcessSnapshot {
        self.inner.state.borrow().clone()
    }

    pub fn status(&self) -> ProcessStatus {
        self.inner.state.borrow().status
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.state.borrow().pid
    }

    pub fn port(&self) -> Option<u16> {
        self.inner.state.borrow().port
    }

    pub fn generation(&self) -> u64 {
        self.inner.state.borrow().generation
    }

    pub fn is_ready(&self) -> bool {
        self.status() == ProcessStatus::Started
    }

    /// True once automatic restarts have been exhausted
    pub fn is_failing(&self) -> bool {
        self.inner.state.borrow().failing
    }

    /// Subscribe to snapshot changes
    pub fn subscribe(&self) -> watch::Receiver<ProcessSnapshot> {
        self.inner.state.subscribe()
    }

    /// Register a callback; callbacks for one kind run in registration order
    pub fn on<F>(&self, kind: EventKind, callback: F)
    where
        F: Fn(&SupervisorEvent) + Send + Sync + 'static,
    {
        lock(&self.inner.callbacks).push((kind, Arc::new(callback)));
    }

    /// Wait until the backend is ready
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<(), SupervisorError> {
        let snapshot = self
            .wait_for_snapshot(timeout, |s| s.status == ProcessStatus::Started || s.failing)
            .await
            .ok_or_else(|| SupervisorError::startup_timeout(timeout))?;

        if snapshot.status == ProcessStatus::Started {
            Ok(())
        } else {
            Err(SupervisorError::Failing {
                attempts: snapshot.restart_attempts,
            })
        }
    }

    async fn wait_for_snapshot<F>(&self, timeout: Duration, predicate: F) -> Option<ProcessSnapshot>
    where
        F: FnMut(&ProcessSnapshot) -> bool,
    {
        let mut receiver = self.inner.state.subscribe();
        let result = tokio::time::timeout(timeout, receiver.wait_for(predicate)).await;
        result.ok()?.ok().map(|snapshot| snapshot.clone())
    }

    // ------------------------------------------------------------------------
    // Lifecycle operations
    // ------------------------------------------------------------------------

    /// Spawn the backend unless one is already starting or running
    ///
    /// An explicit start closes the circuit breaker.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let _guard = self.inner.lifecycle.lock().await;
        self.abort_restart_task();
        self.start_locked(true).await
    }

    /// Ask the backend to terminate; does not wait for it to exit
    pub async fn stop(&self) {
        let _guard = self.inner.lifecycle.lock().await;
        self.abort_restart_task();
        self.stop_locked().await;
    }

    /// Terminate the current backend, wait for it to exit, and spawn a new one
    pub async fn restart(&self) -> Result<(), SupervisorError> {
        let _guard = self.inner.lifecycle.lock().await;
        self.abort_restart_task();

        info!("Restarting CodeIntel");
        self.inner.state.send_modify(|s| {
            s.status = ProcessStatus::Restarting;
            s.restart_attempts = 0;
            s.failing = false;
        });
        self.emit(SupervisorEvent::Restarting);

        self.terminate_current().await;
        self.start_locked(true).await
    }

    /// Stop the backend and wait for it to exit, force killing after the stop
    /// timeout
    pub async fn shutdown(&self) {
        let _guard = self.inner.lifecycle.lock().await;
        self.abort_restart_task();
        self.stop_locked().await;

        let stop_timeout = self.inner.config.stop_timeout;
        let stopped = |s: &ProcessSnapshot| s.status == ProcessStatus::Stopped;

        if self.wait_for_snapshot(stop_timeout, stopped).await.is_none() {
            warn!(
                "Backend did not exit within {:?}, killing it",
                stop_timeout
            );
            let announced = self.pid();
            let mut process = self.inner.process.lock().await;
            if let Some(manager) = process.as_mut() {
                Self::signal(manager, announced, StopMode::Force).await;
            }
            drop(process);

            if self.wait_for_snapshot(stop_timeout, stopped).await.is_none() {
                error!("Backend still running after force kill");
            }
        }
    }

    async fn start_locked(&self, reset_breaker: bool) -> Result<(), SupervisorError> {
        let snapshot = self.snapshot();
        if !matches!(
            snapshot.status,
            ProcessStatus::Stopped | ProcessStatus::Restarting
        ) {
            debug!("start() ignored, backend is {}", snapshot.status);
            return Ok(());
        }

        let config = &self.inner.config;
        let generation = snapshot.generation + 1;
        let args = config.command_args(snapshot.first_start);

        info!("Starting CodeIntel (generation {})", generation);

        let mut manager = ChildProcessManager::new(
            config.interpreter.to_string_lossy().to_string(),
            args,
            config.effective_working_directory(),
        );

        if let Some(library_path) = config.library_path_value()? {
            debug!("{}: {:?}", config.library_path_var, library_path);
            manager = manager.with_env(&config.library_path_var, library_path);
        }
        for (key, value) in &config.extra_env {
            manager = manager.with_env(key, value);
        }

        self.install_observers(&mut manager, generation);

        *lock(&self.inner.tracker) = (generation, ReadinessTracker::new());
        self.inner.state.send_modify(|s| {
            s.status = ProcessStatus::Starting;
            s.generation = generation;
            s.first_start = false;
            s.pid = None;
            s.port = None;
            s.started_at = None;
            if reset_breaker {
                s.restart_attempts = 0;
                s.failing = false;
            }
        });

        if let Err(e) = manager.start().await {
            error!("Failed to spawn backend: {}", e);
            self.inner.state.send_modify(|s| {
                s.status = ProcessStatus::Stopped;
            });
            self.emit(SupervisorEvent::Stopped { code: None });
            return Err(e.into());
        }

        *lock(&self.inner.spawned_at) = Some(Instant::now());
        *self.inner.process.lock().await = Some(manager);
        self.arm_startup_timer(generation);

        Ok(())
    }

    async fn stop_locked(&self) {
        info!("Stopping CodeIntel Process");
        self.cancel_startup_timer();

        let status = self.status();
        match status {
            ProcessStatus::Stopped => {
                debug!("stop() ignored, backend already stopped");
                return;
            }
            ProcessStatus::Restarting => {
                let process = self.inner.process.lock().await;
                if !process.as_ref().is_some_and(|m| m.is_running()) {
                    // Crashed and waiting for a backoff restart; nothing to signal
                    self.inner.state.send_modify(|s| {
                        s.status = ProcessStatus::Stopped;
                    });
                    return;
                }
            }
            _ => {}
        }

        self.inner.state.send_modify(|s| {
            s.status = ProcessStatus::Stopping;
        });

        let announced = self.pid();
        let mut process = self.inner.process.lock().await;
        if let Some(manager) = process.as_mut()
            && manager.is_running()
        {
            Self::signal(manager, announced, StopMode::Graceful).await;
            return;
        }
        drop(process);

        self.inner.state.send_modify(|s| {
            s.status = ProcessStatus::Stopped;
            s.pid = None;
            s.port = None;
        });
    }

    /// Signal the current process (if running) and wait for it to exit
    async fn terminate_current(&self) {
        let stop_timeout = self.inner.config.stop_timeout;
        let announced = self.pid();
        let mut process = self.inner.process.lock().await;
        let Some(manager) = process.as_mut() else {
            return;
        };
        if !manager.is_running() {
            return;
        }

        Self::signal(manager, announced, StopMode::Graceful).await;
        if tokio::time::timeout(stop_timeout, manager.wait_for_exit())
            .await
            .is_err()
        {
            warn!(
                "Backend did not exit within {:?} of SIGTERM, killing it",
                stop_timeout
            );
            Self::signal(manager, announced, StopMode::Force).await;
            if tokio::time::timeout(stop_timeout, manager.wait_for_exit())
                .await
                .is_err()
            {
                error!("Backend still running after force kill");
            }
        }
    }

    /// Signal the spawned process and, when it differs, the announced one
    ///
    /// The spawned interpreter may only be a parent of the serving process, so
    /// a signal to it alone does not reliably reach the server.
    async fn signal(manager: &mut ChildProcessManager, announced: Option<u32>, mode: StopMode) {
        if let Some(pid) = announced
            && Some(pid) != manager.pid()
        {
            debug!("Signalling announced backend process {}", pid);
            if let Err(e) = send_signal(pid, mode) {
                warn!("Failed to signal backend process {}: {}", pid, e);
            }
        }

        if let Err(e) = manager.stop(mode).await {
            warn!("Failed to signal spawned process: {}", e);
        }
    }

    // ------------------------------------------------------------------------
    // Internal event handlers
    // ------------------------------------------------------------------------

    fn install_observers(&self, manager: &mut ChildProcessManager, generation: u64) {
        let weak = Arc::downgrade(&self.inner);
        let parser = Arc::clone(&self.inner.config.handshake);
        manager.on_stdout_line(move |line| {
            let update = parser.parse_line(&line);
            if update.is_empty() {
                debug!("stdout: {}", line);
                return;
            }
            if let Some(inner) = weak.upgrade() {
                Supervisor { inner }.handle_handshake(generation, update);
            }
        });

        manager.on_stderr_line(|line| warn!("stderr: {}", line));

        manager.on_process_exit(Arc::new(GenerationExitHandler {
            supervisor: Arc::downgrade(&self.inner),
            generation,
        }));
    }

    fn handle_handshake(&self, generation: u64, update: HandshakeUpdate) {
        let announced = {
            let mut tracker = lock(&self.inner.tracker);
            if tracker.0 != generation {
                return;
            }
            let ready = tracker.1.observe(update);
            ready.then(|| (tracker.1.port(), tracker.1.pid()))
        };
        let Some((Some(port), Some(pid))) = announced else {
            return;
        };

        let mut became_ready = false;
        self.inner.state.send_if_modified(|s| {
            if s.generation != generation {
                return false;
            }
            s.port = Some(port);
            s.pid = Some(pid);
            if s.status == ProcessStatus::Starting {
                s.status = ProcessStatus::Started;
                s.started_at = Some(Utc::now());
                became_ready = true;
            }
            true
        });

        if became_ready {
            self.cancel_startup_timer();
            info!("CodeIntel started on port {} (pid {})", port, pid);
            if let Some(spawned_at) = *lock(&self.inner.spawned_at) {
                log_timing!(Level::INFO, "backend_startup", spawned_at.elapsed());
            }
            self.emit(SupervisorEvent::Started);
        }
    }

    fn handle_exit(&self, generation: u64, code: Option<i32>) {
        let policy = &self.inner.config.restart_policy;
        let mut outcome = ExitOutcome::Stale;
        self.inner.state.send_if_modified(|s| {
            if s.generation != generation {
                return false;
            }

            outcome = match s.status {
                ProcessStatus::Started | ProcessStatus::Starting => {
                    let uptime = s
                        .started_at
                        .and_then(|started| (Utc::now() - started).to_std().ok());
                    ExitOutcome::Unexpected(Recovery::plan(s, policy, uptime))
                }
                _ => {
                    s.status = ProcessStatus::Stopped;
                    ExitOutcome::Requested
                }
            };
            s.pid = None;
            s.port = None;
            s.started_at = None;
            true
        });

        match outcome {
            ExitOutcome::Stale => {
                debug!(
                    "Ignoring exit (code {:?}) of stale generation {}",
                    code, generation
                );
            }
            ExitOutcome::Requested => {
                info!("CodeIntel stopped, code: {:?}", code);
                self.cancel_startup_timer();
                self.emit(SupervisorEvent::Stopped { code });
            }
            ExitOutcome::Unexpected(recovery) => {
                warn!(
                    "Process stopped without a request to stop it (code {:?})",
                    code
                );
                self.cancel_startup_timer();
                self.emit(SupervisorEvent::Stopped { code });
                self.schedule_recovery(generation, recovery);
            }
        }
    }

    /// Arm the backoff timer for a planned restart, or log giving up
    fn schedule_recovery(&self, generation: u64, recovery: Recovery) {
        let policy = &self.inner.config.restart_policy;
        let attempt = match recovery {
            Recovery::Restart { attempt } => attempt,
            Recovery::GiveUp { attempts } => {
                error!(
                    "CodeIntel keeps failing, giving up after {} restart attempts",
                    attempts
                );
                return;
            }
        };

        let delay = policy.delay_for_attempt(attempt);
        info!(
            "Scheduling restart attempt {}/{} in {:?}",
            attempt, policy.max_attempts, delay
        );

        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Some(inner) = weak.upgrade() {
                Supervisor { inner }.recover(generation).await;
            }
        });
        *lock(&self.inner.restart_task) = Some(task);
    }

    async fn recover(&self, generation: u64) {
        let _guard = self.inner.lifecycle.lock().await;
        // Detach our own handle so lifecycle calls below cannot abort us
        lock(&self.inner.restart_task).take();

        let snapshot = self.snapshot();
        if snapshot.generation != generation || snapshot.status != ProcessStatus::Restarting {
            debug!("Restart of generation {} superseded", generation);
            return;
        }

        self.emit(SupervisorEvent::Restarting);
        if let Err(e) = self.start_locked(false).await {
            error!("Restart attempt failed: {}", e);
            // Still under the lifecycle lock, so no stop() can slip in here
            let policy = &self.inner.config.restart_policy;
            let mut recovery = Recovery::GiveUp { attempts: 0 };
            self.inner.state.send_modify(|s| {
                recovery = Recovery::plan(s, policy, None);
            });
            self.schedule_recovery(self.generation(), recovery);
        }
    }

    fn arm_startup_timer(&self, generation: u64) {
        let timeout = self.inner.config.startup_timeout;
        let weak = Arc::downgrade(&self.inner);

        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let supervisor = Supervisor { inner };
            let snapshot = supervisor.snapshot();
            if snapshot.generation != generation || snapshot.status != ProcessStatus::Starting {
                return;
            }

            warn!(
                "Backend did not announce readiness within {:?}, killing it",
                timeout
            );
            let mut process = supervisor.inner.process.lock().await;
            if let Some(manager) = process.as_mut()
                && let Err(e) = manager.stop(StopMode::Force).await
            {
                warn!("Failed to kill unresponsive backend: {}", e);
            }
        });

        if let Some(previous) = lock(&self.inner.startup_timer).replace(task) {
            previous.abort();
        }
    }

    fn cancel_startup_timer(&self) {
        if let Some(timer) = lock(&self.inner.startup_timer).take() {
            timer.abort();
        }
    }

    fn abort_restart_task(&self) {
        if let Some(task) = lock(&self.inner.restart_task).take() {
            task.abort();
        }
    }

    fn emit(&self, event: SupervisorEvent) {
        let kind = event.kind();
        let callbacks: Vec<EventCallback> = lock(&self.inner.callbacks)
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        debug!(
            "Calling callbacks for: {:?}, number: {}",
            kind,
            callbacks.len()
        );
        for callback in callbacks {
            callback(&event);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in [
            self.startup_timer.get_mut(),
            self.restart_task.get_mut(),
        ]
        .into_iter()
        .flatten()
        {
            if let Some(task) = task.take() {
                task.abort();
            }
        }

        if let Some(manager) = self.process.get_mut().as_mut()
            && manager.is_running()
        {
            manager.kill_sync();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
