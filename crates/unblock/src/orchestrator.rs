//! Orchestrator - runs one callable per worker process.
//!
//! The worker side is in worker.rs.
//!
//! Flow:
//! 1. Encode callable and arguments (nothing is created if this fails)
//! 2. Create the workspace and write the input slots
//! 3. Spawn the worker in its own process group, start the log streamer
//! 4. Wait for exit (or cancellation)
//! 5. Drain logs, interpret the exit status and output slots
//! 6. Remove the workspace
//!
//! Dropping the call future at any await point kills the worker's process group,
//! aborts the streamer and removes the workspace.

use std::ffi::OsString;
use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::bridge::codec;
use crate::bridge::protocol::{CallId, RemoteError, WORKER_ENV, WorkerExit};
use crate::callable::{Callable, payload_of};
use crate::error::{ProtocolError, RemoteFailure, UnblockError, WorkerFailure, failure_notes};
use crate::log_stream::{LogSink, LogStreamer, TracingSink};
use crate::workspace::{Slot, SlotPaths, Workspace};

/// Lines of worker stderr attached to failures.
const STDERR_TAIL_LINES: usize = 20;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Program (plus leading arguments) launched as the worker.
///
/// The six slot paths are always appended after `args`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    program: OsString,
    args: Vec<OsString>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// The running executable, which must call [`crate::worker::init`] in `main`.
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    fn spawn(&self, slots: &SlotPaths) -> io::Result<Child> {
        // Anything the worker prints before it redirects its own fds still lands in the slots.
        let stdout = OpenOptions::new().append(true).open(slots.get(Slot::Stdout))?;
        let stderr = OpenOptions::new().append(true).open(slots.get(Slot::Stderr))?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .args(slots.to_args())
            .env(WORKER_ENV, "1")
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd.spawn()
    }
}

#[derive(Clone)]
pub struct ExecutorConfig {
    pub worker: Option<WorkerCommand>,
    pub capture_logs: bool,
    pub poll_interval: Duration,
    pub workspace_root: Option<PathBuf>,
    pub log_sink: Arc<dyn LogSink>,
}

impl ExecutorConfig {
    pub fn new() -> Self {
        Self {
            worker: None,
            capture_logs: true,
            poll_interval: DEFAULT_POLL_INTERVAL,
            workspace_root: None,
            log_sink: Arc::new(TracingSink),
        }
    }

    /// Defaults overridden by `UNBLOCK_TMPDIR`, `UNBLOCK_POLL_MS` and `UNBLOCK_CAPTURE_LOGS`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::new();

        if let Some(dir) = lookup("UNBLOCK_TMPDIR").filter(|v| !v.is_empty()) {
            config.workspace_root = Some(PathBuf::from(dir));
        }

        if let Some(raw) = lookup("UNBLOCK_POLL_MS") {
            match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => config.poll_interval = Duration::from_millis(ms),
                _ => tracing::warn!(value = %raw, "Invalid UNBLOCK_POLL_MS, using default"),
            }
        }

        if let Some(raw) = lookup("UNBLOCK_CAPTURE_LOGS") {
            match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => config.capture_logs = true,
                "0" | "false" | "no" | "off" => config.capture_logs = false,
                _ => tracing::warn!(value = %raw, "Invalid UNBLOCK_CAPTURE_LOGS, using default"),
            }
        }

        config
    }

    pub fn with_worker(mut self, worker: WorkerCommand) -> Self {
        self.worker = Some(worker);
        self
    }

    pub fn with_capture_logs(mut self, capture_logs: bool) -> Self {
        self.capture_logs = capture_logs;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = Some(root.into());
        self
    }

    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = sink;
        self
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ExecutorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorConfig")
            .field("worker", &self.worker)
            .field("capture_logs", &self.capture_logs)
            .field("poll_interval", &self.poll_interval)
            .field("workspace_root", &self.workspace_root)
            .finish_non_exhaustive()
    }
}

/// Lifecycle of one call. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CallState {
    Created,
    Spawned,
    Running,
    CompletedOk,
    CompletedError,
    ProtocolError,
    Cancelled,
    CleanedUp,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CompletedOk | Self::CompletedError | Self::ProtocolError | Self::Cancelled
        )
    }
}

#[derive(Debug)]
struct StateTracker(CallState);

impl StateTracker {
    fn new() -> Self {
        tracing::trace!(state = ?CallState::Created, "Call state");
        Self(CallState::Created)
    }

    fn advance(&mut self, next: CallState) {
        debug_assert!(next > self.0, "call state moved backwards: {:?} -> {next:?}", self.0);
        tracing::trace!(from = ?self.0, to = ?next, "Call state");
        self.0 = next;
    }
}

/// Runs callables in isolated worker processes.
#[derive(Debug, Clone, Default)]
pub struct Executor {
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    pub fn from_env() -> Self {
        Self::new(ExecutorConfig::from_env())
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run `callable(args)` in a fresh worker and wait for its outcome.
    ///
    /// Dropping the returned future kills the worker and removes its workspace.
    pub async fn run<C: Callable>(
        &self,
        callable: C,
        args: C::Args,
    ) -> Result<C::Output, UnblockError<C::Error>> {
        let call_id = CallId::new();
        let span = tracing::info_span!("unblock_call", %call_id, callable = C::NAME);
        self.execute(call_id, callable, args, None)
            .instrument(span)
            .await
    }

    /// Like [`Executor::run`], but returns [`UnblockError::Cancelled`] once `token` fires,
    /// after the worker has been killed and reaped and the workspace removed.
    pub async fn run_until_cancelled<C: Callable>(
        &self,
        callable: C,
        args: C::Args,
        token: &CancellationToken,
    ) -> Result<C::Output, UnblockError<C::Error>> {
        let call_id = CallId::new();
        let span = tracing::info_span!("unblock_call", %call_id, callable = C::NAME);
        self.execute(call_id, callable, args, Some(token))
            .instrument(span)
            .await
    }

    async fn execute<C: Callable>(
        &self,
        call_id: CallId,
        callable: C,
        args: C::Args,
        cancel: Option<&CancellationToken>,
    ) -> Result<C::Output, UnblockError<C::Error>> {
        let mut state = StateTracker::new();

        let payload = payload_of(&callable).map_err(UnblockError::Encode)?;
        let callable_bytes = codec::encode("callable", &payload).map_err(UnblockError::Encode)?;
        let args_bytes = codec::encode("arguments", &args).map_err(UnblockError::Encode)?;

        let root = self.config.workspace_root.clone();
        let workspace = blocking(move || {
            let workspace = Workspace::create(call_id, root.as_deref())?;
            workspace.write(Slot::Callable, &callable_bytes)?;
            workspace.write(Slot::Args, &args_bytes)?;
            Ok(workspace)
        })
        .await
        .map_err(UnblockError::Workspace)?;

        let worker = match &self.config.worker {
            Some(worker) => worker.clone(),
            None => WorkerCommand::current_exe().map_err(UnblockError::Spawn)?,
        };
        let child = worker
            .spawn(workspace.slots())
            .map_err(UnblockError::Spawn)?;
        tracing::debug!(pid = ?child.id(), dir = %workspace.dir().display(), "Spawned worker");
        // Declared after `workspace`, so on drop the worker is killed before the directory goes.
        let mut guard = CallGuard::new(child);
        state.advance(CallState::Spawned);

        if self.config.capture_logs {
            guard.streamer = Some(LogStreamer::spawn(
                workspace.path(Slot::Stdout).to_path_buf(),
                workspace.path(Slot::Stderr).to_path_buf(),
                Arc::clone(&self.config.log_sink),
                self.config.poll_interval,
            ));
        }
        state.advance(CallState::Running);

        let waited = match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => None,
                status = guard.child.wait() => Some(status),
            },
            None => Some(guard.child.wait().await),
        };

        let Some(status) = waited else {
            guard.cancel().await;
            state.advance(CallState::Cancelled);
            close_workspace(workspace).await;
            state.advance(CallState::CleanedUp);
            return Err(UnblockError::Cancelled);
        };
        let status = status.map_err(UnblockError::Wait)?;
        tracing::debug!(%status, "Worker exited");

        if let Some(streamer) = guard.disarm() {
            streamer.finish().await;
        }

        let (outcome, workspace) = tokio::task::spawn_blocking(move || {
            let outcome = interpret::<C>(status, &workspace);
            (outcome, workspace)
        })
        .await
        .map_err(|e| UnblockError::Workspace(io::Error::other(e)))?;
        match &outcome {
            Ok(_) => state.advance(CallState::CompletedOk),
            Err(e) if e.is_protocol() => {
                tracing::error!(error = %e, %status, "Worker protocol violation");
                state.advance(CallState::ProtocolError);
            }
            Err(_) => state.advance(CallState::CompletedError),
        }

        close_workspace(workspace).await;
        state.advance(CallState::CleanedUp);
        outcome
    }
}

/// Run filesystem work off the runtime threads.
async fn blocking<T, F>(f: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(io::Error::other)?
}

async fn close_workspace(workspace: Workspace) {
    match blocking(move || workspace.close()).await {
        Ok(()) => tracing::debug!("Workspace removed"),
        Err(e) => tracing::warn!(error = %e, "Failed to remove workspace"),
    }
}

/// Owns the worker process while the call is in flight.
///
/// Dropped while armed (future cancelled, early return), it kills the worker's process
/// group and aborts the log streamer.
struct CallGuard {
    child: Child,
    pid: Option<u32>,
    streamer: Option<LogStreamer>,
    armed: bool,
}

impl CallGuard {
    fn new(child: Child) -> Self {
        let pid = child.id();
        Self {
            child,
            pid,
            streamer: None,
            armed: true,
        }
    }

    fn kill(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            use nix::sys::signal::{Signal, killpg};
            use nix::unistd::Pid;

            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL)
                && e != nix::errno::Errno::ESRCH
            {
                tracing::warn!(pid, error = %e, "Failed to kill worker process group");
            }
        }
        if let Err(e) = self.child.start_kill()
            && e.kind() != io::ErrorKind::InvalidInput
        {
            tracing::warn!(error = %e, "Failed to kill worker");
        }
    }

    /// Kill and reap the worker, then stop the streamer.
    async fn cancel(mut self) {
        tracing::debug!(pid = ?self.pid, "Cancelling call");
        self.kill();
        if let Err(e) = self.child.wait().await {
            tracing::warn!(error = %e, "Failed to reap cancelled worker");
        }
        self.armed = false;
        drop(self.streamer.take());
    }

    /// The worker has been reaped; hand over the streamer for draining.
    fn disarm(mut self) -> Option<LogStreamer> {
        self.armed = false;
        self.streamer.take()
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!(pid = ?self.pid, "Call dropped, killing worker");
            self.kill();
        }
    }
}

/// Map the worker's exit status and output slots to the call's outcome.
fn interpret<C: Callable>(
    status: ExitStatus,
    workspace: &Workspace,
) -> Result<C::Output, UnblockError<C::Error>> {
    let protocol = UnblockError::Protocol;

    match status.code().and_then(WorkerExit::from_code) {
        Some(WorkerExit::Success) => {
            let bytes = workspace
                .read(Slot::Result)
                .map_err(|e| protocol(ProtocolError::Read(e)))?;
            if bytes.is_empty() {
                return Err(protocol(ProtocolError::MissingResult));
            }
            codec::decode("result", &bytes).map_err(|e| protocol(ProtocolError::Decode(e)))
        }
        Some(WorkerExit::Failure) => {
            let bytes = workspace
                .read(Slot::Error)
                .map_err(|e| protocol(ProtocolError::Read(e)))?;
            if bytes.is_empty() {
                return Err(protocol(ProtocolError::MissingError));
            }
            let remote: RemoteError =
                codec::decode("error", &bytes).map_err(|e| protocol(ProtocolError::Decode(e)))?;
            let notes = failure_notes(remote.traceback(), &stderr_tail(workspace));
            Err(into_failure::<C::Error>(remote, notes))
        }
        Some(WorkerExit::BadContract) => Err(protocol(ProtocolError::BadContract)),
        None => Err(UnblockError::Crashed {
            status,
            stderr_tail: stderr_tail(workspace),
        }),
    }
}

fn into_failure<E>(remote: RemoteError, notes: Vec<String>) -> UnblockError<E>
where
    E: serde::de::DeserializeOwned,
{
    match remote {
        RemoteError::Raised {
            type_name, payload, ..
        } if type_name == std::any::type_name::<E>() => match codec::from_value("error", payload) {
            Ok(error) => UnblockError::Failed(WorkerFailure::new(error, notes)),
            Err(e) => UnblockError::Protocol(ProtocolError::Decode(e)),
        },
        other => UnblockError::Remote(RemoteFailure::new(other, notes)),
    }
}

fn stderr_tail(workspace: &Workspace) -> String {
    workspace
        .tail(Slot::Stderr, STDERR_TAIL_LINES)
        .unwrap_or_default()
}
