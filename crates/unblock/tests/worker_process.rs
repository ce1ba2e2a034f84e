//! End-to-end tests against real worker processes.
//!
//! This binary is its own worker: `main` hands the registry to `worker::init`, which
//! takes over when the orchestrator re-executes the binary with `UNBLOCK_WORKER=1`.

use std::path::Path;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail, ensure};
use futures::FutureExt;
use futures::future::LocalBoxFuture;
use serde::{Deserialize, Serialize};
use unblock::workspace::Slot;
use unblock::{
    CallError, CallId, Callable, CancellationToken, Executor, ExecutorConfig, LogSink, LogSource,
    Registry, RemoteFailureKind, UnblockError, Workspace,
};

#[derive(Serialize, Deserialize)]
struct AddOne;

impl Callable for AddOne {
    const NAME: &'static str = "add_one";
    type Args = (i64,);
    type Output = i64;
    type Error = CallError;

    fn call(self, (value,): (i64,)) -> Result<i64, CallError> {
        Ok(value + 1)
    }
}

#[derive(Serialize, Deserialize)]
struct AddOffset {
    offset: i64,
}

impl Callable for AddOffset {
    const NAME: &'static str = "add_offset";
    type Args = (i64,);
    type Output = i64;
    type Error = CallError;

    fn call(self, (value,): (i64,)) -> Result<i64, CallError> {
        Ok(value + self.offset)
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize, thiserror::Error)]
enum UnblockTestError {
    #[error("{0}")]
    Boom(String),
}

#[derive(Serialize, Deserialize)]
struct FailBlocker;

impl Callable for FailBlocker {
    const NAME: &'static str = "fail_blocker";
    type Args = ();
    type Output = ();
    type Error = UnblockTestError;

    fn call(self, _: ()) -> Result<(), UnblockTestError> {
        eprintln!("about to fail");
        Err(UnblockTestError::Boom("boom from worker".to_string()))
    }
}

#[derive(Serialize, Deserialize)]
struct Explode;

impl Callable for Explode {
    const NAME: &'static str = "explode";
    type Args = ();
    type Output = ();
    type Error = CallError;

    fn call(self, _: ()) -> Result<(), CallError> {
        panic!("kaboom");
    }
}

#[derive(Debug, Deserialize, thiserror::Error)]
#[error("could not release handle {path}")]
struct HandleError {
    path: String,
}

impl Serialize for HandleError {
    fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
        Err(serde::ser::Error::custom("handles do not serialize"))
    }
}

#[derive(Serialize, Deserialize)]
struct HoldsHandle;

impl Callable for HoldsHandle {
    const NAME: &'static str = "holds_handle";
    type Args = ();
    type Output = ();
    type Error = HandleError;

    fn call(self, _: ()) -> Result<(), HandleError> {
        Err(HandleError {
            path: "/dev/null".to_string(),
        })
    }
}

#[derive(Serialize, Deserialize)]
struct Chatty;

impl Callable for Chatty {
    const NAME: &'static str = "chatty";
    type Args = (usize,);
    type Output = usize;
    type Error = CallError;

    fn call(self, (lines,): (usize,)) -> Result<usize, CallError> {
        for i in 0..lines {
            println!("out {i}");
            eprintln!("err {i}");
        }
        Ok(lines)
    }
}

#[derive(Serialize, Deserialize)]
struct ShellOut;

impl Callable for ShellOut {
    const NAME: &'static str = "shell_out";
    type Args = ();
    type Output = ();
    type Error = CallError;

    fn call(self, _: ()) -> Result<(), CallError> {
        eprintln!("direct to stderr");
        let status = std::process::Command::new("sh")
            .args(["-c", "echo from child >&2; echo child out"])
            .status()
            .map_err(|e| CallError::new(e.to_string()))?;
        if !status.success() {
            return Err(CallError::new(format!("sh exited with {status}")));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct Sleeper;

impl Callable for Sleeper {
    const NAME: &'static str = "sleeper";
    type Args = ();
    type Output = ();
    type Error = CallError;

    fn call(self, _: ()) -> Result<(), CallError> {
        let child = std::process::Command::new("sleep")
            .arg("60")
            .spawn()
            .map_err(|e| CallError::new(e.to_string()))?;
        println!("pids {} {}", std::process::id(), child.id());
        std::thread::sleep(Duration::from_secs(60));
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct ExitSeven;

impl Callable for ExitSeven {
    const NAME: &'static str = "exit_seven";
    type Args = ();
    type Output = ();
    type Error = CallError;

    fn call(self, _: ()) -> Result<(), CallError> {
        eprintln!("exiting with 7");
        std::process::exit(7);
    }
}

#[derive(Serialize, Deserialize)]
struct TakesMap;

impl Callable for TakesMap {
    const NAME: &'static str = "takes_map";
    type Args = (std::collections::HashMap<(i32, i32), i32>,);
    type Output = usize;
    type Error = CallError;

    fn call(self, (map,): Self::Args) -> Result<usize, CallError> {
        Ok(map.len())
    }
}

#[derive(Serialize, Deserialize)]
struct ChildEnv;

impl Callable for ChildEnv {
    const NAME: &'static str = "child_env";
    type Args = ();
    type Output = String;
    type Error = CallError;

    fn call(self, _: ()) -> Result<String, CallError> {
        let output = std::process::Command::new("sh")
            .args(["-c", "printf %s \"${UNBLOCK_WORKER-unset}\""])
            .output()
            .map_err(|e| CallError::new(e.to_string()))?;
        String::from_utf8(output.stdout).map_err(|e| CallError::new(e.to_string()))
    }
}

#[derive(Serialize, Deserialize)]
struct Blob;

impl Callable for Blob {
    const NAME: &'static str = "blob";
    type Args = (usize,);
    type Output = String;
    type Error = CallError;

    fn call(self, (len,): (usize,)) -> Result<String, CallError> {
        Ok("z".repeat(len))
    }
}

fn registry() -> Registry {
    Registry::new()
        .with::<AddOne>()
        .with::<AddOffset>()
        .with::<FailBlocker>()
        .with::<Explode>()
        .with::<HoldsHandle>()
        .with::<Chatty>()
        .with::<ShellOut>()
        .with::<Sleeper>()
        .with::<ExitSeven>()
        .with::<TakesMap>()
        .with::<ChildEnv>()
        .with::<Blob>()
}

type Lines = Arc<Mutex<Vec<(LogSource, String)>>>;

fn collecting_sink() -> (Lines, Arc<dyn LogSink>) {
    let lines: Lines = Arc::new(Mutex::new(Vec::new()));
    let sink_lines = Arc::clone(&lines);
    let sink = move |source: LogSource, line: &str| {
        if let Ok(mut lines) = sink_lines.lock() {
            lines.push((source, line.to_string()));
        }
    };
    (lines, Arc::new(sink))
}

fn lines_of(lines: &Lines, source: LogSource) -> Vec<String> {
    lines
        .lock()
        .map(|lines| {
            lines
                .iter()
                .filter(|(s, _)| *s == source)
                .map(|(_, l)| l.clone())
                .collect()
        })
        .unwrap_or_default()
}

fn executor(root: &Path, sink: Option<Arc<dyn LogSink>>) -> Executor {
    let config = ExecutorConfig::new()
        .with_workspace_root(root)
        .with_poll_interval(Duration::from_millis(10));
    let config = match sink {
        Some(sink) => config.with_log_sink(sink),
        None => config.with_capture_logs(false),
    };
    Executor::new(config)
}

fn ensure_clean(root: &Path) -> Result<()> {
    let leftover: Vec<_> = std::fs::read_dir(root)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    ensure!(leftover.is_empty(), "workspaces left behind: {leftover:?}");
    Ok(())
}

/// Wait until the sink has seen the worker's `pids <worker> <grandchild>` line.
async fn wait_for_pids(lines: &Lines) -> Result<(u32, u32)> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let found = lines_of(lines, LogSource::Stdout)
            .iter()
            .find_map(|l| l.strip_prefix("pids ").map(str::to_string));
        if let Some(pids) = found {
            let (worker, child) = pids.split_once(' ').context("malformed pids line")?;
            return Ok((worker.parse()?, child.parse()?));
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("worker never reported its pid");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Gone, or a zombie nobody has reaped yet.
fn process_gone(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Err(_) => true,
        Ok(stat) => stat
            .rsplit_once(')')
            .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
    }
}

async fn wait_gone(pid: u32) -> Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !process_gone(pid) {
        if tokio::time::Instant::now() >= deadline {
            bail!("process {pid} still running");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}

async fn returns_value() -> Result<()> {
    let value = unblock::run(AddOne, (41,), false).await?;
    ensure!(value == 42, "got {value}");
    Ok(())
}

async fn captured_state_travels() -> Result<()> {
    let root = tempfile::tempdir()?;
    let value = executor(root.path(), None)
        .run(AddOffset { offset: 100 }, (1,))
        .await?;
    ensure!(value == 101, "got {value}");
    ensure_clean(root.path())
}

async fn raised_error(capture_logs: bool) -> Result<()> {
    let root = tempfile::tempdir()?;
    let (lines, sink) = collecting_sink();
    let sink = capture_logs.then_some(sink);

    let err = match executor(root.path(), sink).run(FailBlocker, ()).await {
        Err(UnblockError::Failed(failure)) => failure,
        other => bail!("expected Failed, got {other:?}"),
    };
    ensure!(err.error() == &UnblockTestError::Boom("boom from worker".to_string()));
    ensure!(err.to_string() == "boom from worker");

    let notes = err.notes();
    ensure!(notes.len() == 2, "notes: {notes:?}");
    ensure!(notes[0].starts_with("Remote traceback from unblock worker:"));
    ensure!(notes[0].contains("fail_blocker"));
    ensure!(notes[1].contains("about to fail"));

    let stderr = lines_of(&lines, LogSource::Stderr);
    if capture_logs {
        ensure!(stderr.iter().any(|l| l == "about to fail"), "stderr: {stderr:?}");
    } else {
        ensure!(stderr.is_empty(), "logs forwarded while disabled: {stderr:?}");
    }
    ensure_clean(root.path())
}

async fn panic_is_remote() -> Result<()> {
    let root = tempfile::tempdir()?;
    let failure = match executor(root.path(), None).run(Explode, ()).await {
        Err(UnblockError::Remote(failure)) => failure,
        other => bail!("expected Remote, got {other:?}"),
    };
    ensure!(failure.kind() == &RemoteFailureKind::Panicked);
    ensure!(failure.message() == "kaboom");
    ensure!(failure.callable() == Some("explode"));
    let traceback = failure.remote_traceback().context("no traceback note")?;
    ensure!(traceback.contains("callable `explode` panicked"), "{traceback}");
    ensure_clean(root.path())
}

async fn unserializable_error_is_opaque() -> Result<()> {
    let root = tempfile::tempdir()?;
    let failure = match executor(root.path(), None).run(HoldsHandle, ()).await {
        Err(UnblockError::Remote(failure)) => failure,
        other => bail!("expected Remote, got {other:?}"),
    };
    ensure!(failure.kind() == &RemoteFailureKind::Opaque);
    ensure!(failure.message().contains("Traceback"), "{}", failure.message());
    ensure!(failure.message().contains("handles do not serialize"));
    ensure_clean(root.path())
}

async fn logs_are_drained() -> Result<()> {
    let root = tempfile::tempdir()?;
    let (lines, sink) = collecting_sink();
    let count = executor(root.path(), Some(sink)).run(Chatty, (200,)).await?;
    ensure!(count == 200);

    let expected_out: Vec<String> = (0..200).map(|i| format!("out {i}")).collect();
    let expected_err: Vec<String> = (0..200).map(|i| format!("err {i}")).collect();
    let stderr: Vec<String> = lines_of(&lines, LogSource::Stderr)
        .into_iter()
        .filter(|l| l.starts_with("err "))
        .collect();
    ensure!(lines_of(&lines, LogSource::Stdout) == expected_out);
    ensure!(stderr == expected_err);
    ensure_clean(root.path())
}

async fn stderr_keeps_its_identity() -> Result<()> {
    let root = tempfile::tempdir()?;
    let (lines, sink) = collecting_sink();
    executor(root.path(), Some(sink)).run(ShellOut, ()).await?;

    let stdout = lines_of(&lines, LogSource::Stdout);
    let stderr = lines_of(&lines, LogSource::Stderr);
    ensure!(stderr.iter().any(|l| l == "direct to stderr"), "stderr: {stderr:?}");
    ensure!(stderr.iter().any(|l| l == "from child"), "stderr: {stderr:?}");
    ensure!(stdout == vec!["child out".to_string()], "stdout: {stdout:?}");
    ensure_clean(root.path())
}

async fn abort_kills_worker() -> Result<()> {
    let root = tempfile::tempdir()?;
    let (lines, sink) = collecting_sink();
    let executor = executor(root.path(), Some(sink));

    let task = tokio::spawn(async move { executor.run(Sleeper, ()).await });
    let (worker, grandchild) = wait_for_pids(&lines).await?;
    task.abort();
    match task.await {
        Err(e) if e.is_cancelled() => {}
        other => bail!("expected a cancelled task, got {other:?}"),
    }

    wait_gone(worker).await?;
    wait_gone(grandchild).await?;
    ensure_clean(root.path())
}

async fn token_cancels_call() -> Result<()> {
    let root = tempfile::tempdir()?;
    let (lines, sink) = collecting_sink();
    let executor = executor(root.path(), Some(sink));
    let token = CancellationToken::new();

    let cancel = async {
        let pids = wait_for_pids(&lines).await;
        token.cancel();
        pids
    };
    let (result, pids) = tokio::join!(executor.run_until_cancelled(Sleeper, (), &token), cancel);
    let (worker, grandchild) = pids?;

    match result {
        Err(e) if e.is_cancelled() => {}
        other => bail!("expected Cancelled, got {other:?}"),
    }
    ensure!(process_gone(worker), "worker {worker} survived cancellation");
    wait_gone(grandchild).await?;
    ensure_clean(root.path())
}

async fn timeout_kills_worker() -> Result<()> {
    let root = tempfile::tempdir()?;
    let (lines, sink) = collecting_sink();
    let executor = executor(root.path(), Some(sink));

    let (result, pids) = tokio::join!(
        tokio::time::timeout(Duration::from_secs(3), executor.run(Sleeper, ())),
        wait_for_pids(&lines),
    );
    ensure!(result.is_err(), "sleeper finished before the timeout");
    let (worker, grandchild) = pids?;

    wait_gone(worker).await?;
    wait_gone(grandchild).await?;
    ensure_clean(root.path())
}

async fn worker_marker_not_inherited() -> Result<()> {
    let root = tempfile::tempdir()?;
    let seen = executor(root.path(), None).run(ChildEnv, ()).await?;
    ensure!(seen == "unset", "child saw UNBLOCK_WORKER={seen}");
    ensure_clean(root.path())
}

async fn large_result_returns() -> Result<()> {
    const LEN: usize = 8 << 20;
    let root = tempfile::tempdir()?;
    let value = executor(root.path(), None).run(Blob, (LEN,)).await?;
    ensure!(value.len() == LEN, "got {} bytes", value.len());
    ensure!(value.bytes().all(|b| b == b'z'));
    ensure_clean(root.path())
}

async fn bad_contract_exits_two() -> Result<()> {
    let root = tempfile::tempdir()?;
    let workspace = Workspace::create(CallId::new(), Some(root.path()))?;
    let mut args = workspace.slots().to_args();
    args.pop();

    let status = tokio::process::Command::new(std::env::current_exe()?)
        .args(&args)
        .env(unblock::bridge::protocol::WORKER_ENV, "1")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await?;
    ensure!(status.code() == Some(2), "worker exited with {status}");
    ensure!(workspace.read(Slot::Result)?.is_empty());
    ensure!(workspace.read(Slot::Error)?.is_empty());
    workspace.close()?;
    Ok(())
}

async fn unencodable_args_spawn_nothing() -> Result<()> {
    let root = tempfile::tempdir()?;
    let args = (std::collections::HashMap::from([((1, 2), 3)]),);
    match executor(root.path(), None).run(TakesMap, args).await {
        Err(UnblockError::Encode(_)) => {}
        other => bail!("expected Encode, got {other:?}"),
    }
    ensure_clean(root.path())
}

async fn foreign_exit_is_crash() -> Result<()> {
    let root = tempfile::tempdir()?;
    match executor(root.path(), None).run(ExitSeven, ()).await {
        Err(UnblockError::Crashed {
            status,
            stderr_tail,
        }) => {
            ensure!(status.code() == Some(7), "status {status}");
            ensure!(stderr_tail.contains("exiting with 7"), "tail: {stderr_tail}");
        }
        other => bail!("expected Crashed, got {other:?}"),
    }
    ensure_clean(root.path())
}

async fn concurrent_calls_stay_apart() -> Result<()> {
    let root = tempfile::tempdir()?;
    let executor = executor(root.path(), None);
    let calls = (0..8).map(|i| executor.run(AddOne, (i,)));
    let results = futures::future::join_all(calls).await;
    for (i, result) in results.into_iter().enumerate() {
        let value = result?;
        ensure!(value == i as i64 + 1, "call {i} returned {value}");
    }
    ensure_clean(root.path())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    MultiThread,
    CurrentThread,
}

type Scenario = (&'static str, Flavor, LocalBoxFuture<'static, Result<()>>);

fn scenarios() -> Vec<Scenario> {
    use Flavor::{CurrentThread, MultiThread};
    vec![
        ("returns_value", MultiThread, returns_value().boxed_local()),
        ("captured_state_travels", MultiThread, captured_state_travels().boxed_local()),
        ("raised_error_with_logs", MultiThread, raised_error(true).boxed_local()),
        ("raised_error_without_logs", MultiThread, raised_error(false).boxed_local()),
        ("panic_is_remote", MultiThread, panic_is_remote().boxed_local()),
        (
            "unserializable_error_is_opaque",
            MultiThread,
            unserializable_error_is_opaque().boxed_local(),
        ),
        ("logs_are_drained", MultiThread, logs_are_drained().boxed_local()),
        ("stderr_keeps_its_identity", MultiThread, stderr_keeps_its_identity().boxed_local()),
        ("abort_kills_worker", MultiThread, abort_kills_worker().boxed_local()),
        ("token_cancels_call", MultiThread, token_cancels_call().boxed_local()),
        ("timeout_kills_worker", MultiThread, timeout_kills_worker().boxed_local()),
        ("bad_contract_exits_two", MultiThread, bad_contract_exits_two().boxed_local()),
        (
            "unencodable_args_spawn_nothing",
            MultiThread,
            unencodable_args_spawn_nothing().boxed_local(),
        ),
        ("foreign_exit_is_crash", MultiThread, foreign_exit_is_crash().boxed_local()),
        ("concurrent_calls_stay_apart", MultiThread, concurrent_calls_stay_apart().boxed_local()),
        ("worker_marker_not_inherited", MultiThread, worker_marker_not_inherited().boxed_local()),
        ("large_result_returns", MultiThread, large_result_returns().boxed_local()),
        ("current_thread_abort_kills_worker", CurrentThread, abort_kills_worker().boxed_local()),
        ("current_thread_token_cancels_call", CurrentThread, token_cancels_call().boxed_local()),
        ("current_thread_timeout_kills_worker", CurrentThread, timeout_kills_worker().boxed_local()),
        ("current_thread_logs_are_drained", CurrentThread, logs_are_drained().boxed_local()),
        ("current_thread_large_result_returns", CurrentThread, large_result_returns().boxed_local()),
    ]
}

fn main() -> ExitCode {
    unblock::worker::init(&registry());

    let multi_thread = tokio::runtime::Runtime::new();
    let current_thread = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build();
    let (multi_thread, current_thread) = match (multi_thread, current_thread) {
        (Ok(multi), Ok(current)) => (multi, current),
        (Err(e), _) | (_, Err(e)) => {
            eprintln!("failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let scenarios = scenarios();
    println!("\nrunning {} tests", scenarios.len());
    let mut failed = Vec::new();
    for (name, flavor, scenario) in scenarios {
        let runtime = match flavor {
            Flavor::MultiThread => &multi_thread,
            Flavor::CurrentThread => &current_thread,
        };
        match runtime.block_on(scenario) {
            Ok(()) => println!("test {name} ... ok"),
            Err(e) => {
                println!("test {name} ... FAILED\n{e:?}");
                failed.push(name);
            }
        }
    }

    if failed.is_empty() {
        println!("\ntest result: ok");
        ExitCode::SUCCESS
    } else {
        println!("\ntest result: FAILED. failures: {failed:?}");
        ExitCode::FAILURE
    }
}
