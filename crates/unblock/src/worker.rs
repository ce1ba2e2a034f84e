//! Worker process entry point.
//!
//! The parent side (workspace, spawning, reaping) is in orchestrator.rs.
//!
//! Flow:
//! 1. Check the argument contract (exactly six slot paths), else exit 2
//! 2. Decode callable and arguments; on failure write the error slot, exit 1
//! 3. Redirect fd 1/2 into the stdout/stderr slots
//! 4. Run the callable under `catch_unwind`
//! 5. Write the result slot (exit 0) or the error slot (exit 1)
//! 6. Flush the capture streams on every branch

use std::backtrace::Backtrace;
use std::ffi::OsString;
use std::fmt::Write as _;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, Once, PoisonError};

use crate::bridge::codec::{self, CodecError};
use crate::bridge::protocol::{CallablePayload, RemoteError, WORKER_ENV, WorkerExit};
use crate::callable::Registry;
use crate::fd_redirect::redirect_std_streams;
use crate::workspace::{Slot, SlotPaths};

/// Panic report captured by the worker panic hook, consumed after `catch_unwind`.
static PANIC_REPORT: Mutex<Option<String>> = Mutex::new(None);
static PANIC_HOOK: Once = Once::new();

/// True when this process was launched by the orchestrator as a worker.
pub fn is_worker() -> bool {
    std::env::var_os(WORKER_ENV).is_some_and(|v| v == "1")
}

/// Run as a worker and exit if this process was launched as one; otherwise return.
///
/// Call this first thing in `main`, before any other output or threads.
pub fn init(registry: &Registry) {
    if !is_worker() {
        return;
    }
    // Processes started by the callable must not run as workers themselves.
    // SAFETY: called first in `main`, before any other thread reads the environment.
    unsafe { std::env::remove_var(WORKER_ENV) };
    crate::logging::init_worker_tracing();
    let exit = run(registry, std::env::args_os().skip(1));
    std::process::exit(i32::from(exit.code()));
}

/// Execute one call described by `args` (the six slot paths, in order).
pub fn run<I>(registry: &Registry, args: I) -> WorkerExit
where
    I: IntoIterator<Item = OsString>,
{
    let args: Vec<OsString> = args.into_iter().collect();
    let Some(slots) = SlotPaths::from_args(args.iter().cloned()) else {
        tracing::error!(
            received = args.len(),
            expected = crate::bridge::protocol::SLOT_COUNT,
            "Invalid worker invocation"
        );
        return WorkerExit::BadContract;
    };
    install_panic_hook();
    run_slots(registry, &slots, CaptureMode::Redirect)
}

/// Where the callable's stdout/stderr go while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CaptureMode {
    /// dup2 the capture slots over fd 1/2 (real worker process).
    Redirect,
    /// Leave the process streams alone (in-process tests).
    #[cfg_attr(not(test), allow(dead_code))]
    Inherit,
}

pub(crate) fn run_slots(registry: &Registry, slots: &SlotPaths, mode: CaptureMode) -> WorkerExit {
    let prepared = match read_inputs(slots).and_then(|(payload, args)| {
        registry.prepare(payload, &args)
    }) {
        Ok(prepared) => prepared,
        Err(e) => {
            tracing::debug!(error = %e, "Failed to decode call");
            let error = RemoteError::Codec {
                message: e.to_string(),
                traceback: error_traceback("decoding the call", &e),
            };
            return write_error(slots, &error);
        }
    };

    let capture = match mode {
        CaptureMode::Redirect => {
            match redirect_std_streams(slots.get(Slot::Stdout), slots.get(Slot::Stderr)) {
                Ok(capture) => Some(capture),
                Err(e) => {
                    let error = RemoteError::Opaque {
                        traceback: format!(
                            "Traceback (unblock worker pid {}):\n  failed to redirect output: {e}",
                            std::process::id()
                        ),
                    };
                    return write_error(slots, &error);
                }
            }
        }
        CaptureMode::Inherit => None,
    };

    let exit = match panic::catch_unwind(AssertUnwindSafe(prepared)) {
        Ok(Ok(output)) => match std::fs::write(slots.get(Slot::Result), output) {
            Ok(()) => WorkerExit::Success,
            Err(e) => write_error(
                slots,
                &RemoteError::Codec {
                    message: format!("failed to write result slot: {e}"),
                    traceback: error_traceback("writing the result slot", &e),
                },
            ),
        },
        Ok(Err(error)) => write_error(slots, &error),
        Err(payload) => write_error(slots, &panic_error(slots, payload)),
    };

    if let Some(capture) = capture {
        capture.finish();
    }
    exit
}

fn read_inputs(slots: &SlotPaths) -> Result<(CallablePayload, Vec<u8>), CodecError> {
    let callable = std::fs::read(slots.get(Slot::Callable)).map_err(|e| io_decode("callable", e))?;
    let args = std::fs::read(slots.get(Slot::Args)).map_err(|e| io_decode("arguments", e))?;
    let payload: CallablePayload = codec::decode("callable", &callable)?;
    Ok((payload, args))
}

fn io_decode(what: &'static str, e: io::Error) -> CodecError {
    CodecError::Decode {
        what,
        source: serde_json::Error::io(e),
    }
}

fn write_error(slots: &SlotPaths, error: &RemoteError) -> WorkerExit {
    if let Err(e) = std::fs::write(slots.get(Slot::Error), codec::encode_error(error)) {
        // Exit 1 with an empty error slot is reported as a protocol error upstream.
        tracing::error!(error = %e, "Failed to write error slot");
    }
    WorkerExit::Failure
}

fn panic_error(slots: &SlotPaths, payload: Box<dyn std::any::Any + Send>) -> RemoteError {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_string()
    };

    let callable = std::fs::read(slots.get(Slot::Callable))
        .ok()
        .and_then(|bytes| codec::decode::<CallablePayload>("callable", &bytes).ok())
        .map(|p| p.name)
        .unwrap_or_else(|| "<unknown>".to_string());

    let report = PANIC_REPORT
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();

    let mut traceback = format!(
        "Traceback (unblock worker pid {}):\n  callable `{}` panicked: {}\n",
        std::process::id(),
        callable,
        message
    );
    if let Some(report) = report {
        let _ = write!(traceback, "\n{report}");
    }

    RemoteError::Panicked {
        callable,
        message,
        traceback,
    }
}

/// Records location and backtrace of a panic, then defers to the previous hook.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let backtrace = Backtrace::force_capture();
            let report = format!("{info}\n\nworker backtrace:\n{backtrace}");
            *PANIC_REPORT.lock().unwrap_or_else(PoisonError::into_inner) = Some(report);
            previous(info);
        }));
    });
}

/// Textual traceback for an error raised while doing `context`: the error chain plus
/// a backtrace of the worker at the point the failure was reported.
pub(crate) fn error_traceback<E>(context: &str, error: &E) -> String
where
    E: std::error::Error + 'static,
{
    let mut out = format!(
        "Traceback (unblock worker pid {}):\n  {} failed\n{}: {}\n",
        std::process::id(),
        context,
        std::any::type_name::<E>(),
        error
    );
    let mut source = error.source();
    while let Some(cause) = source {
        let _ = writeln!(out, "  caused by: {cause}");
        source = cause.source();
    }
    let _ = write!(out, "\nworker backtrace:\n{}", Backtrace::force_capture());
    out
}
