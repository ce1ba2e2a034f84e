//! Caller-facing errors.

use std::io;
use std::process::ExitStatus;

use crate::bridge::codec::CodecError;
use crate::bridge::protocol::RemoteError;

/// Header of the note carrying the worker's traceback.
pub const REMOTE_TRACEBACK_HEADER: &str = "Remote traceback from unblock worker:";

/// Header of the note carrying the tail of the worker's stderr.
pub const REMOTE_STDERR_HEADER: &str = "Worker stderr (last lines):";

/// Outcome of a call that did not return a value.
#[derive(Debug, thiserror::Error)]
pub enum UnblockError<E> {
    /// Callable or arguments could not be encoded; no worker was spawned.
    #[error("failed to encode call: {0}")]
    Encode(#[source] CodecError),

    #[error("workspace error: {0}")]
    Workspace(#[source] io::Error),

    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] io::Error),

    #[error("failed to wait for worker: {0}")]
    Wait(#[source] io::Error),

    /// The callable returned its own error type.
    #[error("{0}")]
    Failed(WorkerFailure<E>),

    /// The worker failed some other way: panic, codec failure, or an error that could
    /// not be carried across the process boundary.
    #[error("{0}")]
    Remote(RemoteFailure),

    /// The orchestrator and worker disagree about the contract. Always a bug.
    #[error("worker protocol violation: {0}")]
    Protocol(#[source] ProtocolError),

    /// The worker died without reporting an outcome (signal, abort, foreign exit code).
    #[error("worker terminated abnormally ({status})")]
    Crashed {
        status: ExitStatus,
        stderr_tail: String,
    },

    /// The call was cancelled; the worker was killed and the workspace removed.
    #[error("call cancelled")]
    Cancelled,
}

impl<E> UnblockError<E> {
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Diagnostic notes attached by the orchestrator (remote traceback, stderr tail).
    pub fn notes(&self) -> &[String] {
        match self {
            Self::Failed(failure) => failure.notes(),
            Self::Remote(failure) => failure.notes(),
            _ => &[],
        }
    }

    /// The callable's own error, if that is what ended the call.
    pub fn into_failed(self) -> Option<E> {
        match self {
            Self::Failed(failure) => Some(failure.into_inner()),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("worker rejected its invocation (exit code 2)")]
    BadContract,

    #[error("worker reported success but wrote no result")]
    MissingResult,

    #[error("worker reported failure but wrote no error")]
    MissingError,

    #[error(transparent)]
    Decode(#[from] CodecError),

    #[error("failed to read slot: {0}")]
    Read(#[source] io::Error),
}

/// The callable's error, decoded in the caller, plus notes from the worker.
#[derive(Debug)]
pub struct WorkerFailure<E> {
    error: E,
    notes: Vec<String>,
}

impl<E> WorkerFailure<E> {
    pub fn new(error: E, notes: Vec<String>) -> Self {
        Self { error, notes }
    }

    pub fn error(&self) -> &E {
        &self.error
    }

    pub fn into_inner(self) -> E {
        self.error
    }

    pub fn notes(&self) -> &[String] {
        &self.notes
    }

    /// The worker's traceback, without its note header.
    pub fn remote_traceback(&self) -> Option<&str> {
        remote_traceback(&self.notes)
    }
}

impl<E: std::fmt::Display> std::fmt::Display for WorkerFailure<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.error.fmt(f)
    }
}

impl<E: std::error::Error + 'static> std::error::Error for WorkerFailure<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// A worker failure that is not the callable's own error type.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind} in worker: {message}")]
pub struct RemoteFailure {
    kind: RemoteFailureKind,
    callable: Option<String>,
    message: String,
    notes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteFailureKind {
    /// An error of a type other than the callable's declared error type.
    Raised { type_name: String },
    Panicked,
    Codec,
    /// The original error could not be serialized; only its text survived.
    Opaque,
}

impl std::fmt::Display for RemoteFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Raised { type_name } => write!(f, "{type_name} raised"),
            Self::Panicked => f.write_str("panic"),
            Self::Codec => f.write_str("codec failure"),
            Self::Opaque => f.write_str("error"),
        }
    }
}

impl RemoteFailure {
    pub(crate) fn new(remote: RemoteError, notes: Vec<String>) -> Self {
        let callable = remote.callable().map(str::to_string);
        let (kind, message) = match remote {
            RemoteError::Raised {
                type_name, message, ..
            } => (RemoteFailureKind::Raised { type_name }, message),
            RemoteError::Panicked { message, .. } => (RemoteFailureKind::Panicked, message),
            RemoteError::Codec { message, .. } => (RemoteFailureKind::Codec, message),
            RemoteError::Opaque { traceback } => (RemoteFailureKind::Opaque, traceback),
        };
        Self {
            kind,
            callable,
            message,
            notes,
        }
    }

    pub fn kind(&self) -> &RemoteFailureKind {
        &self.kind
    }

    pub fn callable(&self) -> Option<&str> {
        self.callable.as_deref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn notes(&self) -> &[String] {
        &self.notes
    }

    pub fn remote_traceback(&self) -> Option<&str> {
        remote_traceback(&self.notes)
    }
}

/// Notes for a failed call: the remote traceback, then the stderr tail if any.
pub(crate) fn failure_notes(traceback: &str, stderr_tail: &str) -> Vec<String> {
    let mut notes = vec![format!("{REMOTE_TRACEBACK_HEADER}\n{traceback}")];
    if !stderr_tail.trim().is_empty() {
        notes.push(format!("{REMOTE_STDERR_HEADER}\n{stderr_tail}"));
    }
    notes
}

fn remote_traceback(notes: &[String]) -> Option<&str> {
    notes
        .iter()
        .find_map(|n| n.strip_prefix(REMOTE_TRACEBACK_HEADER))
        .map(|tb| tb.trim_start_matches('\n'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callable::CallError;

    #[test]
    fn failure_displays_original_error() {
        let failure = WorkerFailure::new(
            CallError::new("boom from worker"),
            failure_notes("Traceback: in fail_blocker", ""),
        );
        assert_eq!(failure.to_string(), "boom from worker");
        assert_eq!(failure.notes().len(), 1);
        assert!(failure.notes()[0].starts_with(REMOTE_TRACEBACK_HEADER));
        assert_eq!(failure.remote_traceback(), Some("Traceback: in fail_blocker"));

        let err: UnblockError<CallError> = UnblockError::Failed(failure);
        assert_eq!(err.to_string(), "boom from worker");
        assert!(!err.is_protocol());
        assert_eq!(err.into_failed(), Some(CallError::new("boom from worker")));
    }

    #[test]
    fn stderr_tail_becomes_second_note() {
        let notes = failure_notes("tb", "warning: low memory");
        assert_eq!(notes.len(), 2);
        assert!(notes[1].starts_with(REMOTE_STDERR_HEADER));
        assert!(notes[1].ends_with("warning: low memory"));
    }

    #[test]
    fn opaque_failure_message_is_traceback() {
        let failure = RemoteFailure::new(
            RemoteError::Opaque {
                traceback: "Traceback (unblock worker pid 1)".to_string(),
            },
            Vec::new(),
        );
        assert_eq!(failure.kind(), &RemoteFailureKind::Opaque);
        assert!(failure.message().contains("Traceback"));
        assert!(failure.to_string().starts_with("error in worker: Traceback"));
    }

    #[test]
    fn panic_failure_keeps_callable() {
        let failure = RemoteFailure::new(
            RemoteError::Panicked {
                callable: "explode".to_string(),
                message: "kaboom".to_string(),
                traceback: "tb".to_string(),
            },
            failure_notes("tb", ""),
        );
        assert_eq!(failure.callable(), Some("explode"));
        assert_eq!(failure.to_string(), "panic in worker: kaboom");
        assert_eq!(failure.remote_traceback(), Some("tb"));
    }

    #[test]
    fn protocol_errors_are_flagged() {
        let err: UnblockError<CallError> = UnblockError::Protocol(ProtocolError::BadContract);
        assert!(err.is_protocol());
        assert!(err.notes().is_empty());
        assert!(err.to_string().contains("exit code 2"));
    }
}
