//! Wire contract between the orchestrator and the worker process.
//!
//! The worker is launched as `<worker-entry> <callable> <args> <result> <error> <stdout> <stderr>`
//! with [`WORKER_ENV`] set. Its exit code is the whole outcome signal:
//!
//! - `0` ([`WorkerExit::Success`]): result slot holds the encoded return value
//! - `1` ([`WorkerExit::Failure`]): error slot holds an encoded [`RemoteError`]
//! - `2` ([`WorkerExit::BadContract`]): wrong argument count, no slot touched

use serde::{Deserialize, Serialize};

/// Environment marker set on the worker process by the orchestrator.
pub const WORKER_ENV: &str = "UNBLOCK_WORKER";

/// Number of slot paths the worker expects as its trailing arguments.
pub const SLOT_COUNT: usize = 6;

/// Unique identifier for one orchestrated call.
///
/// UUID v4 keeps concurrent calls apart in logs and workspace names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(uuid::Uuid);

impl CallId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }

    /// Short form used in directory prefixes.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Worker exit status taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Success,
    Failure,
    BadContract,
}

impl WorkerExit {
    pub const fn code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
            Self::BadContract => 2,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            1 => Some(Self::Failure),
            2 => Some(Self::BadContract),
            _ => None,
        }
    }
}

impl From<WorkerExit> for std::process::ExitCode {
    fn from(exit: WorkerExit) -> Self {
        std::process::ExitCode::from(exit.code())
    }
}

/// Which capture stream a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogSource {
    Stdout,
    Stderr,
}

impl LogSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

impl std::fmt::Display for LogSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contents of the callable slot: registry name plus captured state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallablePayload {
    pub name: String,
    pub state: serde_json::Value,
}

/// Contents of the error slot.
///
/// Errors cross the process boundary as data. Only [`RemoteError::Raised`] carries the
/// original error value; every other variant is text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemoteError {
    /// The callable returned its error type.
    Raised {
        callable: String,
        type_name: String,
        message: String,
        payload: serde_json::Value,
        traceback: String,
    },

    /// The callable panicked.
    Panicked {
        callable: String,
        message: String,
        traceback: String,
    },

    /// The worker could not decode its inputs or encode the return value.
    Codec { message: String, traceback: String },

    /// Stand-in for an error that could not itself be serialized.
    Opaque { traceback: String },
}

impl RemoteError {
    pub fn message(&self) -> &str {
        match self {
            Self::Raised { message, .. }
            | Self::Panicked { message, .. }
            | Self::Codec { message, .. } => message,
            Self::Opaque { traceback } => traceback,
        }
    }

    pub fn traceback(&self) -> &str {
        match self {
            Self::Raised { traceback, .. }
            | Self::Panicked { traceback, .. }
            | Self::Codec { traceback, .. }
            | Self::Opaque { traceback } => traceback,
        }
    }

    /// Name of the callable that failed, when known.
    pub fn callable(&self) -> Option<&str> {
        match self {
            Self::Raised { callable, .. } | Self::Panicked { callable, .. } => Some(callable),
            Self::Codec { .. } | Self::Opaque { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Raised { .. } => "raised",
            Self::Panicked { .. } => "panicked",
            Self::Codec { .. } => "codec",
            Self::Opaque { .. } => "opaque",
        }
    }
}
