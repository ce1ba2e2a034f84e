//! unblock: run blocking callables in an isolated worker process from async code.
//!
//! The host binary doubles as the worker. Register every callable the binary may run
//! and hand the registry to [`worker::init`] first thing in `main`:
//!
//! ```no_run
//! use serde::{Deserialize, Serialize};
//! use unblock::{CallError, Callable, Registry};
//!
//! #[derive(Serialize, Deserialize)]
//! struct AddOffset {
//!     offset: i64,
//! }
//!
//! impl Callable for AddOffset {
//!     const NAME: &'static str = "add_offset";
//!     type Args = (i64,);
//!     type Output = i64;
//!     type Error = CallError;
//!
//!     fn call(self, (value,): (i64,)) -> Result<i64, CallError> {
//!         Ok(value + self.offset)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     unblock::worker::init(&Registry::new().with::<AddOffset>());
//!     unblock::logging::init_tracing();
//!
//!     let value = unblock::run(AddOffset { offset: 1 }, (41,), true).await;
//!     assert_eq!(value.ok(), Some(42));
//! }
//! ```

pub mod bridge;
pub mod callable;
pub mod error;
mod fd_redirect;
pub mod log_stream;
pub mod logging;
pub mod orchestrator;
pub mod worker;
pub mod workspace;

pub use bridge::codec::CodecError;
pub use bridge::protocol::{CallId, LogSource, RemoteError, WorkerExit};
pub use callable::{CallError, Callable, Registry};
pub use error::{ProtocolError, RemoteFailure, RemoteFailureKind, UnblockError, WorkerFailure};
pub use log_stream::{LogSink, LogStreamer, TracingSink};
pub use orchestrator::{CallState, Executor, ExecutorConfig, WorkerCommand};
pub use tokio_util::sync::CancellationToken;
pub use workspace::{Slot, Workspace};

/// Run `callable(args)` in a fresh worker process and return its result.
///
/// Configuration comes from the environment (see [`ExecutorConfig::from_env`]);
/// `capture_logs` controls whether worker output is forwarded while it runs.
pub async fn run<C: Callable>(
    callable: C,
    args: C::Args,
    capture_logs: bool,
) -> Result<C::Output, UnblockError<C::Error>> {
    let config = ExecutorConfig::from_env().with_capture_logs(capture_logs);
    Executor::new(config).run(callable, args).await
}
