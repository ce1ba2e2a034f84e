//! Live forwarding of the worker's captured stdout/stderr.
//!
//! The worker writes its streams into file slots; a [`LogStreamer`] task polls both
//! files for growth and forwards complete lines to a [`LogSink`]. Once the worker has
//! exited, [`LogStreamer::finish`] keeps reading until a full pass finds no new bytes,
//! then forwards any unterminated trailing fragment.
//!
//! Ordering is preserved within each stream. Interleaving between stdout and stderr
//! is best-effort.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::bridge::protocol::LogSource;

/// Fragments longer than this without a newline are forwarded as a line.
const MAX_PENDING: usize = 64 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// Receives forwarded worker output, one line at a time.
pub trait LogSink: Send + Sync + 'static {
    fn line(&self, source: LogSource, line: &str);
}

impl<F> LogSink for F
where
    F: Fn(LogSource, &str) + Send + Sync + 'static,
{
    fn line(&self, source: LogSource, line: &str) {
        self(source, line)
    }
}

/// Default sink: re-emits worker output as tracing events on `unblock::worker`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn line(&self, source: LogSource, line: &str) {
        tracing::info!(target: "unblock::worker", source = source.as_str(), "{}", line);
    }
}

/// Background task tailing a worker's capture slots.
pub struct LogStreamer {
    handle: Option<JoinHandle<()>>,
    exited: CancellationToken,
}

impl LogStreamer {
    /// Start tailing. Must run inside a tokio runtime.
    ///
    /// The task inherits the current span, so forwarded lines carry the call's context.
    pub fn spawn(
        stdout: PathBuf,
        stderr: PathBuf,
        sink: Arc<dyn LogSink>,
        poll_interval: Duration,
    ) -> Self {
        let exited = CancellationToken::new();
        let tails = [
            Tail::new(LogSource::Stdout, stdout),
            Tail::new(LogSource::Stderr, stderr),
        ];
        let handle = tokio::spawn(
            stream_logs(tails, sink, poll_interval, exited.clone()).in_current_span(),
        );
        Self {
            handle: Some(handle),
            exited,
        }
    }

    /// Signal that the worker exited and wait until remaining output is drained.
    pub async fn finish(mut self) {
        self.exited.cancel();
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
            && !e.is_cancelled()
        {
            tracing::warn!(error = %e, "Log streamer task failed");
        }
    }
}

impl Drop for LogStreamer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn stream_logs(
    mut tails: [Tail; 2],
    sink: Arc<dyn LogSink>,
    poll_interval: Duration,
    exited: CancellationToken,
) {
    loop {
        // Checked before reading: once the worker is gone its output is complete, so an
        // empty pass after this point means everything has been seen.
        let draining = exited.is_cancelled();

        let mut progressed = false;
        for tail in tails.iter_mut() {
            progressed |= tail.poll(sink.as_ref()).await > 0;
        }

        if draining && !progressed {
            break;
        }
        if !progressed {
            tokio::select! {
                _ = exited.cancelled() => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    for tail in tails.iter_mut() {
        tail.flush(sink.as_ref());
    }
    tracing::trace!("Log streamer drained");
}

/// Read position and unterminated bytes for one capture slot.
struct Tail {
    source: LogSource,
    path: PathBuf,
    file: Option<tokio::fs::File>,
    pending: Vec<u8>,
    failed: bool,
}

impl Tail {
    fn new(source: LogSource, path: PathBuf) -> Self {
        Self {
            source,
            path,
            file: None,
            pending: Vec::new(),
            failed: false,
        }
    }

    /// Read everything appended since the last poll. Returns the number of new bytes.
    async fn poll(&mut self, sink: &dyn LogSink) -> usize {
        if self.failed {
            return 0;
        }
        match self.read_new(sink).await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(source = %self.source, path = %self.path.display(), error = %e, "Stopped tailing capture slot");
                self.failed = true;
                0
            }
        }
    }

    async fn read_new(&mut self, sink: &dyn LogSink) -> std::io::Result<usize> {
        if self.file.is_none() {
            self.file = Some(tokio::fs::File::open(&self.path).await?);
        }
        let Some(file) = self.file.as_mut() else {
            return Ok(0);
        };

        let mut total = 0;
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            total += n;
            self.pending.extend_from_slice(&buf[..n]);
            emit_lines(&mut self.pending, self.source, sink);
        }
        Ok(total)
    }

    fn flush(&mut self, sink: &dyn LogSink) {
        if !self.pending.is_empty() {
            emit(sink, self.source, &self.pending);
            self.pending.clear();
        }
    }
}

/// Forward every complete line in `pending`, keeping the unterminated rest.
///
/// A rest longer than [`MAX_PENDING`] is forwarded too, except for a trailing
/// incomplete UTF-8 sequence, which waits for its remaining bytes.
fn emit_lines(pending: &mut Vec<u8>, source: LogSource, sink: &dyn LogSink) {
    let mut start = 0;
    while let Some(offset) = pending[start..].iter().position(|&b| b == b'\n') {
        let end = start + offset;
        emit(sink, source, &pending[start..end]);
        start = end + 1;
    }
    pending.drain(..start);

    if pending.len() > MAX_PENDING {
        let cut = match std::str::from_utf8(pending) {
            Err(e) if e.error_len().is_none() && e.valid_up_to() > 0 => e.valid_up_to(),
            _ => pending.len(),
        };
        emit(sink, source, &pending[..cut]);
        pending.drain(..cut);
    }
}

fn emit(sink: &dyn LogSink, source: LogSource, bytes: &[u8]) {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    sink.line(source, &String::from_utf8_lossy(bytes));
}
