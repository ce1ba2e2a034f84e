//! Point the worker's fd 1 and fd 2 at its capture slots.
//!
//! Redirecting at the fd level (not just swapping Rust handles) means output from
//! `std::process::Command` children, C libraries and the panic hook all land in the
//! slots too.
//!
//! ## Safety contracts
//!
//! All `unsafe` blocks in this module rely on these guarantees:
//! 1. Called in the worker process before the callable runs, from the only thread
//!    that touches fds 1/2
//! 2. Standard fds (1, 2) are guaranteed open by the OS at process startup
//! 3. `from_raw_fd` + `forget` on fds 1/2 hands them to dup2 without ever closing them

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

#[cfg(unix)]
use std::os::fd::{FromRawFd, OwnedFd};

#[cfg(unix)]
use nix::unistd::dup2;

/// Open capture slots; flushes std streams when finished.
pub struct Capture {
    stdout: File,
    stderr: File,
}

impl Capture {
    /// Flush everything written so far so the log streamer sees a clean end.
    pub fn finish(mut self) {
        let _ = io::stdout().flush();
        let _ = io::stderr().flush();
        let _ = self.stdout.flush();
        let _ = self.stderr.flush();
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Redirect fd 1/2 into the given files for the rest of the process.
#[cfg(unix)]
pub fn redirect_std_streams(stdout_path: &Path, stderr_path: &Path) -> io::Result<Capture> {
    let stdout = open_append(stdout_path)?;
    let stderr = open_append(stderr_path)?;

    // Anything buffered before the switch belongs to the original streams.
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();

    let mut target_fd1 = unsafe { OwnedFd::from_raw_fd(1) };
    let result = dup2(&stdout, &mut target_fd1);
    std::mem::forget(target_fd1); // Don't close fd 1
    result.map_err(|e| io::Error::other(format!("dup2(stdout) failed: {}", e)))?;

    let mut target_fd2 = unsafe { OwnedFd::from_raw_fd(2) };
    let result = dup2(&stderr, &mut target_fd2);
    std::mem::forget(target_fd2); // Don't close fd 2
    result.map_err(|e| io::Error::other(format!("dup2(stderr) failed: {}", e)))?;

    tracing::trace!(
        stdout = %stdout_path.display(),
        stderr = %stderr_path.display(),
        "Replaced fd 1/2 with capture slots"
    );

    Ok(Capture { stdout, stderr })
}

#[cfg(not(unix))]
pub fn redirect_std_streams(stdout_path: &Path, stderr_path: &Path) -> io::Result<Capture> {
    // No fd redirection on non-Unix: output goes to the inherited console instead.
    tracing::warn!("Output capture is not supported on this platform");
    Ok(Capture {
        stdout: open_append(stdout_path)?,
        stderr: open_append(stderr_path)?,
    })
}
