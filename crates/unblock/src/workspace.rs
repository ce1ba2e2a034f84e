//! Per-call workspace: six file slots in a fresh temporary directory.
//!
//! Directory format: `{root}/unblock-{call_id}-XXXXXX/{slot}`. The random suffix from
//! `tempfile` makes concurrent creation collision-free. Dropping the workspace removes
//! the directory; [`Workspace::close`] does the same but reports failures.

use std::ffi::OsString;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use crate::bridge::protocol::{CallId, SLOT_COUNT};

/// One file slot. Declaration order is the worker's argument order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Callable,
    Args,
    Result,
    Error,
    Stdout,
    Stderr,
}

impl Slot {
    pub const ALL: [Slot; SLOT_COUNT] = [
        Slot::Callable,
        Slot::Args,
        Slot::Result,
        Slot::Error,
        Slot::Stdout,
        Slot::Stderr,
    ];

    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Callable => "callable.json",
            Self::Args => "args.json",
            Self::Result => "result.json",
            Self::Error => "error.json",
            Self::Stdout => "stdout.log",
            Self::Stderr => "stderr.log",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Slot paths in worker argument order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotPaths([PathBuf; SLOT_COUNT]);

impl SlotPaths {
    /// Build from exactly six paths; `None` on any other count.
    pub fn from_args<I>(args: I) -> Option<Self>
    where
        I: IntoIterator,
        I::Item: Into<PathBuf>,
    {
        let paths: Vec<PathBuf> = args.into_iter().map(Into::into).collect();
        let paths: [PathBuf; SLOT_COUNT] = paths.try_into().ok()?;
        Some(Self(paths))
    }

    pub fn get(&self, slot: Slot) -> &Path {
        &self.0[slot.index()]
    }

    pub fn to_args(&self) -> Vec<OsString> {
        self.0.iter().map(|p| p.clone().into_os_string()).collect()
    }
}

pub struct Workspace {
    dir: tempfile::TempDir,
    slots: SlotPaths,
}

impl Workspace {
    /// Create the directory and all six (empty) slot files.
    pub fn create(call_id: CallId, root: Option<&Path>) -> io::Result<Self> {
        let prefix = format!("unblock-{}-", call_id.short());
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let dir = match root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };

        let paths = Slot::ALL.map(|slot| dir.path().join(slot.file_name()));
        for path in &paths {
            File::create(path)?;
        }

        tracing::trace!(dir = %dir.path().display(), "Created workspace");
        Ok(Self {
            dir,
            slots: SlotPaths(paths),
        })
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn slots(&self) -> &SlotPaths {
        &self.slots
    }

    pub fn path(&self, slot: Slot) -> &Path {
        self.slots.get(slot)
    }

    pub fn write(&self, slot: Slot, bytes: &[u8]) -> io::Result<()> {
        std::fs::write(self.path(slot), bytes)
    }

    pub fn read(&self, slot: Slot) -> io::Result<Vec<u8>> {
        std::fs::read(self.path(slot))
    }

    /// Last `max_lines` lines of a capture slot, lossily decoded.
    pub fn tail(&self, slot: Slot, max_lines: usize) -> io::Result<String> {
        let bytes = self.read(slot)?;
        let text = String::from_utf8_lossy(&bytes);
        let lines: Vec<&str> = text.lines().collect();
        let start = lines.len().saturating_sub(max_lines);
        Ok(lines[start..].join("\n"))
    }

    /// Remove the directory and every slot in it.
    pub fn close(self) -> io::Result<()> {
        let dir = self.dir.path().to_path_buf();
        self.dir.close()?;
        tracing::trace!(dir = %dir.display(), "Removed workspace");
        Ok(())
    }
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("dir", &self.dir.path())
            .finish()
    }
}
