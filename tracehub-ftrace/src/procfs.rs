// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tracefs I/O behind a trait, the same way [`tracehub_service::ProducerChannel`]
//! sits between the service core and the wire: the real implementation
//! touches `/sys/kernel/tracing`, which needs root and a live kernel this
//! environment doesn't have; tests substitute a directory tree they control.

use std::fs::OpenOptions;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// Tracefs operations the controller needs, scoped to one instance directory
/// (the top-level tracefs mount for the global instance, or
/// `instances/<name>` for a private one).
pub trait FtraceProcfs: Send + Sync {
    /// Writes `value` to the control file at `relative_path` (relative to
    /// this instance's root), truncating any previous contents. Used for
    /// `tracing_on`, `events/<cat>/<name>/enable`, and `trace` (clearing).
    fn write_control(&self, relative_path: &str, value: &str) -> io::Result<()>;

    /// Opens `per_cpu/cpu<N>/trace_pipe_raw` for non-blocking reads.
    fn open_trace_pipe_raw(&self, cpu: usize) -> io::Result<OwnedFd>;

    /// Creates a new tracefs instance named `name`, a sibling of this one
    /// reachable via `instances/<name>`. A no-op if it already exists.
    fn create_instance(&self, name: &str) -> io::Result<()>;

    /// Tears down an instance created with `create_instance`.
    fn remove_instance(&self, name: &str) -> io::Result<()>;
}

/// The real tracefs mount, rooted at `/sys/kernel/tracing` (or
/// `/sys/kernel/debug/tracing` on older kernels, which `new` falls back to).
pub struct RealFtraceProcfs {
    root: PathBuf,
}

impl RealFtraceProcfs {
    pub fn new() -> io::Result<Self> {
        for candidate in ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"] {
            let path = PathBuf::from(candidate);
            if path.is_dir() {
                return Ok(RealFtraceProcfs { root: path });
            }
        }
        Err(io::Error::new(io::ErrorKind::NotFound, "no tracefs mount found"))
    }

    /// A view of the named instance under this mount (`instances/<name>`).
    /// Does not itself create the directory; call [`FtraceProcfs::create_instance`]
    /// on the top-level mount first.
    pub fn instance(&self, name: &str) -> Self {
        RealFtraceProcfs { root: self.root.join("instances").join(name) }
    }

    fn resolve(&self, relative_path: &str) -> PathBuf {
        self.root.join(relative_path)
    }
}

impl FtraceProcfs for RealFtraceProcfs {
    fn write_control(&self, relative_path: &str, value: &str) -> io::Result<()> {
        std::fs::write(self.resolve(relative_path), value)
    }

    fn open_trace_pipe_raw(&self, cpu: usize) -> io::Result<OwnedFd> {
        let path = self.resolve(&format!("per_cpu/cpu{cpu}/trace_pipe_raw"));
        let file = OpenOptions::new().read(true).custom_flags(libc::O_NONBLOCK).open(path)?;
        Ok(OwnedFd::from(file))
    }

    fn create_instance(&self, name: &str) -> io::Result<()> {
        let path = self.root.join("instances").join(name);
        match std::fs::create_dir(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn remove_instance(&self, name: &str) -> io::Result<()> {
        let path = self.root.join("instances").join(name);
        match std::fs::remove_dir(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// A directory-tree-backed fake for tests: `write_control` writes real files
/// under a temp root instead of sysfs, and `open_trace_pipe_raw` opens a
/// plain file that tests can pre-populate with bytes to simulate a wakeup.
pub struct FakeFtraceProcfs {
    root: PathBuf,
}

impl FakeFtraceProcfs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FakeFtraceProcfs { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl FtraceProcfs for FakeFtraceProcfs {
    fn write_control(&self, relative_path: &str, value: &str) -> io::Result<()> {
        let path = self.root.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, value)
    }

    fn open_trace_pipe_raw(&self, cpu: usize) -> io::Result<OwnedFd> {
        let path = self.root.join(format!("per_cpu/cpu{cpu}/trace_pipe_raw"));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        Ok(OwnedFd::from(file))
    }

    fn create_instance(&self, name: &str) -> io::Result<()> {
        std::fs::create_dir_all(self.root.join("instances").join(name))
    }

    fn remove_instance(&self, name: &str) -> io::Result<()> {
        let path = self.root.join("instances").join(name);
        match std::fs::remove_dir_all(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
