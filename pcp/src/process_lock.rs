//! Process-level locks for the pcp pollers.
//!
//! Lock strategy:
//! - `pcp-sync.lock` is held by the pulse ingester.
//! - `pcp-watchdog.lock` is held by the idle watchdog.
//! - Each lock is scoped to one store (SQLite path or REST endpoint), so two
//!   pollers of the same kind never run against the same data.
//! - Locks are advisory OS file locks (flock), held for process lifetime.

use anyhow::{Context, Result};
use pcp_core::config::{StoreBackend, StoreConfig};
use std::collections::hash_map::DefaultHasher;
use std::fs::{self, File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::PathBuf;

/// Which poller holds the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
pub enum Poller {
    Sync,
    Watchdog,
}

impl Poller {
    fn lock_file(self) -> &'static str {
        match self {
            Poller::Sync => "pcp-sync.lock",
            Poller::Watchdog => "pcp-watchdog.lock",
        }
    }

    fn binary(self) -> &'static str {
        match self {
            Poller::Sync => "pcp-sync",
            Poller::Watchdog => "pcp-watchdog",
        }
    }
}

/// Guard held by a poller for its lifetime.
pub struct PollerGuard {
    _lock: ProcessLock,
}

/// Identifies the store a poller works against.
pub fn store_scope(config: &StoreConfig) -> String {
    match config.backend {
        StoreBackend::Sqlite => config.resolved_database_path().display().to_string(),
        StoreBackend::Rest => format!(
            "{}#{}",
            config.url.as_deref().unwrap_or_default(),
            config.schema
        ),
    }
}

/// Acquire the lock for `poller` on `scope`.
///
/// Fails if another instance of the same poller already runs against it.
pub fn acquire_poller_guard(poller: Poller, scope: &str) -> Result<PollerGuard> {
    match try_acquire_lock(poller.lock_file(), scope)? {
        Some(lock) => Ok(PollerGuard { _lock: lock }),
        None => anyhow::bail!(
            "failed to start {}: another instance is already running against {}",
            poller.binary(),
            scope
        ),
    }
}

struct ProcessLock {
    file: File,
    path: PathBuf,
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        let _ = unlock_file(&self.file);
        let _ = fs::remove_file(&self.path);
    }
}

fn try_acquire_lock(filename: &str, scope: &str) -> Result<Option<ProcessLock>> {
    let dir = lock_dir();
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create runtime lock directory: {}", dir.display()))?;

    let path = dir.join(scoped_lock_filename(filename, scope));
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .with_context(|| format!("failed to open lock file: {}", path.display()))?;

    match lock_file_nonblocking(&file) {
        Ok(()) => {
            // Owner info for debugging
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={}", std::process::id());
            let _ = file.flush();

            Ok(Some(ProcessLock { file, path }))
        }
        Err(e) if is_lock_busy(&e) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to lock file: {}", path.display())),
    }
}

fn lock_dir() -> PathBuf {
    let mut dir = match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => std::env::temp_dir(),
    };
    dir.push("pcp");
    dir
}

fn scoped_lock_filename(base_filename: &str, scope: &str) -> String {
    let mut hasher = DefaultHasher::new();
    scope.hash(&mut hasher);
    let digest = hasher.finish();
    format!("{base_filename}.{digest:016x}")
}

fn is_lock_busy(error: &io::Error) -> bool {
    matches!(error.kind(), io::ErrorKind::WouldBlock)
        || matches!(error.raw_os_error(), Some(11) | Some(35))
}

#[cfg(unix)]
fn lock_file_nonblocking(file: &File) -> io::Result<()> {
    const LOCK_EX: i32 = 2;
    const LOCK_NB: i32 = 4;
    let fd = file.as_raw_fd();
    // SAFETY: flock is called with a valid file descriptor and constant flags.
    let rc = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn unlock_file(file: &File) -> io::Result<()> {
    const LOCK_UN: i32 = 8;
    let fd = file.as_raw_fd();
    // SAFETY: flock is called with a valid file descriptor and constant flags.
    let rc = unsafe { flock(fd, LOCK_UN) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
extern "C" {
    fn flock(fd: i32, operation: i32) -> i32;
}

#[cfg(not(unix))]
compile_error!("pcp process locks currently require Unix (macOS/Linux)");
