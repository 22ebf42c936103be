//! Single-instance PID lock.
//!
//! The lock file holds the owning process id. On conflict: a live owner
//! means another instance is active and this one must stop; a dead owner
//! means a stale lock that can be reclaimed.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{EngineError, Result};

/// Held for the lifetime of an orchestration (or a whole scheduled
/// process). Dropping it releases the lock.
pub struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "cannot remove lock file");
            }
        }
    }
}

/// Create the lock exclusively, reclaiming it when the recorded owner is
/// dead.
pub fn acquire(path: &Path) -> Result<LockGuard> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    match try_create(path) {
        Ok(()) => {
            debug!(path = %path.display(), "lock acquired");
            return Ok(LockGuard {
                path: path.to_path_buf(),
            });
        }
        Err(e) if e.kind() != std::io::ErrorKind::AlreadyExists => return Err(e.into()),
        Err(_) => {}
    }

    let owner = std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<i32>().ok());

    match owner {
        Some(pid) if pid_alive(pid) => Err(EngineError::LockHeld { pid }),
        Some(pid) => {
            warn!(path = %path.display(), pid, "reclaiming stale lock from dead process");
            std::fs::remove_file(path)?;
            try_create(path)?;
            Ok(LockGuard {
                path: path.to_path_buf(),
            })
        }
        None => {
            warn!(path = %path.display(), "lock file holds no pid, reclaiming");
            std::fs::remove_file(path)?;
            try_create(path)?;
            Ok(LockGuard {
                path: path.to_path_buf(),
            })
        }
    }
}

fn try_create(path: &Path) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(std::process::id().to_string().as_bytes())
}

#[cfg(unix)]
fn pid_alive(pid: i32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid), None).is_ok()
}

#[cfg(not(unix))]
fn pid_alive(_pid: i32) -> bool {
    // Without a liveness probe, treat any recorded owner as alive.
    true
}
