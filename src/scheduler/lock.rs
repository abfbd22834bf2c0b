//! Driver process lock.
//!
//! A lock file at a well-known path means a driver cycle is in progress.
//! It is created with `O_CREAT | O_EXCL`, so two processes can never both
//! observe "absent" and proceed, and it is removed when the guard drops.
//!
//! This lock is independent of the queue file's `flock`: it serializes
//! driver cycles, not queue mutations.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::LockError;

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

impl LockHolder {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        }
    }

    /// Whether the recorded process still exists on this host.
    ///
    /// `EPERM` means the process exists under another user. Any answer other
    /// than `ESRCH` counts as alive.
    pub fn is_alive(&self) -> bool {
        let Ok(pid) = i32::try_from(self.pid) else {
            return true;
        };
        !matches!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
    }

    /// Stale means both older than `ttl` and no longer running.
    pub fn is_stale(&self, ttl: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.acquired_at);
        let expired = age.to_std().map(|age| age >= ttl).unwrap_or(false);
        expired && !self.is_alive()
    }
}

/// Outcome of [`ProcessLock::acquire`].
#[derive(Debug)]
pub enum LockAcquisition {
    Acquired(ProcessLock),
    /// Another cycle holds the lock. `holder` is `None` when the lock file
    /// could not be read (e.g. written by an older driver).
    AlreadyHeld { holder: Option<LockHolder> },
}

/// Guard for the driver lock file. Dropping it removes the file if it still
/// records this guard as the holder.
#[derive(Debug)]
pub struct ProcessLock {
    path: PathBuf,
    holder: LockHolder,
}

impl ProcessLock {
    /// Tries to create the lock file.
    ///
    /// With `stale_after` set, a lock whose recorded acquisition time is older
    /// than that and whose process is gone is treated as left behind by a
    /// crashed cycle: it is moved aside and acquisition is retried once.
    pub fn acquire(path: &Path, stale_after: Option<Duration>) -> Result<LockAcquisition, LockError> {
        if let Some(lock) = Self::try_create(path)? {
            return Ok(LockAcquisition::Acquired(lock));
        }

        let holder = read_holder(path);
        let stale = match (stale_after, holder) {
            (Some(ttl), Some(h)) if h.is_stale(ttl) => h,
            (_, holder) => return Ok(LockAcquisition::AlreadyHeld { holder }),
        };

        warn!(
            path = %path.display(),
            pid = stale.pid,
            acquired_at = %stale.acquired_at,
            "Taking over stale driver lock"
        );
        move_aside(path, &stale)?;
        match Self::try_create(path)? {
            Some(lock) => Ok(LockAcquisition::Acquired(lock)),
            None => Ok(LockAcquisition::AlreadyHeld {
                holder: read_holder(path),
            }),
        }
    }

    fn try_create(path: &Path) -> Result<Option<Self>, LockError> {
        let create_err = |source| LockError::Create {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(create_err)?;
            }
        }

        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(create_err(e)),
        };

        // Release checks the payload, so a lock without one must not survive.
        let holder = LockHolder::current();
        let written = serde_json::to_string(&holder)
            .map_err(std::io::Error::other)
            .and_then(|payload| writeln!(file, "{}", payload))
            .and_then(|()| file.sync_all());
        if let Err(e) = written {
            let _ = fs::remove_file(path);
            return Err(create_err(e));
        }

        debug!(path = %path.display(), "Driver lock acquired");
        Ok(Some(Self {
            path: path.to_path_buf(),
            holder,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn holder(&self) -> &LockHolder {
        &self.holder
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        if read_holder(&self.path).as_ref() != Some(&self.holder) {
            warn!(path = %self.path.display(), "Driver lock was taken over, leaving it in place");
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Driver lock released"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove driver lock"),
        }
    }
}

/// Renames the stale lock to a private name, so that only one contender
/// removes it. If the renamed file turns out not to be the stale lock (a
/// racing driver already replaced it), it is linked back without clobbering.
fn move_aside(path: &Path, stale: &LockHolder) -> Result<(), LockError> {
    let aside = aside_path(path);
    match fs::rename(path, &aside) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(LockError::RemoveStale {
                path: path.to_path_buf(),
                source,
            })
        }
    }

    if read_holder(&aside).as_ref() != Some(stale) {
        if let Err(e) = fs::hard_link(&aside, path) {
            warn!(path = %path.display(), error = %e, "Could not restore a live driver lock");
        }
    }
    if let Err(e) = fs::remove_file(&aside) {
        warn!(path = %aside.display(), error = %e, "Failed to remove stale lock copy");
    }
    Ok(())
}

fn aside_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "driver.lock".to_string());
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    path.with_file_name(format!(".{}.stale.{}.{}", name, std::process::id(), nanos))
}

fn read_holder(path: &Path) -> Option<LockHolder> {
    let content = fs::read_to_string(path).ok()?;
    serde_json::from_str(content.trim()).ok()
}
