//! The host-wide run lock.
//!
//! The lock is an exclusive `flock` on a file in the backup root. The kernel drops the lock when
//! the holding process exits for any reason, including a crash or a reboot, so a lock can never be
//! left stale. The file additionally records who holds it, which is only used for diagnostics.

use core::fmt;
use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    process,
};

use chrono::{DateTime, Utc};
use nix::{
    errno::Errno,
    fcntl::{Flock, FlockArg},
    sys::signal::kill,
    unistd::{Pid, gethostname},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Who holds, or last held, the run lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    /// The holder's process id.
    pub pid: u32,

    /// The holder's host.
    pub hostname: String,

    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
}

impl LockHolder {
    fn current() -> Self {
        Self {
            pid: process::id(),
            hostname: current_hostname(),
            acquired_at: Utc::now(),
        }
    }

    /// If the holder's process still runs. A holder on another host is assumed alive.
    pub fn is_alive(&self) -> bool {
        if self.hostname != current_hostname() {
            return true;
        }

        let Ok(pid) = i32::try_from(self.pid) else {
            return false;
        };

        !matches!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
    }
}

impl fmt::Display for LockHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pid {} on '{}' since {}",
            self.pid, self.hostname, self.acquired_at
        )
    }
}

/// An acquired run lock, released on drop.
pub struct RunLock {
    lock: Flock<File>,
    path: PathBuf,
}

impl RunLock {
    /// Acquire the lock without blocking.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| LockError::Io(e, "create lock directory"))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| LockError::Io(e, "open lock file"))?;

        let mut lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((mut file, errno)) if errno == Errno::EWOULDBLOCK => {
                let holder = read_holder(&mut file);
                return Err(LockError::Held(holder));
            }
            Err((_, errno)) => return Err(LockError::Flock(errno, path.to_path_buf())),
        };

        if let Some(previous) = read_holder(&mut lock) {
            if !previous.is_alive() {
                info!("Recovered run lock left by {previous}");
            }
        }

        let holder = LockHolder::current();
        let record = serde_json::to_vec(&holder).map_err(LockError::Serialize)?;
        lock.set_len(0)
            .map_err(|e| LockError::Io(e, "truncate lock file"))?;
        lock.seek(SeekFrom::Start(0))
            .map_err(|e| LockError::Io(e, "seek lock file"))?;
        lock.write_all(&record)
            .map_err(|e| LockError::Io(e, "write lock file"))?;
        lock.sync_all()
            .map_err(|e| LockError::Io(e, "sync lock file"))?;

        Ok(Self {
            lock,
            path: path.to_path_buf(),
        })
    }

    /// The lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = self.lock.set_len(0) {
            warn!("Could not clear lock file {:?}: {e}", self.path);
        }
    }
}

fn read_holder(file: &mut File) -> Option<LockHolder> {
    let mut contents = Vec::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_end(&mut contents).ok()?;

    if contents.is_empty() {
        return None;
    }

    serde_json::from_slice(&contents).ok()
}

fn describe_holder(holder: Option<&LockHolder>) -> String {
    holder.map_or_else(|| "an unknown process".to_string(), ToString::to_string)
}

fn current_hostname() -> String {
    gethostname()
        .map(|hostname| hostname.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum LockError {
    #[error("A backup is already running, held by {}", describe_holder(.0.as_ref()))]
    Held(Option<LockHolder>),

    #[error("Failed to lock {1:?}: {0}")]
    Flock(#[source] Errno, PathBuf),

    #[error("Failed to {1}: {0}")]
    Io(#[source] io::Error, &'static str),

    #[error("Failed to serialize lock holder: {0}")]
    Serialize(#[source] serde_json::Error),
}
