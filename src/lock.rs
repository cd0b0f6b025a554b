/*!
 * Single-instance guard
 *
 * A marker file holding the owner's pid. Presence of the file blocks other
 * instances; a marker whose process is gone is reclaimed.
 */

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::{BackupError, Result};

/// Default marker file name
pub const DEFAULT_LOCK_FILE: &str = "lock.pid";

/// Held process lock. Dropping it removes the marker.
#[derive(Debug)]
pub struct ProcessLock {
    path: PathBuf,
    released: bool,
}

impl ProcessLock {
    /// Create the marker, failing with [`BackupError::Locked`] if a live
    /// process already holds it
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match Self::create_marker(path) {
            Ok(lock) => Ok(lock),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let holder = read_pid(path);
                match holder {
                    Some(pid) if !process_alive(pid) => {
                        tracing::warn!(
                            "removing stale lock {} left by process {}",
                            path.display(),
                            pid
                        );
                        fs::remove_file(path)?;
                        Self::create_marker(path).map_err(|e| match e.kind() {
                            io::ErrorKind::AlreadyExists => BackupError::Locked {
                                path: path.to_path_buf(),
                                pid: read_pid(path),
                            },
                            _ => BackupError::Io(e),
                        })
                    }
                    pid => Err(BackupError::Locked {
                        path: path.to_path_buf(),
                        pid,
                    }),
                }
            }
            Err(e) => Err(BackupError::Io(e)),
        }
    }

    fn create_marker(path: &Path) -> io::Result<Self> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        write!(file, "{}", std::process::id())?;
        tracing::debug!("acquired {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            released: false,
        })
    }

    /// Marker path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the marker now and report failures
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        remove_marker(&self.path)?;
        tracing::debug!("released {}", self.path.display());
        Ok(())
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = remove_marker(&self.path) {
                tracing::error!("failed to remove lock {}: {}", self.path.display(), e);
            }
        }
    }
}

fn remove_marker(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Whether a process with this pid exists
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // Signal 0 only performs the existence and permission checks.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Whether a process with this pid exists
#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    true
}
