//! Run lock preventing two launchers from working at once
//!
//! The lock file is created with create-if-absent semantics, so two launchers
//! racing for it cannot both win. It holds the owner's pid and is removed when
//! the guard drops.

use crate::error::LaunchError;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Guard for an acquired run lock
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Take the lock or fail immediately if someone holds it
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, LaunchError> {
        Self::claim(path.into(), |file| {
            writeln!(file, "{}", std::process::id())?;
            file.sync_all()
        })
    }

    fn claim(path: PathBuf, write_holder: impl FnOnce(&mut File) -> io::Result<()>) -> Result<Self, LaunchError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                if let Err(e) = write_holder(&mut file) {
                    // Never leave a lock behind without a holder pid
                    let _ = fs::remove_file(&path);
                    return Err(e.into());
                }
                info!(path = %path.display(), "Run lock acquired");
                Ok(Self { path })
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let holder = read_holder(&path).unwrap_or_else(|| "unknown".to_string());
                Err(LaunchError::LockContention { path, holder })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release explicitly; dropping the guard does the same
    pub fn release(self) {}
}

impl Drop for RunLock {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Run lock released"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove run lock"),
        }
    }
}

/// Pid recorded in an existing lock file
pub fn read_holder(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Remove a lock whose holder is no longer running; true if one was removed
pub fn clear_stale(path: &Path) -> bool {
    let Some(holder) = read_holder(path) else {
        return false;
    };
    let alive = holder.parse::<u32>().map(crate::process::is_alive).unwrap_or(false);
    if alive {
        return false;
    }
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to remove stale run lock");
            false
        }
    }
}
