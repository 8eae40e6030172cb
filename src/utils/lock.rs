// dbbackup/src/utils/lock.rs
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::errors::{AppError, IoContext, Result};

pub const LOCK_FILE_NAME: &str = ".dbbackup.lock";

/// Exclusive claim on a backup root. The lock file holds the owner's PID and
/// is removed when the guard is dropped.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(backup_root: &Path) -> Result<Self> {
        let path = backup_root.join(LOCK_FILE_NAME);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Err(AppError::Locked(path)),
            Err(e) => {
                return Err(e).fs_context(|| format!("Failed to create lock file {}", path.display()));
            }
        };
        writeln!(file, "{}", std::process::id())
            .fs_context(|| format!("Failed to write lock file {}", path.display()))?;
        debug!("Acquired run lock {}", path.display());
        Ok(RunLock { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("⚠️ Failed to remove lock file {}: {}", self.path.display(), e);
        }
    }
}
