//! Process-level advisory lock guarding backup, cleanup and restore.
//!
//! Two cycles against the same project directory must never overlap. The
//! lock is an exclusive `flock` on `<project_dir>/.backup.lock`, held for the
//! lifetime of [`CycleLock`] and released on drop. A killed process releases
//! it automatically, so the next invocation starts clean.

use crate::utils::errors::{BackupError, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub struct CycleLock {
    file: File,
    path: PathBuf,
}

impl CycleLock {
    /// Try to acquire the lock without blocking.
    ///
    /// Returns `BackupError::Locked` when another process holds it.
    pub fn try_acquire<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                file.set_len(0)?;
                writeln!(file, "{}", std::process::id())?;
                info!("Acquired backup lock at {}", path.display());
                Ok(Self { file, path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                debug!("Backup lock already held at {}", path.display());
                Err(BackupError::Locked(path))
            }
            Err(e) => Err(BackupError::Io(e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CycleLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        debug!("Released backup lock at {}", self.path.display());
    }
}
