//! File-based locking so two provisioning runs never overlap.
//!
//! The state store and every managed file assume a single writer; an
//! exclusive advisory lock on a well-known file enforces it.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::error::ProvisionError;

pub const DEFAULT_LOCK_FILE: &str = "/run/bastion.lock";

/// Holds the run lock until dropped.
pub struct LockGuard {
    _file: File,
    path: PathBuf,
}

impl LockGuard {
    /// Take the lock at `path` without waiting.
    ///
    /// Fails with a precondition error when another run holds it.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }

        // create+read+write without truncation: no window between create and lock.
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open lock file: {}", path.display()))?;

        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .context("Failed to set lock file permissions")?;

        file.try_lock_exclusive().map_err(|_| {
            ProvisionError::Precondition(format!(
                "Another bastion run is in progress (lock held on {}). \
                 Wait for it to finish; the lock is released when it exits.",
                path.display()
            ))
        })?;

        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
