//! File-based locking to prevent two engines managing the same chain.
//!
//! Uses flock-style advisory locking. The engine holds the lock for its
//! whole run; offline maintenance commands take it too.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// An exclusive lock on the banwatch lock file, released on drop.
#[derive(Debug)]
pub struct LockGuard {
    _file: File,
    path: PathBuf,
}

impl LockGuard {
    /// Attempt to acquire an exclusive lock without blocking.
    /// Returns an error if another instance holds it.
    ///
    /// Opens with create+read+write (no truncate) so creation and locking
    /// cannot race.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).ok();
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open lock file: {}", path.display()))?;

        // Owner read/write only
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .context("Failed to set lock file permissions")?;

        file.try_lock_exclusive().map_err(|_| {
            anyhow::anyhow!(
                "Another banwatch instance holds the lock.\n\
                 If you believe this is an error, remove the lock file: {}\n\
                 Or stop the running engine first.",
                path.display()
            )
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
