//! Advisory file locks shared by the daemon, hook and CLI processes.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use log::debug;

/// An exclusive `flock` on a lock file, released on drop.
///
/// Each acquisition opens its own descriptor, so two holders in the same
/// process exclude each other just like two processes do.
#[derive(Debug)]
pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Blocks until the lock on `path` is held. The file and its parent
    /// directory are created when missing.
    pub fn acquire_blocking(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        FileExt::lock_exclusive(&file)?;
        debug!("Locked {}", path.display());
        Ok(Self { file })
    }

    pub async fn acquire(path: PathBuf) -> io::Result<Self> {
        tokio::task::spawn_blocking(move || Self::acquire_blocking(&path))
            .await
            .map_err(io::Error::other)?
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
