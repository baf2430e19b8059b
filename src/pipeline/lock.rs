//! Single-flight guard for pipeline passes
//!
//! An exclusive advisory lock on a file shared by every pass entry point.
//! Ingestion and archival, or two ingestions, cannot interleave against the
//! same store while one process holds it. Released on drop.

use chrono::Utc;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// `Ok(None)` when another holder has the lock
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, std::io::Error> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if file.try_lock_exclusive().is_err() {
            return Ok(None);
        }

        let owner = format!(
            "pid={}\nacquired_at={}\n",
            std::process::id(),
            Utc::now().to_rfc3339()
        );
        file.set_len(0)?;
        file.write_all(owner.as_bytes())?;
        file.flush()?;

        Ok(Some(Self {
            file,
            path: path.to_path_buf(),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
