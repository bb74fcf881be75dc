//! Cross-process file mutex used by the artifact cache layer.
//!
//! Locking is exclusive creation of a sentinel file carrying JSON metadata
//! about the holder, polled with a fixed backoff up to a hard timeout.
//! Releasing deletes the sentinel; the guard releases on drop.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use gantry_types::{GantryError, Result};

/// Metadata written into the sentinel file for diagnosing stuck locks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub owner: String,
    pub pid: u32,
}

/// RAII guard for a held lock; deletes the sentinel on drop.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    released: bool,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock early.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            if let Err(err) = std::fs::remove_file(&self.path) {
                tracing::warn!("failed to release lock {}: {err}", self.path.display());
            }
        }
    }
}

fn read_holder(path: &Path) -> String {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|text| serde_json::from_str::<LockInfo>(&text).ok())
        .map(|info| format!("{} (pid {})", info.owner, info.pid))
        .unwrap_or_else(|| "unknown".to_string())
}

fn try_acquire(path: &Path, owner: &str) -> Result<Option<LockGuard>> {
    match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
    {
        Ok(mut file) => {
            let info = LockInfo {
                owner: owner.to_string(),
                pid: std::process::id(),
            };
            file.write_all(serde_json::to_string(&info)?.as_bytes())?;
            Ok(Some(LockGuard {
                path: path.to_path_buf(),
                released: false,
            }))
        }
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Acquire the lock at `path`, polling with `poll` backoff up to `timeout`.
pub fn acquire(path: &Path, owner: &str, timeout: Duration, poll: Duration) -> Result<LockGuard> {
    let start = Instant::now();
    loop {
        if let Some(guard) = try_acquire(path, owner)? {
            return Ok(guard);
        }
        if start.elapsed() >= timeout {
            return Err(GantryError::LockTimeout {
                path: path.to_path_buf(),
                holder: read_holder(path),
                waited_ms: start.elapsed().as_millis() as u64,
            });
        }
        std::thread::sleep(poll);
    }
}
