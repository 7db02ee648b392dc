//! Filesystem utilities: crash-safe writes and the repository file lock.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::error::{VeldError, VeldResult};

/// Write data to a file atomically using temp-file-then-rename.
///
/// On POSIX, `rename()` within the same filesystem is atomic: either the
/// old file or the new file is visible, never a partial write. The temp
/// file is fsynced before the rename so the data is durable on disk.
pub fn atomic_write(path: &Path, data: &[u8]) -> VeldResult<()> {
    let tmp = path.with_extension("tmp");
    let mut file = File::create(&tmp)?;
    file.write_all(data)?;
    file.sync_data()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// An exclusive advisory lock on a repository directory.
///
/// Uses `flock(2)` (via `fs2`) on `repo.lock`. Held for the lifetime of
/// the value; the OS releases it if the process dies.
pub struct RepoLock {
    _file: File,
}

impl RepoLock {
    /// Acquire the lock, polling until `timeout` expires.
    pub fn acquire(veld_dir: &Path, timeout: Duration) -> VeldResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(veld_dir.join("repo.lock"))?;

        let start = Instant::now();
        let poll_interval = Duration::from_millis(10);

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(RepoLock { _file: file }),
                Err(_) if start.elapsed() >= timeout => {
                    return Err(VeldError::RepoLockTimeout);
                }
                Err(_) => std::thread::sleep(poll_interval),
            }
        }
    }
}
