//! Crash-safe persistence for the status map.
//!
//! Checkpointing is atomic-rename: serialise to a `.tmp` sibling, fsync
//! it, rename over the mapfile, fsync the directory. After a crash the
//! on-disk pair therefore satisfies: every range recorded as finished
//! refers to bytes the cache image held when the checkpoint was cut.
//!
//! The session lock is an exclusive, non-blocking `flock` on a `.lock`
//! sidecar. The mapfile inode itself is replaced by every checkpoint
//! rename, so a lock held on it would stop excluding other engines
//! after the first checkpoint.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::debug;

use blkcache_map::{self as mapfile, StatusMap};

use crate::error::{CacheError, CacheResult};

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Atomically replace the mapfile at `map_path` with the current state.
pub fn checkpoint(map: &StatusMap, map_path: &Path) -> io::Result<()> {
    let tmp_path = sibling(map_path, ".tmp");

    let file = File::create(&tmp_path)?;
    let mut writer = BufWriter::new(file);
    mapfile::save(map, &mut writer)?;
    writer.flush()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;

    fs::rename(&tmp_path, map_path)?;
    if let Some(dir) = map_path.parent() {
        File::open(dir)?.sync_all()?;
    }

    debug!(path = %map_path.display(), runs = map.run_count(), "checkpointed mapfile");
    Ok(())
}

/// Exclusive advisory lock tying one engine instance to a mapfile.
pub struct SessionLock {
    file: File,
    path: PathBuf,
}

impl SessionLock {
    /// Take the lock for `map_path`, failing with
    /// [`CacheError::AlreadyInUse`] when another engine holds it.
    pub fn acquire(map_path: &Path) -> CacheResult<Self> {
        let path = sibling(map_path, ".lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if ret == -1 {
            let err = io::Error::last_os_error();
            return if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                Err(CacheError::AlreadyInUse(map_path.to_path_buf()))
            } else {
                Err(err.into())
            };
        }

        debug!(path = %path.display(), "acquired session lock");
        Ok(Self { file, path })
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        debug!(path = %self.path.display(), "released session lock");
    }
}
