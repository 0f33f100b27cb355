//! Physical source abstraction.
//!
//! The engine sees the medium through the [`RawDevice`] capability:
//! size, sector size, and positioned reads. [`FileDevice`] backs it with
//! a regular file or a block device node; [`MemDevice`] is an in-memory
//! implementation with scriptable faults for tests and embedders.

use std::fs::{File, Metadata};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

/// Result alias for device reads.
pub type RawResult<T> = Result<T, RawError>;

/// Failure modes of a physical read.
#[derive(Debug, Error)]
pub enum RawError {
    /// The medium could not produce the requested sectors.
    #[error("medium error: {length} bytes at offset {offset}")]
    Medium {
        /// First byte of the failed range.
        offset: u64,
        /// Length of the failed range in bytes.
        length: u64,
    },

    /// The device returned fewer bytes than requested inside its bounds.
    #[error("short read: got {got} bytes")]
    ShortRead {
        /// Number of bytes actually read.
        got: usize,
    },

    /// The device is no longer reachable.
    #[error("device closed")]
    Closed,

    /// Any other failure.
    #[error("device error: {0}")]
    Other(#[from] io::Error),
}

/// Capability the engine consumes to reach the physical medium.
///
/// Implementations need not be reentrant; the engine serialises
/// physical reads per device.
pub trait RawDevice: Send {
    /// Device capacity in bytes. Constant over the session.
    fn size(&self) -> u64;

    /// Sector size in bytes. Power of two, at least 512.
    fn block_size(&self) -> u32;

    /// Read `length` bytes at `offset`. Both are aligned to the sector
    /// size by the caller.
    fn read(&self, offset: u64, length: usize) -> RawResult<Bytes>;
}

// ── file-backed device ────────────────────────────────────────────────────

/// A [`RawDevice`] backed by a block device node or a regular file.
pub struct FileDevice {
    file: File,
    path: PathBuf,
    size: u64,
    sector_size: u32,
}

impl FileDevice {
    /// Open `path` read-only and probe its size and sector size.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let metadata = file.metadata()?;

        let size = device_size(&file, &metadata)?;
        let sector_size = sector_size(&file, &metadata, &path);

        debug!(
            path = %path.display(),
            size,
            sector_size,
            "opened raw device"
        );

        Ok(Self {
            file,
            path,
            size,
            sector_size,
        })
    }

    /// Path this device was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RawDevice for FileDevice {
    fn size(&self) -> u64 {
        self.size
    }

    fn block_size(&self) -> u32 {
        self.sector_size
    }

    fn read(&self, offset: u64, length: usize) -> RawResult<Bytes> {
        let mut buf = vec![0u8; length];
        let mut done = 0usize;
        while done < length {
            match self.file.read_at(&mut buf[done..], offset + done as u64) {
                Ok(0) => return Err(RawError::ShortRead { got: done }),
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.raw_os_error() == Some(libc::EIO) => {
                    return Err(RawError::Medium {
                        offset,
                        length: length as u64,
                    })
                }
                Err(e) if e.raw_os_error() == Some(libc::ENODEV) => return Err(RawError::Closed),
                Err(e) => return Err(RawError::Other(e)),
            }
        }
        Ok(Bytes::from(buf))
    }
}

fn is_block_device(metadata: &Metadata) -> bool {
    use std::os::unix::fs::FileTypeExt;
    metadata.file_type().is_block_device()
}

fn device_size(file: &File, metadata: &Metadata) -> io::Result<u64> {
    if is_block_device(metadata) {
        block_device_size(file)
    } else {
        Ok(metadata.len())
    }
}

#[cfg(target_os = "linux")]
fn block_device_size(file: &File) -> io::Result<u64> {
    use std::os::unix::io::AsRawFd;

    // BLKGETSIZE64 from <linux/fs.h>
    const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

    let mut size: u64 = 0;
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(size)
}

#[cfg(not(target_os = "linux"))]
fn block_device_size(file: &File) -> io::Result<u64> {
    use std::io::{Seek, SeekFrom};
    let mut f = file;
    f.seek(SeekFrom::End(0))
}

#[cfg(target_os = "linux")]
fn sector_size(file: &File, metadata: &Metadata, path: &Path) -> u32 {
    use std::os::unix::io::AsRawFd;

    // BLKSSZGET from <linux/fs.h>
    const BLKSSZGET: libc::c_ulong = 0x1268;

    if is_block_device(metadata) {
        let mut size: libc::c_int = 0;
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKSSZGET, &mut size) };
        if ret == 0 && size > 0 {
            return size as u32;
        }
        return fallback_sector_size(path);
    }
    512
}

#[cfg(not(target_os = "linux"))]
fn sector_size(_file: &File, metadata: &Metadata, path: &Path) -> u32 {
    if is_block_device(metadata) {
        fallback_sector_size(path)
    } else {
        512
    }
}

/// Optical drives commonly use 2048-byte sectors; everything else 512.
fn fallback_sector_size(path: &Path) -> u32 {
    let name = path.to_string_lossy();
    if name.contains("sr") || name.contains("cd") {
        2048
    } else {
        512
    }
}

// ── in-memory device ──────────────────────────────────────────────────────

/// In-memory [`RawDevice`] with scriptable faults.
///
/// Bad ranges return [`RawError::Medium`] for any read that touches
/// them; every call (including failures) is counted and logged so tests
/// can assert how often the medium was touched.
pub struct MemDevice {
    data: Vec<u8>,
    sector_size: u32,
    bad: Mutex<Vec<(u64, u64)>>,
    reads: AtomicU64,
    read_log: Mutex<Vec<(u64, usize)>>,
    closed: AtomicBool,
}

impl MemDevice {
    /// Wrap `data` as a device with the given sector size.
    pub fn new(data: Vec<u8>, sector_size: u32) -> Self {
        assert!(sector_size.is_power_of_two() && sector_size >= 512);
        assert_eq!(data.len() as u64 % u64::from(sector_size), 0);
        Self {
            data,
            sector_size,
            bad: Mutex::new(Vec::new()),
            reads: AtomicU64::new(0),
            read_log: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Mark `[offset, offset + length)` as unreadable.
    pub fn mark_bad(&self, offset: u64, length: u64) {
        self.bad.lock().push((offset, offset + length));
    }

    /// Clear all bad ranges (the medium "recovered").
    pub fn clear_bad(&self) {
        self.bad.lock().clear();
    }

    /// Simulate the device disappearing mid-session.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Number of read calls issued so far, including failed ones.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Every `(offset, length)` read call issued so far.
    pub fn read_log(&self) -> Vec<(u64, usize)> {
        self.read_log.lock().clone()
    }
}

impl RawDevice for MemDevice {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn block_size(&self) -> u32 {
        self.sector_size
    }

    fn read(&self, offset: u64, length: usize) -> RawResult<Bytes> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.read_log.lock().push((offset, length));

        if self.closed.load(Ordering::SeqCst) {
            return Err(RawError::Closed);
        }

        let end = offset + length as u64;
        if end > self.size() {
            return Err(RawError::Other(io::Error::new(
                io::ErrorKind::InvalidInput,
                "read past end of device",
            )));
        }

        let faulted = self
            .bad
            .lock()
            .iter()
            .any(|&(lo, hi)| lo < end && offset < hi);
        if faulted {
            return Err(RawError::Medium {
                offset,
                length: length as u64,
            });
        }

        Ok(Bytes::copy_from_slice(
            &self.data[offset as usize..end as usize],
        ))
    }
}
