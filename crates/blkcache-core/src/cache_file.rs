//! Sparse on-disk image of the device, memory-mapped.
//!
//! The image holds cached sector bytes at their natural offsets. It has
//! no header: byte `b * block_size` of the file is byte `b * block_size`
//! of the medium. Status interpretation is the planner's job; this layer
//! only moves aligned byte ranges in and out of the mapping. The I/O
//! granularity is the device sector size: the ordinary read path moves
//! whole cache blocks, but sub-split commits individual surviving
//! sectors after a medium error.
//!
//! Durability: writes land in the mapping and get an async msync over
//! the dirty span; the dirty spans are remembered and force-synced
//! (msync SYNC) at checkpoint time via [`CacheFile::sync`].

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use memmap2::{MmapMut, MmapOptions};
use tracing::debug;

use crate::error::{CacheError, CacheResult};

/// Sparse, block-aligned backing store of cached sector bytes.
pub struct CacheFile {
    file: std::fs::File,
    map: MmapMut,
    path: PathBuf,
    size: u64,
    align: u32,
    /// Byte ranges written since the last sync, sorted and disjoint.
    dirty: Vec<(u64, u64)>,
}

impl CacheFile {
    /// Open (or create) the image at `path` for a device of `size` bytes.
    ///
    /// A pre-existing image shorter than the device is refused with
    /// [`CacheError::CacheSizeMismatch`]; a fresh file is extended to the
    /// device size as a sparse hole.
    pub fn open(path: impl AsRef<Path>, size: u64, align: u32) -> CacheResult<Self> {
        let path = path.as_ref().to_path_buf();
        let pre_existing = path.exists();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let len = file.metadata()?.len();
        if pre_existing && len != 0 && len < size {
            return Err(CacheError::CacheSizeMismatch {
                expected: size,
                actual: len,
            });
        }
        if len < size {
            file.set_len(size)?;
        }

        let map = unsafe { MmapOptions::new().len(size as usize).map_mut(&file)? };

        debug!(
            path = %path.display(),
            size,
            pre_existing,
            "opened cache image"
        );

        Ok(Self {
            file,
            map,
            path,
            size,
            align,
            dirty: Vec::new(),
        })
    }

    /// Image size in bytes (equals the device size).
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_aligned(&self, offset: u64, length: u64) -> CacheResult<()> {
        let unit = u64::from(self.align);
        let end = offset.checked_add(length).unwrap_or(u64::MAX);
        // A short tail is fine when the device itself ends mid-unit.
        let tail_ok = length % unit == 0 || end == self.size;
        if offset % unit != 0 || length == 0 || !tail_ok {
            return Err(CacheError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unaligned cache access: {length} bytes at {offset}"),
            )));
        }
        if end > self.size {
            return Err(CacheError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cache access past image end: {length} bytes at {offset}"),
            )));
        }
        Ok(())
    }

    /// Copy `length` bytes at `offset` out of the image.
    ///
    /// Callers verify status first; bytes of non-cached blocks are
    /// whatever the sparse file holds.
    pub fn read(&self, offset: u64, length: u64) -> CacheResult<Bytes> {
        self.check_aligned(offset, length)?;
        let start = offset as usize;
        let end = (offset + length) as usize;
        Ok(Bytes::copy_from_slice(&self.map[start..end]))
    }

    /// Write `data` (a positive multiple of the alignment unit) at `offset`.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> CacheResult<()> {
        self.check_aligned(offset, data.len() as u64)?;
        let start = offset as usize;
        self.map[start..start + data.len()].copy_from_slice(data);
        self.map.flush_async_range(start, data.len())?;
        self.note_dirty(offset, offset + data.len() as u64);
        Ok(())
    }

    /// Force every dirty range to stable storage.
    pub fn sync(&mut self) -> io::Result<()> {
        let dirty = std::mem::take(&mut self.dirty);
        for &(start, end) in &dirty {
            self.map.flush_range(start as usize, (end - start) as usize)?;
        }
        if !dirty.is_empty() {
            debug!(ranges = dirty.len(), path = %self.path.display(), "synced cache image");
        }
        Ok(())
    }

    /// Bytes currently awaiting a sync.
    pub fn dirty_bytes(&self) -> u64 {
        self.dirty.iter().map(|&(s, e)| e - s).sum()
    }

    fn note_dirty(&mut self, start: u64, end: u64) {
        // Insert keeping the list sorted, then swallow every range the
        // new one touches.
        let idx = self.dirty.partition_point(|&(s, _)| s < start);
        self.dirty.insert(idx, (start, end));

        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(self.dirty.len());
        for &(s, e) in &self.dirty {
            match merged.last_mut() {
                Some((_, last_end)) if s <= *last_end => *last_end = (*last_end).max(e),
                _ => merged.push((s, e)),
            }
        }
        self.dirty = merged;
    }
}

impl Drop for CacheFile {
    fn drop(&mut self) {
        let _ = self.sync();
        let _ = self.file.sync_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_sparse_and_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.img");

        let mut cache = CacheFile::open(&path, 16384, 4096).unwrap();
        assert_eq!(cache.size(), 16384);

        cache.write(4096, &[0x5au8; 4096]).unwrap();
        let bytes = cache.read(4096, 4096).unwrap();
        assert!(bytes.iter().all(|&b| b == 0x5a));

        // untouched blocks read back as the sparse hole
        let hole = cache.read(8192, 4096).unwrap();
        assert!(hole.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_reopen_preserves_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.img");

        {
            let mut cache = CacheFile::open(&path, 8192, 4096).unwrap();
            cache.write(0, &[0x11u8; 4096]).unwrap();
            cache.sync().unwrap();
        }
        {
            let cache = CacheFile::open(&path, 8192, 4096).unwrap();
            let bytes = cache.read(0, 4096).unwrap();
            assert!(bytes.iter().all(|&b| b == 0x11));
        }
    }

    #[test]
    fn test_shorter_existing_image_is_refused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.img");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();

        match CacheFile::open(&path, 16384, 4096) {
            Err(CacheError::CacheSizeMismatch { expected, actual }) => {
                assert_eq!(expected, 16384);
                assert_eq!(actual, 4096);
            }
            other => panic!("expected size mismatch, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_unaligned_access_is_refused() {
        let dir = tempdir().unwrap();
        let mut cache = CacheFile::open(dir.path().join("c.img"), 8192, 4096).unwrap();

        assert!(cache.read(100, 4096).is_err());
        assert!(cache.read(0, 100).is_err());
        assert!(cache.write(0, &[0u8; 100]).is_err());
        assert!(cache.write(4096, &[0u8; 8192]).is_err());
    }

    #[test]
    fn test_short_tail_block_is_accepted() {
        let dir = tempdir().unwrap();
        let mut cache = CacheFile::open(dir.path().join("c.img"), 6144, 4096).unwrap();

        cache.write(4096, &[9u8; 2048]).unwrap();
        let bytes = cache.read(4096, 2048).unwrap();
        assert!(bytes.iter().all(|&b| b == 9));
    }

    #[test]
    fn test_dirty_ranges_coalesce() {
        let dir = tempdir().unwrap();
        let mut cache = CacheFile::open(dir.path().join("c.img"), 65536, 4096).unwrap();

        cache.write(0, &[1u8; 4096]).unwrap();
        cache.write(4096, &[2u8; 4096]).unwrap();
        cache.write(16384, &[3u8; 4096]).unwrap();
        assert_eq!(cache.dirty_bytes(), 12288);
        assert_eq!(cache.dirty.len(), 2);

        cache.sync().unwrap();
        assert_eq!(cache.dirty_bytes(), 0);
    }
}
