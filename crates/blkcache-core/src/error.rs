//! Error types for the cache engine.

use std::path::PathBuf;

use thiserror::Error;

use blkcache_map::MapError;

/// Result type for cache engine operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Error variants surfaced by the cache engine.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Request extends past the end of the device. No state changed.
    #[error("offset {offset} + length {length} exceeds device size {size}")]
    OutOfRange {
        /// Requested start offset in bytes.
        offset: u64,
        /// Requested length in bytes.
        length: u64,
        /// Device size in bytes.
        size: u64,
    },

    /// The range covers bad sectors and the session policy is to fail
    /// rather than substitute a placeholder.
    #[error("data unavailable: {length} bytes at offset {offset} cover bad sectors")]
    DataUnavailable {
        /// First byte of the failed range.
        offset: u64,
        /// Length of the failed range in bytes.
        length: u64,
    },

    /// The mapfile could not be parsed or does not match the device.
    #[error("mapfile corrupt: {0}")]
    MapFileCorrupt(#[from] MapError),

    /// The pre-existing cache image is smaller than the device.
    #[error("cache image is {actual} bytes, device needs {expected}")]
    CacheSizeMismatch {
        /// Required image size (device size) in bytes.
        expected: u64,
        /// Size of the image found on disk.
        actual: u64,
    },

    /// Another engine instance holds the session lock.
    #[error("cache already in use: {0}")]
    AlreadyInUse(PathBuf),

    /// The underlying device went away mid-session; the engine refuses
    /// further reads until reopened.
    #[error("device is gone")]
    DeviceGone,

    /// The engine configuration is invalid for this device.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Any other I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
