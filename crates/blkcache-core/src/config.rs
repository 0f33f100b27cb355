//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};
use crate::{DEFAULT_BLOCK_SIZE, DEFAULT_MAX_PHYS_READ_BLOCKS};

/// What `read` returns for blocks whose physical read failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BadSectorPolicy {
    /// Serve `block_size` zero bytes per bad block (default).
    #[default]
    Zeros,
    /// Fail the whole `read` call with `DataUnavailable`.
    Error,
}

/// Tunables fixed at engine construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Cache block size in bytes. Power of two, a multiple of the
    /// device's sector size.
    pub block_size: u32,
    /// Upper bound on a single physical read, in cache blocks.
    pub max_phys_read_blocks: u32,
    /// Placeholder policy for bad sectors.
    pub bad_sector_policy: BadSectorPolicy,
    /// Re-issue physical reads for blocks previously marked bad.
    pub retry_bad: bool,
    /// Checkpoint the status map after this many newly-cached bytes.
    pub checkpoint_bytes: u64,
    /// Checkpoint the status map after this much elapsed time,
    /// whichever of the two triggers first.
    pub checkpoint_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            max_phys_read_blocks: DEFAULT_MAX_PHYS_READ_BLOCKS,
            bad_sector_policy: BadSectorPolicy::Zeros,
            retry_bad: false,
            checkpoint_bytes: 1024 * 1024,
            checkpoint_interval: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    /// Validate against the device's sector size.
    pub fn validate(&self, sector_size: u32) -> CacheResult<()> {
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(CacheError::InvalidConfig(format!(
                "block_size {} is not a power of two",
                self.block_size
            )));
        }
        if sector_size == 0 || self.block_size % sector_size != 0 {
            return Err(CacheError::InvalidConfig(format!(
                "block_size {} is not a multiple of sector size {}",
                self.block_size, sector_size
            )));
        }
        if self.max_phys_read_blocks == 0 {
            return Err(CacheError::InvalidConfig(
                "max_phys_read_blocks must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.block_size, 4096);
        assert_eq!(config.max_phys_read_blocks, 256);
        assert_eq!(config.bad_sector_policy, BadSectorPolicy::Zeros);
        assert!(!config.retry_bad);
        assert_eq!(config.checkpoint_bytes, 1024 * 1024);
        assert_eq!(config.checkpoint_interval, Duration::from_secs(5));
        config.validate(512).unwrap();
    }

    #[test]
    fn test_rejects_non_power_of_two_block_size() {
        let config = EngineConfig {
            block_size: 3000,
            ..Default::default()
        };
        assert!(config.validate(512).is_err());
    }

    #[test]
    fn test_rejects_block_size_below_sector_size() {
        let config = EngineConfig {
            block_size: 512,
            ..Default::default()
        };
        assert!(config.validate(2048).is_err());
    }

    #[test]
    fn test_accepts_block_size_equal_to_sector_size() {
        let config = EngineConfig {
            block_size: 2048,
            ..Default::default()
        };
        config.validate(2048).unwrap();
    }
}
