//! ddrescue-compatible mapfile model.
//!
//! This crate holds the data side of blkcache: the ddrescue status
//! alphabet, the run-length [`StatusMap`] that tracks per-byte status
//! across a device, and the mapfile text format. It performs no device
//! or cache I/O; the engine in `blkcache-core` drives it.

pub mod map;
pub mod mapfile;
pub mod status;

pub use map::{StatusMap, StatusRun};
pub use mapfile::{load, parse, save, to_string, MapError, MapResult};
pub use status::{BlockStatus, CurrentStatus, StatusKind};
