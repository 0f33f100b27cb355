//! The cache engine façade.
//!
//! Binds the status map, the cache image, and the raw device behind the
//! one externally facing data path, `read`. A single mutex protects the
//! map, the image, and the in-flight table; physical reads run outside
//! it. Concurrent readers of the same unread range coalesce onto one
//! physical read through the in-flight table (per-range completion
//! signals), so the medium is touched at most once per block per
//! session.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use blkcache_map::{BlockStatus, StatusMap};

use crate::cache_file::CacheFile;
use crate::config::{BadSectorPolicy, EngineConfig};
use crate::device::{RawDevice, RawError};
use crate::error::{CacheError, CacheResult};
use crate::persist::{self, SessionLock};
use crate::planner::{self, BlockRange, PlanStep, ReadPlan};

/// Session counters, exposed for progress reporting.
#[derive(Debug, Default)]
pub struct EngineStats {
    /// `read` calls accepted.
    pub read_calls: AtomicU64,
    /// Bytes served out of the cache image.
    pub bytes_from_cache: AtomicU64,
    /// Bytes newly cached from the device.
    pub bytes_from_device: AtomicU64,
    /// Physical read calls issued, including sub-split probes.
    pub physical_reads: AtomicU64,
    /// Medium errors observed.
    pub medium_errors: AtomicU64,
    /// Status map checkpoints written.
    pub checkpoints: AtomicU64,
}

/// Completion signal for one in-flight physical read.
struct Flight {
    done: Mutex<bool>,
    cv: Condvar,
}

impl Flight {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cv.wait(&mut done);
        }
    }

    fn complete(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.cv.notify_all();
    }
}

struct InFlight {
    range: BlockRange,
    flight: Arc<Flight>,
}

/// Mutable engine state, all behind the one mutex.
struct EngineState {
    map: StatusMap,
    cache: CacheFile,
    in_flight: Vec<InFlight>,
    device_gone: bool,
    closed: bool,
    bytes_since_checkpoint: u64,
    last_checkpoint: Instant,
}

/// Outcome of one physical fetch: contiguous sector spans that either
/// produced bytes or failed with a medium error.
enum Segment {
    Good { offset: u64, bytes: Bytes },
    Bad { offset: u64, length: u64 },
}

/// Read-through block cache over a [`RawDevice`].
pub struct CacheEngine {
    raw: Mutex<Box<dyn RawDevice>>,
    state: Mutex<EngineState>,
    lock: Mutex<Option<SessionLock>>,
    stats: EngineStats,
    config: EngineConfig,
    map_path: PathBuf,
    device_size: u64,
    sector_size: u32,
}

impl CacheEngine {
    /// Open a caching session for `raw`, backed by the image at
    /// `cache_path` and the mapfile at `map_path`.
    pub fn open(
        raw: impl RawDevice + 'static,
        cache_path: impl AsRef<Path>,
        map_path: impl AsRef<Path>,
        config: EngineConfig,
    ) -> CacheResult<Self> {
        let device_size = raw.size();
        let sector_size = raw.block_size();

        if device_size == 0 {
            return Err(CacheError::InvalidConfig("device is empty".into()));
        }
        if device_size % u64::from(sector_size) != 0 {
            return Err(CacheError::InvalidConfig(format!(
                "device size {device_size} is not a multiple of its sector size {sector_size}"
            )));
        }
        config.validate(sector_size)?;

        let map_path = map_path.as_ref().to_path_buf();
        let lock = SessionLock::acquire(&map_path)?;

        let mut map = blkcache_map::load(&map_path, device_size)?;
        if let Some(prev) = map.metadata.get("block_size") {
            if prev != &config.block_size.to_string() {
                warn!(
                    mapfile_block_size = %prev,
                    configured = config.block_size,
                    "block size differs from the one recorded in the mapfile"
                );
            }
        }
        map.metadata
            .insert("device_size".into(), device_size.to_string());
        map.metadata
            .insert("block_size".into(), config.block_size.to_string());
        map.metadata
            .entry("format_version".into())
            .or_insert_with(|| "1.0".into());

        // A mapfile that vouches for cached bytes is useless without the
        // image those bytes live in.
        if map.cached_bytes() > 0 && !cache_path.as_ref().exists() {
            return Err(CacheError::CacheSizeMismatch {
                expected: device_size,
                actual: 0,
            });
        }

        let cache = CacheFile::open(cache_path, device_size, sector_size)?;

        info!(
            device_size,
            sector_size,
            block_size = config.block_size,
            cached = map.cached_bytes(),
            "opened cache engine"
        );

        Ok(Self {
            raw: Mutex::new(Box::new(raw)),
            state: Mutex::new(EngineState {
                map,
                cache,
                in_flight: Vec::new(),
                device_gone: false,
                closed: false,
                bytes_since_checkpoint: 0,
                last_checkpoint: Instant::now(),
            }),
            lock: Mutex::new(Some(lock)),
            stats: EngineStats::default(),
            config,
            map_path,
            device_size,
            sector_size,
        })
    }

    /// Device capacity in bytes.
    pub fn size(&self) -> u64 {
        self.device_size
    }

    /// Cache block size in bytes.
    pub fn block_size(&self) -> u32 {
        self.config.block_size
    }

    /// Session counters.
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Snapshot of the current status map.
    pub fn map_snapshot(&self) -> StatusMap {
        self.state.lock().map.clone()
    }

    /// Read `length` bytes at `offset`, caching whatever the device had
    /// to be asked for along the way.
    pub fn read(&self, offset: u64, length: usize) -> CacheResult<Bytes> {
        let len = length as u64;
        if offset.checked_add(len).map_or(true, |end| end > self.device_size) {
            return Err(CacheError::OutOfRange {
                offset,
                length: len,
                size: self.device_size,
            });
        }
        self.stats.read_calls.fetch_add(1, Ordering::Relaxed);
        if length == 0 {
            return Ok(Bytes::new());
        }

        // Ranges already fetched by this call. Once a range comes back
        // still bad, further retries this call would spin forever.
        let mut attempted: Vec<BlockRange> = Vec::new();
        let mut retry_bad = self.config.retry_bad;
        let no_retry = EngineConfig {
            retry_bad: false,
            ..self.config.clone()
        };

        loop {
            let mut state = self.state.lock();
            if state.closed || state.device_gone {
                return Err(CacheError::DeviceGone);
            }

            let active = if retry_bad { &self.config } else { &no_retry };
            let mut plan = planner::plan_read(offset, len, &state.map, active);
            if retry_bad {
                if let Some(fetch) = plan.first_fetch() {
                    if attempted.iter().any(|a| a.intersects(&fetch)) {
                        retry_bad = false;
                        plan = planner::plan_read(offset, len, &state.map, &no_retry);
                    }
                }
            }

            let Some(fetch) = plan.first_fetch() else {
                return self.assemble(&mut state, &plan);
            };

            if let Some(flight) = state
                .in_flight
                .iter()
                .find(|e| e.range.intersects(&fetch))
                .map(|e| e.flight.clone())
            {
                // Someone else is already reading an overlapping range;
                // wait for it and re-plan against the new map.
                drop(state);
                flight.wait();
                continue;
            }

            let flight = Arc::new(Flight::new());
            state.in_flight.push(InFlight {
                range: fetch,
                flight: flight.clone(),
            });
            drop(state);

            attempted.push(fetch);
            let outcome = self.fetch(fetch);

            let mut state = self.state.lock();
            let committed = match outcome {
                Ok(segments) => self.commit(&mut state, &segments),
                Err(err) => {
                    if matches!(err, CacheError::DeviceGone) {
                        state.device_gone = true;
                    }
                    Err(err)
                }
            };
            state.in_flight.retain(|e| !Arc::ptr_eq(&e.flight, &flight));
            drop(state);
            flight.complete();
            committed?;
        }
    }

    /// Force a status map checkpoint and a cache image sync.
    pub fn flush(&self) -> CacheResult<()> {
        let mut state = self.state.lock();
        self.checkpoint_locked(&mut state)
    }

    /// Flush and release the session. Idempotent.
    pub fn close(&self) -> CacheResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        self.checkpoint_locked(&mut state)?;
        state.closed = true;
        drop(state);
        *self.lock.lock() = None;
        info!("closed cache engine");
        Ok(())
    }

    /// Issue the physical read for `range`, isolating bad sectors with
    /// the sub-split descent when the medium reports an error.
    fn fetch(&self, range: BlockRange) -> CacheResult<Vec<Segment>> {
        let start = range.byte_start(self.config.block_size);
        let end = range
            .byte_end(self.config.block_size)
            .min(self.device_size);
        let length = (end - start) as usize;

        let raw = self.raw.lock();
        self.stats.physical_reads.fetch_add(1, Ordering::Relaxed);
        match raw.read(start, length) {
            Ok(bytes) => Ok(vec![Segment::Good {
                offset: start,
                bytes,
            }]),
            Err(RawError::Medium { .. }) => {
                self.stats.medium_errors.fetch_add(1, Ordering::Relaxed);
                warn!(offset = start, length, "medium error, isolating bad sectors");
                let d = u64::from(self.sector_size);
                let mut segments = Vec::new();
                self.subsplit(&**raw, (start / d, end / d), &mut segments)?;
                Ok(segments)
            }
            Err(err) => Err(map_raw_error(err)),
        }
    }

    /// Recursive halving over a failed sector range; small ranges are
    /// probed sector by sector. One half-step is never interrupted.
    fn subsplit(
        &self,
        raw: &dyn RawDevice,
        sectors: (u64, u64),
        out: &mut Vec<Segment>,
    ) -> CacheResult<()> {
        const LINEAR_PROBE_SECTORS: u64 = 4;

        let d = u64::from(self.sector_size);
        let (lo, hi) = sectors;

        if hi - lo <= LINEAR_PROBE_SECTORS {
            for sector in lo..hi {
                let offset = sector * d;
                self.stats.physical_reads.fetch_add(1, Ordering::Relaxed);
                match raw.read(offset, d as usize) {
                    Ok(bytes) => out.push(Segment::Good { offset, bytes }),
                    Err(RawError::Medium { .. }) => {
                        self.stats.medium_errors.fetch_add(1, Ordering::Relaxed);
                        out.push(Segment::Bad { offset, length: d });
                    }
                    Err(err) => return Err(map_raw_error(err)),
                }
            }
            return Ok(());
        }

        let Some((first, second)) = planner::halve((lo, hi)) else {
            return Ok(());
        };
        for half in [first, second] {
            let offset = half.0 * d;
            let length = ((half.1 - half.0) * d) as usize;
            self.stats.physical_reads.fetch_add(1, Ordering::Relaxed);
            match raw.read(offset, length) {
                Ok(bytes) => out.push(Segment::Good { offset, bytes }),
                Err(RawError::Medium { .. }) => {
                    self.stats.medium_errors.fetch_add(1, Ordering::Relaxed);
                    self.subsplit(raw, half, out)?;
                }
                Err(err) => return Err(map_raw_error(err)),
            }
        }
        Ok(())
    }

    /// Record a fetch outcome: bytes into the image, statuses into the
    /// map, then checkpoint when the policy says so.
    fn commit(&self, state: &mut EngineState, segments: &[Segment]) -> CacheResult<()> {
        let mut newly_cached = 0u64;
        let mut attempted_end = 0u64;

        for segment in segments {
            match segment {
                Segment::Good { offset, bytes } => {
                    let end = offset + bytes.len() as u64;
                    state.cache.write(*offset, bytes)?;
                    state.map.set(*offset, end, BlockStatus::Finished);
                    newly_cached += bytes.len() as u64;
                    attempted_end = attempted_end.max(end);
                }
                Segment::Bad { offset, length } => {
                    let end = offset + length;
                    state.map.set(*offset, end, BlockStatus::BadSector);
                    attempted_end = attempted_end.max(end);
                }
            }
        }

        state.map.note_attempt(attempted_end);
        state.bytes_since_checkpoint += newly_cached;
        self.stats
            .bytes_from_device
            .fetch_add(newly_cached, Ordering::Relaxed);

        if state.bytes_since_checkpoint >= self.config.checkpoint_bytes
            || state.last_checkpoint.elapsed() >= self.config.checkpoint_interval
        {
            self.checkpoint_locked(state)?;
        }
        Ok(())
    }

    /// Serve a fully materialised plan out of the image.
    fn assemble(&self, state: &mut EngineState, plan: &ReadPlan) -> CacheResult<Bytes> {
        let bs = self.config.block_size;
        let mut buf = BytesMut::new();

        for step in &plan.steps {
            let range = step.range();
            let start = range.byte_start(bs);
            let end = range.byte_end(bs).min(self.device_size);
            let step_len = end - start;

            match step {
                PlanStep::Copy(_) => {
                    buf.extend_from_slice(&state.cache.read(start, step_len)?);
                    self.stats
                        .bytes_from_cache
                        .fetch_add(step_len, Ordering::Relaxed);
                }
                PlanStep::Placeholder(_) => match self.config.bad_sector_policy {
                    BadSectorPolicy::Zeros => {
                        buf.resize(buf.len() + step_len as usize, 0);
                    }
                    BadSectorPolicy::Error => {
                        debug!(offset = start, length = step_len, "bad sectors, failing read");
                        return Err(CacheError::DataUnavailable {
                            offset: start,
                            length: step_len,
                        });
                    }
                },
                PlanStep::Fetch(_) => {
                    // assemble only runs on plans with no fetch steps
                    return Err(CacheError::Io(io::Error::other(
                        "plan not fully materialised",
                    )));
                }
            }
        }

        let out = buf.freeze();
        Ok(out.slice(plan.skip..plan.skip + plan.take))
    }

    fn checkpoint_locked(&self, state: &mut EngineState) -> CacheResult<()> {
        // Image first: a Finished record in the mapfile must never point
        // at bytes that were not yet durable.
        state.cache.sync()?;
        persist::checkpoint(&state.map, &self.map_path)?;
        state.bytes_since_checkpoint = 0;
        state.last_checkpoint = Instant::now();
        self.stats.checkpoints.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for CacheEngine {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn map_raw_error(err: RawError) -> CacheError {
    match err {
        RawError::Closed => CacheError::DeviceGone,
        RawError::ShortRead { got } => CacheError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("device returned {got} bytes"),
        )),
        RawError::Other(e) => CacheError::Io(e),
        RawError::Medium { offset, length } => CacheError::Io(io::Error::other(format!(
            "unrecovered medium error: {length} bytes at {offset}"
        ))),
    }
}
