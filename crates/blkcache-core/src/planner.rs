//! Read planning: byte range → ordered sub-operations.
//!
//! A byte request is quantised to cache blocks (head partial, middle
//! run, tail partial), each block is classified against the status map,
//! and adjacent blocks with the same disposition are merged into steps.
//! Partial blocks are materialised at block granularity and sliced
//! afterwards, so the bad-sector placeholder always applies to whole
//! blocks while the returned bytes are exact.

use blkcache_map::{StatusKind, StatusMap};

use crate::config::EngineConfig;

/// Half-open range of cache block indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    /// First block of the range.
    pub start: u64,
    /// One past the last block of the range.
    pub end: u64,
}

impl BlockRange {
    /// Number of blocks covered.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// True when no blocks are covered.
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// True when the ranges share at least one block.
    pub fn intersects(&self, other: &BlockRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// First byte of the range.
    pub fn byte_start(&self, block_size: u32) -> u64 {
        self.start * u64::from(block_size)
    }

    /// One past the last byte of the range.
    pub fn byte_end(&self, block_size: u32) -> u64 {
        self.end * u64::from(block_size)
    }

    /// Length in bytes.
    pub fn byte_len(&self, block_size: u32) -> u64 {
        self.len() * u64::from(block_size)
    }
}

/// One sub-operation of a read plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanStep {
    /// Copy the blocks out of the cache image.
    Copy(BlockRange),
    /// Issue a physical read for the blocks, then cache the result.
    Fetch(BlockRange),
    /// Serve the blocks per the bad-sector policy.
    Placeholder(BlockRange),
}

impl PlanStep {
    /// The block range this step covers.
    pub fn range(&self) -> BlockRange {
        match self {
            Self::Copy(r) | Self::Fetch(r) | Self::Placeholder(r) => *r,
        }
    }
}

/// Ordered decomposition of one byte request.
#[derive(Debug)]
pub struct ReadPlan {
    /// Steps covering the materialised block span, in block order.
    pub steps: Vec<PlanStep>,
    /// Block span the steps cover.
    pub span: BlockRange,
    /// Bytes to drop from the front of the materialised span.
    pub skip: usize,
    /// Bytes to return after the skip.
    pub take: usize,
}

impl ReadPlan {
    /// True when at least one step needs the physical device.
    pub fn needs_device(&self) -> bool {
        self.steps
            .iter()
            .any(|s| matches!(s, PlanStep::Fetch(_)))
    }

    /// The first range needing a physical read, if any.
    pub fn first_fetch(&self) -> Option<BlockRange> {
        self.steps.iter().find_map(|s| match s {
            PlanStep::Fetch(r) => Some(*r),
            _ => None,
        })
    }
}

/// Per-block disposition, ordered so that the "worst" status inside a
/// block decides the whole block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Copy,
    Fetch,
    Placeholder,
}

fn classify(map: &StatusMap, block: u64, config: &EngineConfig) -> Disposition {
    let bs = u64::from(config.block_size);
    let start = block * bs;
    let end = (start + bs).min(map.size());

    let mut unread = false;
    let mut bad = false;
    for run in map.runs(start, end) {
        match run.status.kind() {
            StatusKind::Cached => {}
            StatusKind::Unread => unread = true,
            StatusKind::Bad | StatusKind::Retryable => bad = true,
        }
    }

    if bad {
        // Known-bad sectors are never re-touched unless the session opts
        // into retries; the whole enclosing block takes the placeholder.
        if config.retry_bad {
            Disposition::Fetch
        } else {
            Disposition::Placeholder
        }
    } else if unread {
        Disposition::Fetch
    } else {
        Disposition::Copy
    }
}

/// Build the plan for `length` bytes at `offset`.
///
/// `offset + length` must not exceed the map's size; the engine checks
/// bounds before planning.
pub fn plan_read(offset: u64, length: u64, map: &StatusMap, config: &EngineConfig) -> ReadPlan {
    let bs = u64::from(config.block_size);
    if length == 0 {
        let block = offset / bs;
        return ReadPlan {
            steps: Vec::new(),
            span: BlockRange {
                start: block,
                end: block,
            },
            skip: 0,
            take: 0,
        };
    }

    let first = offset / bs;
    let last = (offset + length - 1) / bs;
    let span = BlockRange {
        start: first,
        end: last + 1,
    };

    let mut steps: Vec<PlanStep> = Vec::new();
    for block in span.start..span.end {
        let disposition = classify(map, block, config);
        let merged = match (steps.last_mut(), disposition) {
            (Some(PlanStep::Copy(r)), Disposition::Copy)
            | (Some(PlanStep::Placeholder(r)), Disposition::Placeholder)
                if r.end == block =>
            {
                r.end = block + 1;
                true
            }
            (Some(PlanStep::Fetch(r)), Disposition::Fetch)
                if r.end == block && r.len() < u64::from(config.max_phys_read_blocks) =>
            {
                r.end = block + 1;
                true
            }
            _ => false,
        };
        if !merged {
            let range = BlockRange {
                start: block,
                end: block + 1,
            };
            steps.push(match disposition {
                Disposition::Copy => PlanStep::Copy(range),
                Disposition::Fetch => PlanStep::Fetch(range),
                Disposition::Placeholder => PlanStep::Placeholder(range),
            });
        }
    }

    ReadPlan {
        steps,
        span,
        skip: (offset - span.byte_start(config.block_size)) as usize,
        take: length as usize,
    }
}

/// Halve a failed sector range for the sub-split descent.
///
/// Returns `None` when the range is a single sector and cannot split
/// further. The halves are sector ranges, non-empty, and cover the
/// input exactly.
pub fn halve(range: (u64, u64)) -> Option<((u64, u64), (u64, u64))> {
    let (start, end) = range;
    if end - start <= 1 {
        return None;
    }
    let mid = start + (end - start) / 2;
    Some(((start, mid), (mid, end)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use blkcache_map::BlockStatus;

    fn config() -> EngineConfig {
        EngineConfig::default()
    }

    fn range(start: u64, end: u64) -> BlockRange {
        BlockRange { start, end }
    }

    #[test]
    fn test_fresh_map_is_one_fetch() {
        let map = StatusMap::new(16384);
        let plan = plan_read(0, 16384, &map, &config());
        assert_eq!(plan.steps, vec![PlanStep::Fetch(range(0, 4))]);
        assert_eq!(plan.skip, 0);
        assert_eq!(plan.take, 16384);
    }

    #[test]
    fn test_cached_map_is_one_copy() {
        let mut map = StatusMap::new(16384);
        map.set(0, 16384, BlockStatus::Finished);
        let plan = plan_read(0, 16384, &map, &config());
        assert_eq!(plan.steps, vec![PlanStep::Copy(range(0, 4))]);
        assert!(!plan.needs_device());
    }

    #[test]
    fn test_partial_blocks_materialise_whole_span() {
        let map = StatusMap::new(16384);
        let plan = plan_read(2048, 4096, &map, &config());
        // bytes 2048..6144 touch blocks 0 and 1
        assert_eq!(plan.span, range(0, 2));
        assert_eq!(plan.skip, 2048);
        assert_eq!(plan.take, 4096);
        assert_eq!(plan.steps, vec![PlanStep::Fetch(range(0, 2))]);
    }

    #[test]
    fn test_mixed_statuses_split_into_steps() {
        let mut map = StatusMap::new(16384);
        map.set(0, 4096, BlockStatus::Finished);
        map.set(4096, 8192, BlockStatus::BadSector);
        // blocks 2 and 3 stay untried
        let plan = plan_read(0, 16384, &map, &config());
        assert_eq!(
            plan.steps,
            vec![
                PlanStep::Copy(range(0, 1)),
                PlanStep::Placeholder(range(1, 2)),
                PlanStep::Fetch(range(2, 4)),
            ]
        );
        assert_eq!(plan.first_fetch(), Some(range(2, 4)));
    }

    #[test]
    fn test_retry_bad_refetches_bad_blocks() {
        let mut map = StatusMap::new(16384);
        map.set(0, 16384, BlockStatus::Finished);
        map.set(4096, 8192, BlockStatus::BadSector);
        let cfg = EngineConfig {
            retry_bad: true,
            ..config()
        };
        let plan = plan_read(0, 16384, &map, &cfg);
        assert_eq!(
            plan.steps,
            vec![
                PlanStep::Copy(range(0, 1)),
                PlanStep::Fetch(range(1, 2)),
                PlanStep::Copy(range(2, 4)),
            ]
        );
    }

    #[test]
    fn test_retryable_statuses_take_the_bad_path() {
        let mut map = StatusMap::new(16384);
        map.set(0, 4096, BlockStatus::NonScraped);
        map.set(4096, 8192, BlockStatus::NonTrimmed);
        map.set(8192, 12288, BlockStatus::NonSplit);
        map.set(12288, 16384, BlockStatus::Finished);
        let plan = plan_read(0, 16384, &map, &config());
        assert_eq!(
            plan.steps,
            vec![
                PlanStep::Placeholder(range(0, 3)),
                PlanStep::Copy(range(3, 4)),
            ]
        );
    }

    #[test]
    fn test_block_mixing_cached_and_unread_is_fetched() {
        // An externally written map can transition mid-block; the whole
        // block is re-fetched so the cache stays block-consistent.
        let mut map = StatusMap::new(8192);
        map.set(0, 512, BlockStatus::Finished);
        let plan = plan_read(0, 8192, &map, &config());
        assert_eq!(plan.steps, vec![PlanStep::Fetch(range(0, 2))]);
    }

    #[test]
    fn test_block_mixing_cached_and_bad_takes_placeholder() {
        let mut map = StatusMap::new(8192);
        map.set(0, 8192, BlockStatus::Finished);
        map.set(512, 1024, BlockStatus::BadSector);
        let plan = plan_read(0, 8192, &map, &config());
        assert_eq!(
            plan.steps,
            vec![
                PlanStep::Placeholder(range(0, 1)),
                PlanStep::Copy(range(1, 2)),
            ]
        );
    }

    #[test]
    fn test_fetch_capped_at_max_phys_read_blocks() {
        let cfg = EngineConfig {
            max_phys_read_blocks: 2,
            ..config()
        };
        let map = StatusMap::new(6 * 4096);
        let plan = plan_read(0, 6 * 4096, &map, &cfg);
        assert_eq!(
            plan.steps,
            vec![
                PlanStep::Fetch(range(0, 2)),
                PlanStep::Fetch(range(2, 4)),
                PlanStep::Fetch(range(4, 6)),
            ]
        );
    }

    #[test]
    fn test_empty_read_plans_nothing() {
        let map = StatusMap::new(8192);
        let plan = plan_read(4096, 0, &map, &config());
        assert!(plan.steps.is_empty());
        assert_eq!(plan.take, 0);
    }

    #[test]
    fn test_tail_block_short_of_device_end() {
        // device ends mid-block: the final block is smaller than
        // block_size and still classifies correctly
        let mut map = StatusMap::new(4096 + 2048);
        map.set(0, 4096, BlockStatus::Finished);
        let plan = plan_read(0, 6144, &map, &config());
        assert_eq!(
            plan.steps,
            vec![PlanStep::Copy(range(0, 1)), PlanStep::Fetch(range(1, 2))]
        );
    }

    #[test]
    fn test_halve_descends_to_single_sector() {
        assert_eq!(halve((0, 8)), Some(((0, 4), (4, 8))));
        assert_eq!(halve((3, 6)), Some(((3, 4), (4, 6))));
        assert_eq!(halve((5, 6)), None);
    }

    #[test]
    fn test_block_range_helpers() {
        let r = range(2, 5);
        assert_eq!(r.len(), 3);
        assert_eq!(r.byte_start(4096), 8192);
        assert_eq!(r.byte_end(4096), 20480);
        assert_eq!(r.byte_len(4096), 12288);
        assert!(r.intersects(&range(4, 9)));
        assert!(!r.intersects(&range(5, 9)));
    }
}
