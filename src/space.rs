//! State shared between the mutator and the collector threads.
//!
//! A [`Space`] owns the heap reservation and every metadata arena. It is
//! handed to the collector threads behind an `Arc`; the mutator-only parts
//! (bump cursors, roots, counters) live in [`crate::heap::Heap`].
use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Instant,
};

use crate::{
    block::{BlockFlag, BlockMeta, BlockState, FreeLineMeta, LineMeta},
    block_allocator::BlockAllocator,
    gc_thread::Control,
    globals::{
        BLOCK_SIZE, BLOCK_SIZE_BITS, GRANULES_IN_BLOCK, GRANULE_SIZE, GRANULE_SIZE_BITS,
        LARGE_BLOCK_SIZE, LARGE_BLOCK_SIZE_BITS, LINE_COUNT, LINE_SIZE_BITS, MAX_BLOCK_COUNT,
        MIN_HEAP_SIZE,
    },
    grey_packet::GreyPackets,
    internal::block_list::IndexList,
    large_allocator::{LargeAllocator, GRANULES_IN_CHUNK},
    mmap::{physical_memory, MetaArena, Mmap},
    object_meta::{GranuleMap, GranuleState},
    statistics::{GcEvent, Recorder},
    sweeper::SweepState,
    Config,
};

/// Heap growth thresholds, copied from [`Config`].
#[derive(Clone, Copy, Debug)]
pub struct GrowthPolicy {
    pub early_growth_threshold: usize,
    pub early_growth_rate: f64,
    pub growth_rate: f64,
    pub min_free_ratio: f64,
    pub max_unavailable_ratio: f64,
}

impl GrowthPolicy {
    fn from_config(config: &Config) -> Self {
        Self {
            early_growth_threshold: config.early_growth_threshold,
            early_growth_rate: config.early_growth_rate,
            growth_rate: config.growth_rate,
            min_free_ratio: config.min_free_ratio,
            max_unavailable_ratio: config.max_unavailable_ratio,
        }
    }

    /// Blocks to add after a sweep left `free` free and `recyclable`
    /// partially free blocks out of `count`. Zero when the heap is healthy.
    pub fn increment(&self, count: u32, free: u32, recyclable: u32) -> u32 {
        let total = count as f64;
        let unavailable = count.saturating_sub(free + recyclable) as f64;
        let exhausted = (free as f64) < total * self.min_free_ratio
            || unavailable > total * self.max_unavailable_ratio;
        if !exhausted {
            return 0;
        }
        let rate = if count as usize * BLOCK_SIZE < self.early_growth_threshold {
            self.early_growth_rate
        } else {
            self.growth_rate
        };
        ((total * (rate - 1.0)) as u32).max(1)
    }
}

/// Block counts by state, see [`Space::block_census`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockCensus {
    pub total: u32,
    pub free: u32,
    pub recyclable: u32,
    pub in_use: u32,
    /// Blocks still flagged marked. Zero outside of a collection.
    pub marked: u32,
}

pub struct Space {
    map: Mmap,
    heap_start: usize,
    block_count: AtomicU32,
    max_block_count: u32,
    pub(crate) blocks: MetaArena<BlockMeta>,
    pub(crate) lines: MetaArena<LineMeta>,
    pub(crate) free_lines: MetaArena<FreeLineMeta>,
    pub(crate) granules: GranuleMap,
    pub(crate) block_allocator: BlockAllocator,
    pub(crate) recycled_blocks: IndexList,
    pub(crate) large: LargeAllocator,
    pub(crate) grey: GreyPackets,
    pub(crate) sweep: SweepState,
    pub(crate) control: Control,
    policy: GrowthPolicy,
    recorder: Arc<dyn Recorder>,
    epoch: Instant,
    gc_threads: usize,
    pub(crate) verbose: bool,
}

impl Space {
    /// Reserves address space for the maximum heap and commits the initial
    /// blocks to the pool.
    pub fn new(config: &Config, gc_threads: usize, recorder: Arc<dyn Recorder>) -> std::io::Result<Self> {
        let max_heap = config
            .max_heap_size
            .min(physical_memory())
            .min(MAX_BLOCK_COUNT * BLOCK_SIZE);
        let min_heap = config.min_heap_size.max(MIN_HEAP_SIZE);
        let max_heap = max_heap.max(min_heap);
        let max_block_count = (max_heap / BLOCK_SIZE).min(MAX_BLOCK_COUNT) as u32;
        let initial = ((min_heap / BLOCK_SIZE) as u32).max(2).min(max_block_count);

        let map = Mmap::new(max_block_count as usize * BLOCK_SIZE)?;
        let max_blocks = max_block_count as usize;
        let space = Self {
            heap_start: map.aligned() as usize,
            map,
            block_count: AtomicU32::new(initial),
            max_block_count,
            blocks: MetaArena::new("block metadata", max_blocks)?,
            lines: MetaArena::new("line metadata", max_blocks * LINE_COUNT)?,
            free_lines: MetaArena::new("free line records", max_blocks * LINE_COUNT)?,
            granules: GranuleMap::new(max_blocks * GRANULES_IN_BLOCK)?,
            block_allocator: BlockAllocator::new(),
            recycled_blocks: IndexList::new(),
            large: LargeAllocator::new(max_blocks)?,
            grey: GreyPackets::new(GreyPackets::packet_count_for(max_heap))?,
            sweep: SweepState::new(gc_threads + 1),
            control: Control::new(gc_threads),
            policy: GrowthPolicy::from_config(config),
            recorder,
            epoch: Instant::now(),
            gc_threads,
            verbose: config.verbose,
        };
        space
            .block_allocator
            .add_new_blocks(&space.blocks, 0, initial);
        log::debug!(
            "heap reserved at {:#x}: {} of {} blocks, {} grey packets",
            space.heap_start,
            initial,
            max_block_count,
            space.grey.total()
        );
        Ok(space)
    }

    #[inline]
    pub fn heap_start(&self) -> usize {
        self.heap_start
    }

    /// End of the blocks in use, grows with the heap.
    #[inline]
    pub fn heap_end(&self) -> usize {
        self.heap_start + self.block_count() as usize * BLOCK_SIZE
    }

    pub fn reserved_end(&self) -> usize {
        debug_assert!(self.map.end() as usize >= self.heap_start + self.max_block_count as usize * BLOCK_SIZE);
        self.heap_start + self.max_block_count as usize * BLOCK_SIZE
    }

    #[inline]
    pub fn block_count(&self) -> u32 {
        self.block_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn max_block_count(&self) -> u32 {
        self.max_block_count
    }

    pub fn gc_threads(&self) -> usize {
        self.gc_threads
    }

    #[inline]
    pub fn contains(&self, address: usize) -> bool {
        address >= self.heap_start && address < self.heap_end()
    }

    #[inline]
    pub fn block_index(&self, address: usize) -> u32 {
        ((address - self.heap_start) >> BLOCK_SIZE_BITS) as u32
    }

    #[inline]
    pub fn block_address(&self, index: u32) -> usize {
        self.heap_start + ((index as usize) << BLOCK_SIZE_BITS)
    }

    #[inline]
    pub fn line_index(&self, address: usize) -> usize {
        (address - self.heap_start) >> LINE_SIZE_BITS
    }

    #[inline]
    pub fn granule_index(&self, address: usize) -> usize {
        (address - self.heap_start) >> GRANULE_SIZE_BITS
    }

    #[inline]
    pub fn granule_address(&self, index: usize) -> usize {
        self.heap_start + (index << GRANULE_SIZE_BITS)
    }

    #[inline]
    pub fn chunk_index(&self, address: usize) -> u32 {
        ((address - self.heap_start) >> LARGE_BLOCK_SIZE_BITS) as u32
    }

    #[inline]
    pub fn chunk_address(&self, chunk: u32) -> usize {
        self.heap_start + ((chunk as usize) << LARGE_BLOCK_SIZE_BITS)
    }

    #[inline]
    pub fn block(&self, index: u32) -> &BlockMeta {
        &self.blocks[index as usize]
    }

    /// # Safety
    ///
    /// `[start, start + len)` must be heap memory owned by the caller.
    #[inline]
    pub unsafe fn zero(&self, start: usize, len: usize) {
        debug_assert!(start >= self.heap_start && start + len <= self.reserved_end());
        std::ptr::write_bytes(start as *mut u8, 0, len);
    }

    /// Head of the object containing `address`, if any. Works for interior
    /// pointers into small and large objects.
    pub fn find_object(&self, address: usize) -> Option<usize> {
        if !self.contains(address) {
            return None;
        }
        let block = self.block_index(address);
        match self.block(block).flag() {
            BlockFlag::Simple | BlockFlag::Marked => {
                let floor = block as usize * GRANULES_IN_BLOCK;
                self.granules
                    .object_start(self.granule_index(address), floor)
                    .map(|head| self.granule_address(head))
            }
            BlockFlag::SuperblockStart | BlockFlag::SuperblockMiddle => {
                self.find_large_object(address)
            }
            BlockFlag::Free | BlockFlag::CoalescePending => None,
        }
    }

    /// Steps back chunk by chunk. Crossing into the previous block is only
    /// allowed from a superblock middle.
    fn find_large_object(&self, address: usize) -> Option<usize> {
        let per_block = crate::globals::CHUNKS_IN_BLOCK as u32;
        let mut chunk = self.chunk_index(address);
        loop {
            match self.granules.state(chunk as usize * GRANULES_IN_CHUNK) {
                GranuleState::Allocated | GranuleState::Marked => {
                    return Some(self.chunk_address(chunk))
                }
                GranuleState::Placeholder => {
                    if chunk % per_block == 0 && !self.block(chunk / per_block).is_superblock_middle() {
                        return None;
                    }
                    chunk -= 1;
                }
                GranuleState::Free => return None,
            }
        }
    }

    /// Whether `value` is exactly the head of an allocated object.
    pub fn is_object_head(&self, value: usize) -> bool {
        if value % GRANULE_SIZE != 0 || !self.contains(value) {
            return false;
        }
        let flag = self.block(self.block_index(value)).flag();
        let large = match flag {
            BlockFlag::Simple | BlockFlag::Marked => false,
            BlockFlag::SuperblockStart | BlockFlag::SuperblockMiddle => true,
            BlockFlag::Free | BlockFlag::CoalescePending => return false,
        };
        if large && value % LARGE_BLOCK_SIZE != 0 {
            return false;
        }
        matches!(
            self.granules.state(self.granule_index(value)),
            GranuleState::Allocated | GranuleState::Marked
        )
    }

    /// Whether the object at `head` lives in a superblock.
    #[inline]
    pub fn is_large(&self, head: usize) -> bool {
        matches!(
            self.block(self.block_index(head)).flag(),
            BlockFlag::SuperblockStart | BlockFlag::SuperblockMiddle
        )
    }

    /// Bytes occupied by the object at `head`.
    pub fn object_size(&self, head: usize) -> usize {
        let granule = self.granule_index(head);
        if self.is_large(head) {
            let mut chunk = self.chunk_index(head) + 1;
            let per_block = crate::globals::CHUNKS_IN_BLOCK as u32;
            let end = self.chunk_index(self.heap_end());
            while chunk < end
                && self.granules.state(chunk as usize * GRANULES_IN_CHUNK) == GranuleState::Placeholder
                && (chunk % per_block != 0 || self.block(chunk / per_block).is_superblock_middle())
            {
                chunk += 1;
            }
            (chunk - self.chunk_index(head)) as usize * LARGE_BLOCK_SIZE
        } else {
            let block_end = (self.block_index(head) as usize + 1) * GRANULES_IN_BLOCK;
            self.granules.object_granules(granule, block_end) * GRANULE_SIZE
        }
    }

    /// Adds `count` blocks to the pool. Fails when the heap would exceed its
    /// maximum size.
    pub fn grow(&self, count: u32) -> bool {
        let mut current = self.block_count.load(Ordering::Acquire);
        loop {
            if count == 0 || current as u64 + count as u64 > self.max_block_count as u64 {
                return false;
            }
            match self.block_count.compare_exchange_weak(
                current,
                current + count,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.block_allocator
            .add_new_blocks(&self.blocks, current, count);
        log::info!(
            "heap grew by {} blocks to {} ({} bytes)",
            count,
            current + count,
            (current + count) as usize * BLOCK_SIZE
        );
        true
    }

    /// Growth policy run once per cycle after the sweep.
    pub fn grow_if_needed(&self) {
        let count = self.block_count();
        let increment = self.policy.increment(
            count,
            self.block_allocator.free_block_count(),
            self.recycled_blocks.len(),
        );
        let increment = increment.min(self.max_block_count - count);
        if increment > 0 && !self.grow(increment) {
            log::debug!("heap growth by {} blocks lost a race", increment);
        }
    }

    /// Counts blocks by state. Only meaningful while no sweep is running.
    pub fn block_census(&self) -> BlockCensus {
        let total = self.block_count();
        let mut census = BlockCensus {
            total,
            ..BlockCensus::default()
        };
        let mut index = 0;
        while index < total {
            let block = self.block(index);
            let len = match block.state() {
                BlockState::Free => {
                    census.free += 1;
                    1
                }
                BlockState::CoalescePending { len } => {
                    census.free += len;
                    len
                }
                BlockState::Simple {
                    first_free_line: Some(_),
                } => {
                    census.recyclable += 1;
                    1
                }
                BlockState::Simple {
                    first_free_line: None,
                }
                | BlockState::SuperblockMiddle => {
                    census.in_use += 1;
                    1
                }
                BlockState::SuperblockStart { len } => {
                    census.in_use += len;
                    len
                }
                BlockState::Marked => {
                    census.marked += 1;
                    census.in_use += 1;
                    1
                }
            };
            index += len.max(1);
        }
        census
    }

    #[inline]
    pub fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    /// Reports `event` as running from `start_ns` until now.
    pub fn record(&self, event: GcEvent, start_ns: u64) {
        self.recorder.record(event, start_ns, self.now_ns());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        globals::{EARLY_GROWTH_RATE, EARLY_GROWTH_THRESHOLD, GROWTH_RATE},
        statistics::NoopRecorder,
    };

    fn default_policy() -> GrowthPolicy {
        GrowthPolicy::from_config(&Config::default())
    }

    fn space(min_blocks: usize, max_blocks: usize) -> Space {
        let config = Config {
            min_heap_size: min_blocks * BLOCK_SIZE,
            max_heap_size: max_blocks * BLOCK_SIZE,
            ..Config::default()
        };
        Space::new(&config, 1, Arc::new(NoopRecorder)).unwrap()
    }

    #[test]
    fn healthy_heap_does_not_grow() {
        let policy = default_policy();
        assert_eq!(policy.increment(100, 80, 10), 0);
        assert_eq!(policy.increment(100, 50, 25), 0);
    }

    #[test]
    fn growth_triggers() {
        let policy = default_policy();
        // too few free blocks
        assert_eq!(policy.increment(100, 40, 40), 100);
        // too many blocks neither free nor recyclable
        assert_eq!(policy.increment(100, 60, 10), 100);
    }

    #[test]
    fn early_rate_below_threshold_then_growth_rate() {
        let policy = default_policy();
        let small = 100u32;
        assert!((small as usize * BLOCK_SIZE) < EARLY_GROWTH_THRESHOLD);
        assert_eq!(
            policy.increment(small, 0, 0),
            (small as f64 * (EARLY_GROWTH_RATE - 1.0)) as u32
        );

        let big = (EARLY_GROWTH_THRESHOLD / BLOCK_SIZE) as u32 * 2;
        assert_eq!(
            policy.increment(big, 0, 0),
            (big as f64 * (GROWTH_RATE - 1.0)) as u32
        );
        assert!(policy.increment(big, 0, 0) < big);
    }

    #[test]
    fn exhausted_heap_grows_by_at_least_one_block() {
        let policy = GrowthPolicy {
            early_growth_threshold: 0,
            growth_rate: 1.0,
            ..default_policy()
        };
        assert_eq!(policy.increment(64, 0, 0), 1);
    }

    #[test]
    fn grow_stops_at_the_maximum() {
        let space = space(32, 40);
        assert_eq!(space.block_count(), 32);
        assert_eq!(space.max_block_count(), 40);
        assert!(!space.grow(0));
        assert!(!space.grow(9));
        assert!(space.grow(8));
        assert_eq!(space.block_count(), 40);
        assert_eq!(space.block_allocator.free_block_count(), 40);
        assert_eq!(space.heap_end(), space.heap_start() + 40 * BLOCK_SIZE);
        assert!(!space.grow(1));
        assert_eq!(space.block_count(), 40);
    }

    #[test]
    fn grow_if_needed_clamps_to_headroom() {
        let space = space(32, 40);
        // every block in use: the early rate asks for 32 more
        space.block_allocator.clear();
        space.grow_if_needed();
        assert_eq!(space.block_count(), 40);
        assert_eq!(space.block_allocator.free_block_count(), 8);

        space.block_allocator.clear();
        space.grow_if_needed();
        assert_eq!(space.block_count(), 40);
        assert_eq!(space.block_allocator.free_block_count(), 0);
    }

    #[test]
    fn healthy_space_keeps_its_size() {
        let space = space(32, 64);
        space.grow_if_needed();
        assert_eq!(space.block_count(), 32);
    }
}
