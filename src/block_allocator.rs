use std::sync::atomic::{AtomicU32, Ordering};

use crate::{
    block::{BlockMeta, BlockState},
    block_range::{AtomicBlockRange, BlockRange},
    globals::SUPERBLOCK_LIST_SIZE,
    internal::block_list::IndexList,
};

#[inline]
pub fn floor_log2(value: u32) -> usize {
    debug_assert!(value > 0);
    (31 - value.leading_zeros()) as usize
}

#[inline]
pub fn ceil_log2(value: u32) -> usize {
    if value <= 1 {
        0
    } else {
        (32 - (value - 1).leading_zeros()) as usize
    }
}

const EMPTY_LIST: IndexList = IndexList::new();

/// Pool of unused blocks.
///
/// Free runs are kept in one list per power of two (class `i` holds runs of
/// `[2^i, 2^(i+1))` blocks). Single blocks are carved from the smallest run
/// seen so far. Runs handed back by the sweeper are merged into a pending
/// coalescing range while they keep touching it.
pub struct BlockAllocator {
    free_superblocks: [IndexList; SUPERBLOCK_LIST_SIZE],
    smallest_superblock: AtomicBlockRange,
    coalescing_superblock: AtomicBlockRange,
    free_block_count: AtomicU32,
}

impl BlockAllocator {
    pub fn new() -> Self {
        Self {
            free_superblocks: [EMPTY_LIST; SUPERBLOCK_LIST_SIZE],
            smallest_superblock: AtomicBlockRange::default(),
            coalescing_superblock: AtomicBlockRange::default(),
            free_block_count: AtomicU32::new(0),
        }
    }

    pub fn free_block_count(&self) -> u32 {
        self.free_block_count.load(Ordering::Acquire)
    }

    fn add_run(&self, blocks: &[BlockMeta], first: u32, len: u32) {
        debug_assert!(len > 0);
        blocks[first as usize].set_run_len(len);
        self.free_superblocks[floor_log2(len)].push(blocks, first);
    }

    /// Gets one free block.
    pub fn get_free_block(&self, blocks: &[BlockMeta]) -> Option<u32> {
        if let Some(index) = self.smallest_superblock.poll_first(1) {
            self.free_block_count.fetch_sub(1, Ordering::AcqRel);
            return Some(index);
        }
        let run = self
            .free_superblocks
            .iter()
            .find_map(|list| list.pop(blocks))
            .map(|first| BlockRange::of(first, blocks[first as usize].run_len()))
            .or_else(|| {
                let pending = self.coalescing_superblock.swap(BlockRange::EMPTY);
                Some(pending).filter(|range| !range.is_empty())
            })?;
        self.smallest_superblock
            .store(BlockRange::new(run.first + 1, run.limit));
        self.free_block_count.fetch_sub(1, Ordering::AcqRel);
        Some(run.first)
    }

    /// Gets `count` contiguous blocks flagged as one superblock.
    pub fn get_free_superblock(&self, blocks: &[BlockMeta], count: u32) -> Option<u32> {
        debug_assert!(count > 0);
        let first = self
            .smallest_superblock
            .poll_first(count)
            .or_else(|| self.take_from_lists(blocks, count))
            .or_else(|| self.take_from_pending(blocks, count))?;
        self.free_block_count.fetch_sub(count, Ordering::AcqRel);
        blocks[first as usize].set_state(BlockState::SuperblockStart { len: count });
        for block in &blocks[first as usize + 1..(first + count) as usize] {
            block.set_state(BlockState::SuperblockMiddle);
        }
        Some(first)
    }

    fn take_from_lists(&self, blocks: &[BlockMeta], count: u32) -> Option<u32> {
        let split = |first: u32| {
            let len = blocks[first as usize].run_len();
            if len > count {
                self.add_run(blocks, first + count, len - count);
            }
            first
        };
        let min_class = ceil_log2(count);
        for list in &self.free_superblocks[min_class..] {
            if let Some(first) = list.pop(blocks) {
                return Some(split(first));
            }
        }
        // Runs in the class below may still be long enough.
        let class = floor_log2(count);
        if class == min_class {
            return None;
        }
        let list = &self.free_superblocks[class];
        let mut misfits = Vec::new();
        let mut found = None;
        for _ in 0..list.len() {
            match list.pop(blocks) {
                Some(first) if blocks[first as usize].run_len() >= count => {
                    found = Some(first);
                    break;
                }
                Some(first) => misfits.push(first),
                None => break,
            }
        }
        for first in misfits {
            list.push(blocks, first);
        }
        found.map(split)
    }

    fn take_from_pending(&self, blocks: &[BlockMeta], count: u32) -> Option<u32> {
        let pending = self.coalescing_superblock.swap(BlockRange::EMPTY);
        if pending.is_empty() {
            return None;
        }
        if pending.size() < count {
            self.add_run(blocks, pending.first, pending.size());
            return None;
        }
        if pending.size() > count {
            self.add_run(blocks, pending.first + count, pending.size() - count);
        }
        Some(pending.first)
    }

    /// Returns a run of free blocks. Runs that touch the pending range are
    /// merged into it; otherwise the pending range is pushed to its size class
    /// and the new run takes its place.
    pub fn add_free_blocks(&self, blocks: &[BlockMeta], first: u32, count: u32) {
        debug_assert!(count > 0);
        for block in &blocks[first as usize..(first + count) as usize] {
            block.set_state(BlockState::Free);
        }
        self.free_block_count.fetch_add(count, Ordering::AcqRel);
        let mut current = self.coalescing_superblock.load();
        loop {
            let (new, flushed) = match current.append(first, count) {
                Some(merged) => (merged, None),
                None => (BlockRange::of(first, count), Some(current)),
            };
            match self.coalescing_superblock.compare_exchange(current, new) {
                Ok(_) => {
                    if let Some(old) = flushed {
                        self.add_run(blocks, old.first, old.size());
                    }
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Adds never used blocks (heap growth).
    pub fn add_new_blocks(&self, blocks: &[BlockMeta], first: u32, count: u32) {
        for block in &blocks[first as usize..(first + count) as usize] {
            block.set_state(BlockState::Free);
        }
        self.free_block_count.fetch_add(count, Ordering::AcqRel);
        self.add_run(blocks, first, count);
    }

    /// Moves the pending coalescing range into its size class.
    pub fn flush(&self, blocks: &[BlockMeta]) {
        let pending = self.coalescing_superblock.swap(BlockRange::EMPTY);
        if !pending.is_empty() {
            self.add_run(blocks, pending.first, pending.size());
        }
    }

    /// Forgets every free block. The sweep rebuilds the pool from scratch.
    pub fn clear(&self) {
        for list in self.free_superblocks.iter() {
            list.clear();
        }
        self.smallest_superblock.store(BlockRange::EMPTY);
        self.coalescing_superblock.store(BlockRange::EMPTY);
        self.free_block_count.store(0, Ordering::Release);
    }
}

impl Default for BlockAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmap::MetaArena;

    fn pool_with(blocks: &MetaArena<BlockMeta>, first: u32, count: u32) -> BlockAllocator {
        let pool = BlockAllocator::new();
        pool.add_new_blocks(blocks, first, count);
        pool
    }

    #[test]
    fn log2_helpers() {
        assert_eq!(floor_log2(1), 0);
        assert_eq!(floor_log2(5), 2);
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(5), 3);
        assert_eq!(ceil_log2(8), 3);
    }

    #[test]
    fn single_blocks_are_carved_in_order() {
        let blocks = MetaArena::<BlockMeta>::new("blocks", 16).unwrap();
        let pool = pool_with(&blocks, 0, 16);
        for expected in 0..16 {
            assert_eq!(pool.get_free_block(&blocks), Some(expected));
        }
        assert_eq!(pool.get_free_block(&blocks), None);
        assert_eq!(pool.free_block_count(), 0);
    }

    #[test]
    fn superblock_is_split_and_flagged() {
        let blocks = MetaArena::<BlockMeta>::new("blocks", 16).unwrap();
        let pool = pool_with(&blocks, 0, 16);
        let first = pool.get_free_superblock(&blocks, 5).unwrap();
        assert_eq!(first, 0);
        assert_eq!(blocks[0].state(), BlockState::SuperblockStart { len: 5 });
        for b in 1..5 {
            assert_eq!(blocks[b].state(), BlockState::SuperblockMiddle);
        }
        assert_eq!(pool.free_block_count(), 11);
        assert_eq!(pool.get_free_superblock(&blocks, 11), Some(5));
        assert_eq!(pool.get_free_superblock(&blocks, 1), None);
    }

    #[test]
    fn adjacent_runs_coalesce() {
        let blocks = MetaArena::<BlockMeta>::new("blocks", 64).unwrap();
        let pool = BlockAllocator::new();
        pool.add_free_blocks(&blocks, 10, 4);
        pool.add_free_blocks(&blocks, 14, 4);
        pool.add_free_blocks(&blocks, 6, 4);
        pool.flush(&blocks);
        assert_eq!(pool.free_block_count(), 12);
        assert_eq!(pool.get_free_superblock(&blocks, 12), Some(6));
    }

    #[test]
    fn non_adjacent_run_flushes_pending() {
        let blocks = MetaArena::<BlockMeta>::new("blocks", 64).unwrap();
        let pool = BlockAllocator::new();
        pool.add_free_blocks(&blocks, 0, 3);
        pool.add_free_blocks(&blocks, 20, 2);
        pool.flush(&blocks);
        assert_eq!(pool.get_free_superblock(&blocks, 3), Some(0));
        assert_eq!(pool.get_free_superblock(&blocks, 2), Some(20));
        assert_eq!(pool.get_free_superblock(&blocks, 1), None);
    }

    #[test]
    fn clear_forgets_everything() {
        let blocks = MetaArena::<BlockMeta>::new("blocks", 8).unwrap();
        let pool = pool_with(&blocks, 0, 8);
        assert!(pool.get_free_block(&blocks).is_some());
        pool.clear();
        assert_eq!(pool.free_block_count(), 0);
        assert_eq!(pool.get_free_block(&blocks), None);
    }
}
