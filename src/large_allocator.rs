//! Allocator for objects of at least [`LARGE_BLOCK_SIZE`] bytes.
//!
//! Large objects live in superblocks and are carved in 8 KiB chunks. Only
//! chunk-start granules carry state: the object head is allocated (or
//! marked) and every following chunk of the object is a placeholder.
use std::sync::atomic::{AtomicU32, Ordering};

use crate::{
    block::BlockMeta,
    block_allocator::BlockAllocator,
    globals::{CHUNKS_IN_BLOCK, GRANULE_SIZE, LARGE_BLOCK_SIZE},
    internal::block_list::{IndexList, Linked},
    mmap::{MetaArena, ZeroInit},
    object_meta::{GranuleMap, GranuleState},
};

pub const GRANULES_IN_CHUNK: usize = LARGE_BLOCK_SIZE / GRANULE_SIZE;
/// Lists for free chunks of one, two and three units, and one for chunks of
/// at least a block.
pub const FREE_LIST_COUNT: usize = CHUNKS_IN_BLOCK;

const EMPTY_LIST: IndexList = IndexList::new();

pub struct ChunkMeta {
    /// Length in chunks.
    size: AtomicU32,
    next: AtomicU32,
}

unsafe impl ZeroInit for ChunkMeta {}

impl Linked for ChunkMeta {
    fn link(&self) -> &AtomicU32 {
        &self.next
    }
}

/// Outcome of sweeping one superblock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuperblockSweep {
    /// Nothing survived, the whole run of `len` blocks is free.
    Dead { len: u32 },
    /// The superblock keeps its first `len` blocks; `free_tail` whole blocks
    /// after them were cut off and are free.
    Live { len: u32, free_tail: u32 },
}

#[inline]
pub fn chunks_for(size: usize) -> u32 {
    ((size + LARGE_BLOCK_SIZE - 1) / LARGE_BLOCK_SIZE) as u32
}

pub struct LargeAllocator {
    free_lists: [IndexList; FREE_LIST_COUNT],
    chunks: MetaArena<ChunkMeta>,
}

impl LargeAllocator {
    pub fn new(max_block_count: usize) -> std::io::Result<Self> {
        Ok(Self {
            free_lists: [EMPTY_LIST; FREE_LIST_COUNT],
            chunks: MetaArena::new("large chunks", max_block_count * CHUNKS_IN_BLOCK)?,
        })
    }

    #[inline]
    fn list_index(units: u32) -> usize {
        (units as usize).min(FREE_LIST_COUNT) - 1
    }

    pub fn add_chunk(&self, chunk: u32, units: u32) {
        debug_assert!(units > 0);
        self.chunks[chunk as usize].size.store(units, Ordering::Relaxed);
        self.free_lists[Self::list_index(units)].push(&self.chunks, chunk);
    }

    /// Free chunks per list, for statistics.
    pub fn free_chunk_count(&self) -> u32 {
        self.free_lists.iter().map(|list| list.len()).sum()
    }

    fn take_chunk(&self, units: u32) -> Option<(u32, u32)> {
        self.free_lists[Self::list_index(units)..]
            .iter()
            .find_map(|list| list.pop(&self.chunks))
            .map(|chunk| (chunk, self.chunks[chunk as usize].size.load(Ordering::Relaxed)))
    }

    /// Finds room for `size` bytes. Returns the global index of the first
    /// chunk. Sub-block requests are served first-fit from the free lists,
    /// everything else gets a fresh superblock.
    pub fn get_chunk(&self, blocks: &[BlockMeta], pool: &BlockAllocator, size: usize) -> Option<u32> {
        let units = chunks_for(size);
        let small = if (units as usize) < CHUNKS_IN_BLOCK {
            self.take_chunk(units)
        } else {
            None
        };
        let (chunk, available) = match small {
            Some(found) => found,
            None => {
                let block_count = (units + CHUNKS_IN_BLOCK as u32 - 1) / CHUNKS_IN_BLOCK as u32;
                let first = pool.get_free_superblock(blocks, block_count)?;
                (
                    first * CHUNKS_IN_BLOCK as u32,
                    block_count * CHUNKS_IN_BLOCK as u32,
                )
            }
        };
        debug_assert!(available >= units);
        if available > units {
            self.add_chunk(chunk + units, available - units);
        }
        Some(chunk)
    }

    /// Empties every free list, the sweep rebuilds them.
    pub fn clear(&self) {
        for list in self.free_lists.iter() {
            list.clear();
        }
    }

    /// Sweeps the superblock starting at block `first`.
    ///
    /// Surviving objects are unmarked. Dead objects inside the kept part
    /// become free chunks. Only granules are written past the first block;
    /// the caller is responsible for the block flags of freed blocks.
    pub fn sweep_superblock(&self, granules: &GranuleMap, blocks: &[BlockMeta], first: u32) -> SuperblockSweep {
        let len = blocks[first as usize].run_len();
        let total = len * CHUNKS_IN_BLOCK as u32;
        let base = first * CHUNKS_IN_BLOCK as u32;
        let granule = |offset: u32| (base + offset) as usize * GRANULES_IN_CHUNK;

        let mut any_live = false;
        let mut dead_start: Option<u32> = None;
        let mut offset = 0;
        while offset < total {
            let head = granule(offset);
            match granules.state(head) {
                GranuleState::Marked => {
                    if let Some(start) = dead_start.take() {
                        self.add_chunk(base + start, offset - start);
                    }
                    any_live = true;
                    granules.set_state(head, GranuleState::Allocated);
                    offset += 1;
                    while offset < total && granules.state(granule(offset)) == GranuleState::Placeholder {
                        offset += 1;
                    }
                }
                GranuleState::Allocated => {
                    dead_start.get_or_insert(offset);
                    granules.set_state(head, GranuleState::Free);
                    offset += 1;
                    while offset < total && granules.state(granule(offset)) == GranuleState::Placeholder {
                        granules.set_state(granule(offset), GranuleState::Free);
                        offset += 1;
                    }
                }
                GranuleState::Placeholder => {
                    dead_start.get_or_insert(offset);
                    granules.set_state(head, GranuleState::Free);
                    offset += 1;
                }
                GranuleState::Free => {
                    dead_start.get_or_insert(offset);
                    offset += 1;
                }
            }
        }

        if !any_live {
            return SuperblockSweep::Dead { len };
        }
        let mut kept = len;
        if let Some(start) = dead_start {
            let per_block = CHUNKS_IN_BLOCK as u32;
            let cut = (start + per_block - 1) / per_block;
            if start < cut * per_block {
                self.add_chunk(base + start, cut * per_block - start);
            }
            kept = cut;
            blocks[first as usize].set_run_len(kept);
        }
        SuperblockSweep::Live {
            len: kept,
            free_tail: len - kept,
        }
    }
}
