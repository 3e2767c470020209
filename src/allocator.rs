//! Mutator-side bump allocation.
//!
//! Objects up to one line go through [`NormalAllocator`], which bumps inside
//! runs of free lines. Medium objects that do not fit the current run go to
//! [`OverflowAllocator`], which only ever bumps through whole free blocks.
use crate::{globals::MEDIUM_CUTOFF, space::Space};

pub mod normal;
pub mod overflow;

pub use normal::NormalAllocator;
pub use overflow::OverflowAllocator;

/// Bump region `[cursor, limit)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BumpCursor {
    cursor: usize,
    limit: usize,
}

impl BumpCursor {
    pub const EMPTY: Self = Self {
        cursor: 0,
        limit: 0,
    };

    pub fn new(start: usize, limit: usize) -> Self {
        debug_assert!(start <= limit);
        Self {
            cursor: start,
            limit,
        }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.limit - self.cursor
    }

    #[inline]
    pub fn bump(&mut self, size: usize) -> Option<usize> {
        if size > self.remaining() {
            return None;
        }
        let start = self.cursor;
        self.cursor += size;
        Some(start)
    }
}

pub trait Allocator {
    fn cursor(&mut self) -> &mut BumpCursor;

    /// Moves the cursor to fresh memory able to hold `size` bytes. Returns
    /// false when no block is left.
    fn refill(&mut self, space: &Space, size: usize) -> bool;

    /// Drops the current region, the sweep is about to rebuild every list.
    fn clear(&mut self);

    fn alloc(&mut self, space: &Space, size: usize) -> Option<usize> {
        loop {
            if let Some(start) = self.cursor().bump(size) {
                return Some(start);
            }
            if !self.refill(space, size) {
                return None;
            }
        }
    }
}

/// Both cursors of one mutator.
#[derive(Default)]
pub struct BumpAllocator {
    normal: NormalAllocator,
    overflow: OverflowAllocator,
}

impl BumpAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns zeroed memory for `size` bytes, or `None` once both the
    /// recycled list and the block pool are exhausted.
    pub fn alloc(&mut self, space: &Space, size: usize) -> Option<usize> {
        debug_assert!(size > 0 && size < crate::globals::LARGE_BLOCK_SIZE);
        if let Some(start) = self.normal.cursor().bump(size) {
            return Some(start);
        }
        if size > MEDIUM_CUTOFF {
            self.overflow.alloc(space, size)
        } else {
            self.normal.alloc(space, size)
        }
    }

    pub fn clear(&mut self) {
        self.normal.clear();
        self.overflow.clear();
    }

    /// Restarting allocation needs one free block for the overflow cursor and
    /// a free or recycled one for the normal cursor.
    pub fn can_init_cursors(&self, space: &Space) -> bool {
        let free = space.block_allocator.free_block_count();
        free >= 2 || (free == 1 && !space.recycled_blocks.is_empty())
    }
}
