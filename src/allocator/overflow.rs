use crate::{block::BlockState, globals::BLOCK_SIZE, space::Space};

use super::{Allocator, BumpCursor};

/// The `OverflowAllocator` is used for *medium* sized objects (larger than a
/// line) that do not fit the normal cursor. It only takes whole free blocks,
/// which limits fragmentation of recycled blocks.
#[derive(Default)]
pub struct OverflowAllocator {
    cursor: BumpCursor,
}

impl OverflowAllocator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Allocator for OverflowAllocator {
    fn cursor(&mut self) -> &mut BumpCursor {
        &mut self.cursor
    }

    fn refill(&mut self, space: &Space, size: usize) -> bool {
        debug_assert!(size <= BLOCK_SIZE);
        let block = match space.block_allocator.get_free_block(&space.blocks) {
            Some(block) => block,
            None => return false,
        };
        space.blocks[block as usize].set_state(BlockState::Simple {
            first_free_line: None,
        });
        let start = space.block_address(block);
        unsafe {
            space.zero(start, BLOCK_SIZE);
        }
        self.cursor = BumpCursor::new(start, start + BLOCK_SIZE);
        true
    }

    fn clear(&mut self) {
        self.cursor = BumpCursor::EMPTY;
    }
}
