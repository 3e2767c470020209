use std::sync::atomic::{fence, Ordering};

use crate::{
    block::BlockState,
    globals::{BLOCK_SIZE, LINE_COUNT, LINE_SIZE},
    space::Space,
};

use super::{Allocator, BumpCursor};

/// The `NormalAllocator` bumps through runs of free lines.
///
/// Its current block keeps the chain of remaining runs in the block
/// descriptor: taking a run moves `first_free_line` to the next one. New
/// blocks come from the recycled list first and from the block pool after.
#[derive(Default)]
pub struct NormalAllocator {
    cursor: BumpCursor,
    block: Option<u32>,
}

impl NormalAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves to the next free-line run of `block`, zeroing it.
    fn next_line(&mut self, space: &Space, block: u32) -> bool {
        let meta = &space.blocks[block as usize];
        let line = match meta.first_free_line() {
            Some(line) => line,
            None => return false,
        };
        debug_assert!((line as usize) < LINE_COUNT);
        let record = &space.free_lines[block as usize * LINE_COUNT + line as usize];
        let size = record.size() as usize;
        debug_assert!(size > 0);
        meta.set_first_free_line(record.next());

        let start = space.block_address(block) + line as usize * LINE_SIZE;
        let limit = start + size * LINE_SIZE;
        debug_assert!(limit <= space.block_address(block) + BLOCK_SIZE);
        unsafe {
            space.zero(start, limit - start);
        }
        self.cursor = BumpCursor::new(start, limit);
        true
    }

    fn new_block(&mut self, space: &Space) -> bool {
        if let Some(block) = space.recycled_blocks.pop(&space.blocks) {
            // get all the changes done by sweeping
            fence(Ordering::Acquire);
            self.block = Some(block);
            return self.next_line(space, block);
        }
        match space.block_allocator.get_free_block(&space.blocks) {
            Some(block) => {
                space.blocks[block as usize].set_state(BlockState::Simple {
                    first_free_line: None,
                });
                let start = space.block_address(block);
                unsafe {
                    space.zero(start, BLOCK_SIZE);
                }
                self.block = Some(block);
                self.cursor = BumpCursor::new(start, start + BLOCK_SIZE);
                true
            }
            None => {
                self.block = None;
                false
            }
        }
    }
}

impl Allocator for NormalAllocator {
    fn cursor(&mut self) -> &mut BumpCursor {
        &mut self.cursor
    }

    fn refill(&mut self, space: &Space, _size: usize) -> bool {
        if let Some(block) = self.block {
            if self.next_line(space, block) {
                return true;
            }
        }
        self.new_block(space)
    }

    fn clear(&mut self) {
        self.cursor = BumpCursor::EMPTY;
        self.block = None;
    }
}
