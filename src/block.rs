//! Block and line descriptors.
//!
//! Descriptors live in side arenas indexed by block (or global line) index,
//! never inside the blocks themselves, so a block is 32 KiB of object space.
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use atomic::Atomic;

use crate::{internal::block_list::Linked, mmap::ZeroInit};

/// Marks the end of a block's free-line chain.
pub const LAST_HOLE: u8 = u8::MAX;
const NO_FREE_LINE: u32 = u32::MAX;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockFlag {
    Free = 0,
    Simple = 1,
    SuperblockStart = 2,
    SuperblockMiddle = 3,
    Marked = 4,
    CoalescePending = 5,
}

/// Decoded view of a block descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockState {
    Free,
    Simple { first_free_line: Option<u8> },
    SuperblockStart { len: u32 },
    SuperblockMiddle,
    Marked,
    /// Start of a run of free blocks the sweeper could not hand to the pool
    /// because it touched a batch boundary.
    CoalescePending { len: u32 },
}

pub struct BlockMeta {
    flag: Atomic<BlockFlag>,
    /// First free line for simple blocks, run length for superblock starts
    /// and pending runs.
    payload: AtomicU32,
    next: AtomicU32,
}

unsafe impl ZeroInit for BlockMeta {}

impl Linked for BlockMeta {
    fn link(&self) -> &AtomicU32 {
        &self.next
    }
}

impl BlockMeta {
    #[inline]
    pub fn flag(&self) -> BlockFlag {
        self.flag.load(Ordering::Acquire)
    }

    pub fn state(&self) -> BlockState {
        match self.flag() {
            BlockFlag::Free => BlockState::Free,
            BlockFlag::Simple => BlockState::Simple {
                first_free_line: self.first_free_line(),
            },
            BlockFlag::SuperblockStart => BlockState::SuperblockStart { len: self.run_len() },
            BlockFlag::SuperblockMiddle => BlockState::SuperblockMiddle,
            BlockFlag::Marked => BlockState::Marked,
            BlockFlag::CoalescePending => BlockState::CoalescePending { len: self.run_len() },
        }
    }

    /// Payload is written before the flag so a reader that sees the flag
    /// also sees its payload.
    pub fn set_state(&self, state: BlockState) {
        let (flag, payload) = match state {
            BlockState::Free => (BlockFlag::Free, 0),
            BlockState::Simple { first_free_line } => (
                BlockFlag::Simple,
                first_free_line.map_or(NO_FREE_LINE, u32::from),
            ),
            BlockState::SuperblockStart { len } => (BlockFlag::SuperblockStart, len),
            BlockState::SuperblockMiddle => (BlockFlag::SuperblockMiddle, 0),
            BlockState::Marked => (BlockFlag::Marked, self.payload.load(Ordering::Relaxed)),
            BlockState::CoalescePending { len } => (BlockFlag::CoalescePending, len),
        };
        self.payload.store(payload, Ordering::Relaxed);
        self.flag.store(flag, Ordering::Release);
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.flag() == BlockFlag::Free
    }

    #[inline]
    pub fn is_simple(&self) -> bool {
        self.flag() == BlockFlag::Simple
    }

    #[inline]
    pub fn is_superblock_start(&self) -> bool {
        self.flag() == BlockFlag::SuperblockStart
    }

    #[inline]
    pub fn is_superblock_middle(&self) -> bool {
        self.flag() == BlockFlag::SuperblockMiddle
    }

    #[inline]
    pub fn is_marked(&self) -> bool {
        self.flag() == BlockFlag::Marked
    }

    /// Idempotent, several markers may race on the same block.
    #[inline]
    pub fn mark(&self) {
        if self.flag.load(Ordering::Relaxed) != BlockFlag::Marked {
            self.flag.store(BlockFlag::Marked, Ordering::Relaxed);
        }
    }

    pub fn unmark(&self) {
        self.flag.store(BlockFlag::Simple, Ordering::Relaxed);
    }

    pub fn first_free_line(&self) -> Option<u8> {
        match self.payload.load(Ordering::Relaxed) {
            NO_FREE_LINE => None,
            x => Some(x as u8),
        }
    }

    pub fn set_first_free_line(&self, line: Option<u8>) {
        self.payload
            .store(line.map_or(NO_FREE_LINE, u32::from), Ordering::Relaxed);
    }

    /// Length of a superblock or of a pending/free run starting here.
    #[inline]
    pub fn run_len(&self) -> u32 {
        self.payload.load(Ordering::Relaxed)
    }

    pub fn set_run_len(&self, len: u32) {
        self.payload.store(len, Ordering::Relaxed);
    }
}

/// Line mark byte.
pub struct LineMeta(AtomicU8);

unsafe impl ZeroInit for LineMeta {}

impl LineMeta {
    #[inline]
    pub fn is_marked(&self) -> bool {
        self.0.load(Ordering::Relaxed) != 0
    }

    #[inline]
    pub fn mark(&self) {
        if self.0.load(Ordering::Relaxed) == 0 {
            self.0.store(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn unmark(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

/// Free-line record, indexed by global line index. Only the first line of a
/// free run carries a meaningful record.
pub struct FreeLineMeta {
    next: AtomicU8,
    size: AtomicU8,
}

unsafe impl ZeroInit for FreeLineMeta {}

impl FreeLineMeta {
    pub fn set(&self, next: Option<u8>, size: u8) {
        self.next.store(next.unwrap_or(LAST_HOLE), Ordering::Relaxed);
        self.size.store(size, Ordering::Relaxed);
    }

    /// Block-local index of the next free run.
    pub fn next(&self) -> Option<u8> {
        match self.next.load(Ordering::Relaxed) {
            LAST_HOLE => None,
            x => Some(x),
        }
    }

    /// Run length in lines.
    pub fn size(&self) -> u8 {
        self.size.load(Ordering::Relaxed)
    }
}
