use std::sync::atomic::{AtomicU32, Ordering};

use crate::block_range::{AtomicBlockRange, BlockRange, NO_BLOCK_INDEX};

/// Metadata records that carry an intrusive `next` index.
pub trait Linked {
    fn link(&self) -> &AtomicU32;
}

/// Lock-free stack of indices into a metadata arena.
///
/// The head is `(index, aba_tag)`; the tag changes on every successful update
/// so a pop racing with a pop/push pair of the same index cannot succeed.
pub struct IndexList {
    head: AtomicBlockRange,
    count: AtomicU32,
}

impl IndexList {
    pub const fn new() -> Self {
        Self {
            head: AtomicBlockRange::new(BlockRange::new(NO_BLOCK_INDEX, 0)),
            count: AtomicU32::new(0),
        }
    }

    pub fn push<T: Linked>(&self, nodes: &[T], index: u32) {
        self.push_chain(nodes, index, index, 1);
    }

    /// Pushes `first ..= last`, already linked through `nodes`, in one step.
    pub fn push_chain<T: Linked>(&self, nodes: &[T], first: u32, last: u32, len: u32) {
        let mut head = self.head.load();
        loop {
            debug_assert_ne!(head.first, first);
            nodes[last as usize].link().store(head.first, Ordering::Relaxed);
            let new = BlockRange::new(first, head.limit.wrapping_add(1));
            match self.head.compare_exchange(head, new) {
                Ok(_) => {
                    self.count.fetch_add(len, Ordering::AcqRel);
                    return;
                }
                Err(actual) => head = actual,
            }
        }
    }

    pub fn pop<T: Linked>(&self, nodes: &[T]) -> Option<u32> {
        let mut head = self.head.load();
        loop {
            if head.first == NO_BLOCK_INDEX {
                return None;
            }
            let next = nodes[head.first as usize].link().load(Ordering::Relaxed);
            let new = BlockRange::new(next, head.limit.wrapping_add(1));
            match self.head.compare_exchange(head, new) {
                Ok(_) => {
                    self.count.fetch_sub(1, Ordering::AcqRel);
                    return Some(head.first);
                }
                Err(actual) => head = actual,
            }
        }
    }

    /// Drops every entry. Only valid while no other thread uses the list.
    pub fn clear(&self) {
        let head = self.head.load();
        self.head
            .store(BlockRange::new(NO_BLOCK_INDEX, head.limit.wrapping_add(1)));
        self.count.store(0, Ordering::Release);
    }

    pub fn len(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.head.load().first == NO_BLOCK_INDEX
    }

    /// Walks the list without removing anything. Only meaningful while the
    /// list is quiescent.
    pub fn for_each<T: Linked>(&self, nodes: &[T], mut visitor: impl FnMut(u32)) {
        let mut current = self.head.load().first;
        while current != NO_BLOCK_INDEX {
            visitor(current);
            current = nodes[current as usize].link().load(Ordering::Relaxed);
        }
    }
}

impl Default for IndexList {
    fn default() -> Self {
        Self::new()
    }
}
