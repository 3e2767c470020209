use crossbeam_utils::atomic::AtomicCell;

/// Sentinel for "no block" in index links and list heads.
pub const NO_BLOCK_INDEX: u32 = u32::MAX;

/// Half open range of block indices `[first, limit)`.
///
/// Packed into 8 bytes so `AtomicCell<BlockRange>` is lock free. List heads
/// reuse the layout as `(index, aba_tag)`.
#[repr(C, align(8))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockRange {
    pub first: u32,
    pub limit: u32,
}

impl BlockRange {
    pub const EMPTY: Self = Self { first: 0, limit: 0 };

    pub const fn new(first: u32, limit: u32) -> Self {
        Self { first, limit }
    }

    pub const fn of(first: u32, count: u32) -> Self {
        Self {
            first,
            limit: first + count,
        }
    }

    pub const fn is_empty(self) -> bool {
        self.first >= self.limit
    }

    pub const fn size(self) -> u32 {
        if self.is_empty() {
            0
        } else {
            self.limit - self.first
        }
    }

    /// Extends the range by `[first, first + count)` when the two touch. An
    /// empty range takes the new run as is.
    pub fn append(self, first: u32, count: u32) -> Option<Self> {
        if self.is_empty() {
            Some(Self::of(first, count))
        } else if self.limit == first {
            Some(Self::new(self.first, first + count))
        } else if first + count == self.first {
            Some(Self::new(first, self.limit))
        } else {
            None
        }
    }
}

pub struct AtomicBlockRange {
    range: AtomicCell<BlockRange>,
}

impl AtomicBlockRange {
    pub const fn new(range: BlockRange) -> Self {
        Self {
            range: AtomicCell::new(range),
        }
    }

    pub fn load(&self) -> BlockRange {
        self.range.load()
    }

    pub fn store(&self, range: BlockRange) {
        self.range.store(range)
    }

    pub fn swap(&self, range: BlockRange) -> BlockRange {
        self.range.swap(range)
    }

    pub fn compare_exchange(
        &self,
        current: BlockRange,
        new: BlockRange,
    ) -> Result<BlockRange, BlockRange> {
        self.range.compare_exchange(current, new)
    }

    /// Takes `count` blocks off the front of the range, if it holds that many.
    pub fn poll_first(&self, count: u32) -> Option<u32> {
        let mut current = self.load();
        loop {
            if current.size() < count {
                return None;
            }
            let next = BlockRange::new(current.first + count, current.limit);
            match self.compare_exchange(current, next) {
                Ok(_) => return Some(current.first),
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for AtomicBlockRange {
    fn default() -> Self {
        Self::new(BlockRange::EMPTY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_is_lock_free() {
        assert!(AtomicCell::<BlockRange>::is_lock_free());
        assert_eq!(core::mem::size_of::<BlockRange>(), 8);
    }

    #[test]
    fn append_merges_only_touching_runs() {
        let r = BlockRange::of(10, 4);
        assert_eq!(r.append(14, 2), Some(BlockRange::new(10, 16)));
        assert_eq!(r.append(6, 4), Some(BlockRange::new(6, 14)));
        assert_eq!(r.append(15, 1), None);
        assert_eq!(BlockRange::EMPTY.append(3, 1), Some(BlockRange::new(3, 4)));
    }

    #[test]
    fn poll_first_consumes_front() {
        let r = AtomicBlockRange::new(BlockRange::of(5, 3));
        assert_eq!(r.poll_first(2), Some(5));
        assert_eq!(r.poll_first(2), None);
        assert_eq!(r.poll_first(1), Some(7));
        assert_eq!(r.poll_first(1), None);
        assert!(r.load().is_empty());
    }
}
