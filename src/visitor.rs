use crate::{globals::WORD_SIZE, marking::Marker};

/// Handed to root constraints while the world is stopped.
pub struct RootVisitor<'a, 'm> {
    marker: &'m mut Marker<'a>,
    visited: usize,
}

impl<'a, 'm> RootVisitor<'a, 'm> {
    pub(crate) fn new(marker: &'m mut Marker<'a>) -> Self {
        Self { marker, visited: 0 }
    }

    /// Words scanned so far.
    pub fn visited(&self) -> usize {
        self.visited
    }

    /// Scans every aligned word of `[from, to)` as a possible pointer,
    /// interior pointers included. Used for stacks and register dumps.
    ///
    /// # Safety
    ///
    /// The whole range must be readable.
    pub unsafe fn visit_conservative(&mut self, from: *const u8, to: *const u8) {
        let mut scan = (from as usize + WORD_SIZE - 1) & !(WORD_SIZE - 1);
        let end = to as usize;
        while scan + WORD_SIZE <= end {
            let word = (scan as *const usize).read();
            self.marker.mark_conservative(word);
            self.visited += 1;
            scan += WORD_SIZE;
        }
    }

    /// Same as [`visit_conservative`](Self::visit_conservative) over a slice.
    pub fn visit_words(&mut self, words: &[usize]) {
        for &word in words {
            self.marker.mark_conservative(word);
        }
        self.visited += words.len();
    }

    /// Marks `value` if it is exactly the address of an object. Used for
    /// module and static tables that only hold object references.
    pub fn visit_precise(&mut self, value: usize) {
        self.marker.mark_precise(value);
        self.visited += 1;
    }
}
