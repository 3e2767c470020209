//! Granule state map: one byte of metadata for every 16 bytes of heap.
use std::sync::atomic::{AtomicU8, Ordering};

use modular_bitfield::prelude::*;

use crate::mmap::MetaArena;

#[derive(BitfieldSpecifier, Clone, Copy, Debug, PartialEq, Eq)]
#[bits = 3]
pub enum GranuleState {
    Free = 0,
    /// Continuation granule of the object that starts before it.
    Placeholder = 1,
    Allocated = 2,
    Marked = 4,
}

#[bitfield(bits = 8)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ObjectMeta {
    state: GranuleState,
    /// Reserved for generational use, preserved by every transition.
    remembered: bool,
    #[skip]
    __: B4,
}

impl ObjectMeta {
    #[inline]
    pub fn from_byte(byte: u8) -> Self {
        Self::from_bytes([byte])
    }

    #[inline]
    pub fn to_byte(self) -> u8 {
        self.into_bytes()[0]
    }

    /// Bytes outside the known encodings only appear for never-written
    /// granules, which read as free.
    #[inline]
    pub fn granule_state(self) -> GranuleState {
        self.state_or_err().unwrap_or(GranuleState::Free)
    }

    #[inline]
    pub fn is_remembered(self) -> bool {
        self.remembered()
    }

    #[inline]
    pub fn with_granule_state(self, state: GranuleState) -> Self {
        self.with_state(state)
    }

    #[inline]
    pub fn with_remembered_bit(self, remembered: bool) -> Self {
        self.with_remembered(remembered)
    }

    /// Marked becomes allocated, allocated becomes free. Placeholders and the
    /// remembered bit are left alone.
    #[inline]
    pub fn swept(self) -> Self {
        match self.granule_state() {
            GranuleState::Marked => self.with_state(GranuleState::Allocated),
            GranuleState::Allocated => self.with_state(GranuleState::Free),
            _ => self,
        }
    }
}

impl std::fmt::Debug for ObjectMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectMeta")
            .field("state", &self.granule_state())
            .field("remembered", &self.is_remembered())
            .finish()
    }
}

pub struct GranuleMap {
    bytes: MetaArena<AtomicU8>,
}

impl GranuleMap {
    pub fn new(granules: usize) -> std::io::Result<Self> {
        Ok(Self {
            bytes: MetaArena::new("granule map", granules)?,
        })
    }

    #[inline]
    pub fn get(&self, index: usize) -> ObjectMeta {
        ObjectMeta::from_byte(self.bytes[index].load(Ordering::Relaxed))
    }

    #[inline]
    pub fn state(&self, index: usize) -> GranuleState {
        self.get(index).granule_state()
    }

    pub fn set_state(&self, index: usize, state: GranuleState) {
        let cell = &self.bytes[index];
        let meta = ObjectMeta::from_byte(cell.load(Ordering::Relaxed));
        cell.store(meta.with_granule_state(state).to_byte(), Ordering::Relaxed);
    }

    pub fn set_remembered(&self, index: usize, remembered: bool) {
        let cell = &self.bytes[index];
        let meta = ObjectMeta::from_byte(cell.load(Ordering::Relaxed));
        cell.store(meta.with_remembered_bit(remembered).to_byte(), Ordering::Relaxed);
    }

    /// Records a freshly allocated object: allocated head, placeholder tail.
    pub fn set_allocated(&self, first: usize, granules: usize) {
        debug_assert!(granules > 0);
        let head = ObjectMeta::new().with_granule_state(GranuleState::Allocated);
        let tail = ObjectMeta::new().with_granule_state(GranuleState::Placeholder);
        self.bytes[first].store(head.to_byte(), Ordering::Relaxed);
        for cell in &self.bytes[first + 1..first + granules] {
            cell.store(tail.to_byte(), Ordering::Relaxed);
        }
    }

    /// Atomically moves an allocated granule to marked. Returns false when the
    /// granule is not an unmarked object head, including when another marker
    /// won the race.
    #[inline]
    pub fn try_mark(&self, index: usize) -> bool {
        let cell = &self.bytes[index];
        let mut current = cell.load(Ordering::Relaxed);
        loop {
            let meta = ObjectMeta::from_byte(current);
            if meta.granule_state() != GranuleState::Allocated {
                return false;
            }
            let marked = meta.with_granule_state(GranuleState::Marked).to_byte();
            match cell.compare_exchange_weak(current, marked, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn clear(&self, first: usize, count: usize) {
        for cell in &self.bytes[first..first + count] {
            cell.store(0, Ordering::Relaxed);
        }
    }

    /// Sweeps the granules of a surviving line. `dead` carries whether the
    /// last object seen is dead, so that its placeholders spilling into this
    /// line are freed too. Placeholders of live objects are kept.
    pub fn sweep(&self, first: usize, count: usize, dead: &mut bool) {
        for cell in &self.bytes[first..first + count] {
            let meta = ObjectMeta::from_byte(cell.load(Ordering::Relaxed));
            let swept = match meta.granule_state() {
                GranuleState::Marked => {
                    *dead = false;
                    meta.swept()
                }
                GranuleState::Allocated => {
                    *dead = true;
                    meta.swept()
                }
                GranuleState::Placeholder if *dead => {
                    meta.with_granule_state(GranuleState::Free)
                }
                GranuleState::Placeholder => meta,
                GranuleState::Free => {
                    *dead = true;
                    meta
                }
            };
            if swept != meta {
                cell.store(swept.to_byte(), Ordering::Relaxed);
            }
        }
    }

    /// Finds the head of the object containing granule `index`, scanning no
    /// further back than `floor`.
    pub fn object_start(&self, index: usize, floor: usize) -> Option<usize> {
        let mut current = index;
        loop {
            match self.state(current) {
                GranuleState::Allocated | GranuleState::Marked => return Some(current),
                GranuleState::Free => return None,
                GranuleState::Placeholder if current == floor => return None,
                GranuleState::Placeholder => current -= 1,
            }
        }
    }

    /// Number of granules of the object whose head is `head`, not looking
    /// past `limit`.
    pub fn object_granules(&self, head: usize, limit: usize) -> usize {
        let mut end = head + 1;
        while end < limit && self.state(end) == GranuleState::Placeholder {
            end += 1;
        }
        end - head
    }
}
