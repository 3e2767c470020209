use crate::{
    globals::{GRANULES_IN_BLOCK, GRANULE_SIZE, WORD_SIZE},
    grey_packet::OwnedPacket,
    object::{self, ObjectKind, ARRAY_HEADER_SIZE},
    space::Space,
};

/// Per-thread marking state.
///
/// Grey objects are pushed into an output packet which is published on the
/// full list once it fills up. When no empty packet is left the marker falls
/// back to a private overflow stack; it is drained before the marker looks
/// for more shared work, and whatever remains after the parallel phase is
/// picked up by the final single threaded pass.
pub struct Marker<'a> {
    space: &'a Space,
    out: Option<OwnedPacket<'a>>,
    overflow: Vec<usize>,
    scanned: usize,
}

impl<'a> Marker<'a> {
    pub fn new(space: &'a Space) -> Self {
        Self {
            space,
            out: None,
            overflow: Vec::new(),
            scanned: 0,
        }
    }

    /// Objects scanned by this marker so far.
    pub fn scanned(&self) -> usize {
        self.scanned
    }

    /// Resolves a word that may point anywhere inside an object.
    pub fn mark_conservative(&mut self, word: usize) {
        if let Some(object) = self.space.find_object(word) {
            self.mark_object(object);
        }
    }

    /// Marks `value` if it is exactly an object head.
    #[inline]
    pub fn mark_precise(&mut self, value: usize) {
        if self.space.is_object_head(value) {
            self.mark_object(value);
        }
    }

    fn mark_object(&mut self, object: usize) {
        let space = self.space;
        let granule = space.granule_index(object);
        if !space.granules.try_mark(granule) {
            return;
        }
        if !space.is_large(object) {
            let block = space.block_index(object);
            space.block(block).mark();
            let block_end = (block as usize + 1) * GRANULES_IN_BLOCK;
            let granules = space.granules.object_granules(granule, block_end);
            let first_line = space.line_index(object);
            let last_line = space.line_index(object + granules * GRANULE_SIZE - 1);
            for line in &space.lines[first_line..=last_line] {
                line.mark();
            }
        }
        self.push(object);
    }

    fn push(&mut self, object: usize) {
        let space = self.space;
        let grey = &space.grey;
        if let Some(out) = self.out.as_mut() {
            if out.push(object) {
                return;
            }
        }
        if let Some(full) = self.out.take() {
            grey.give_full(full);
        }
        match grey.take_empty() {
            Some(mut packet) => {
                packet.push(object);
                self.out = Some(packet);
            }
            None => self.overflow.push(object),
        }
    }

    fn scan(&mut self, object: usize) {
        self.scanned += 1;
        let info = match unsafe { object::type_info(object) } {
            Some(info) => info,
            None => return,
        };
        let size = self.space.object_size(object);
        match info.kind {
            ObjectKind::Plain => {
                for &offset in info.ref_offsets {
                    if (offset + 1) * WORD_SIZE > size {
                        continue;
                    }
                    let value = unsafe { object::read_word(object, offset) };
                    self.mark_precise(value);
                }
            }
            ObjectKind::RefArray => {
                let capacity = size.saturating_sub(ARRAY_HEADER_SIZE) / WORD_SIZE;
                let length = unsafe { object::array_length(object) }.min(capacity);
                let first = ARRAY_HEADER_SIZE / WORD_SIZE;
                for index in first..first + length {
                    let value = unsafe { object::read_word(object, index) };
                    self.mark_precise(value);
                }
            }
            ObjectKind::ValueArray => {}
        }
    }

    /// Drains the overflow stack and full packets until no shared work is
    /// left, then publishes the output packet.
    pub fn mark(&mut self) {
        let space = self.space;
        let grey = &space.grey;
        loop {
            while let Some(object) = self.overflow.pop() {
                self.scan(object);
            }
            let mut packet = match grey.take_full() {
                Some(packet) => packet,
                None => match self.out.take() {
                    Some(own) if !own.is_empty() => own,
                    Some(own) => {
                        grey.give_empty(own);
                        break;
                    }
                    None => break,
                },
            };
            while let Some(object) = packet.pop() {
                self.scan(object);
            }
            grey.give_empty(packet);
        }
        self.flush();
    }

    /// Publishes the output packet, if any.
    pub fn flush(&mut self) {
        if let Some(out) = self.out.take() {
            self.space.grey.give_full(out);
        }
    }

    pub fn has_overflow(&self) -> bool {
        !self.overflow.is_empty()
    }
}

impl Drop for Marker<'_> {
    fn drop(&mut self) {
        self.flush();
        debug_assert!(!self.has_overflow(), "marker dropped with unscanned objects");
    }
}
