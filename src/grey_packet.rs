//! Fixed capacity work packets shared between markers.
//!
//! Every packet is either owned by exactly one marker or linked into one of
//! the two global lists: empty packets and full (non-empty) packets.
use std::{
    cell::UnsafeCell,
    sync::atomic::{fence, AtomicU32, Ordering},
};

use crate::{
    globals::{GREY_PACKET_ITEMS, GREY_PACKET_RATIO, GREY_PACKET_SIZE, MAX_GREY_PACKETS, MIN_GREY_PACKETS},
    internal::block_list::{IndexList, Linked},
    mmap::{MetaArena, ZeroInit},
};

pub struct GreyPacket {
    next: AtomicU32,
    size: AtomicU32,
    items: UnsafeCell<[usize; GREY_PACKET_ITEMS]>,
}

// Items are only touched by the packet's current owner. Ownership moves
// through the lists, whose updates are release/acquire.
unsafe impl Sync for GreyPacket {}
unsafe impl ZeroInit for GreyPacket {}

impl Linked for GreyPacket {
    fn link(&self) -> &AtomicU32 {
        &self.next
    }
}

/// Exclusive handle on a packet taken from one of the lists.
pub struct OwnedPacket<'a> {
    index: u32,
    packet: &'a GreyPacket,
}

impl<'a> OwnedPacket<'a> {
    #[inline]
    pub fn len(&self) -> usize {
        self.packet.size.load(Ordering::Relaxed) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() == GREY_PACKET_ITEMS
    }

    /// Returns false when the packet is full.
    #[inline]
    pub fn push(&mut self, object: usize) -> bool {
        let len = self.len();
        if len == GREY_PACKET_ITEMS {
            return false;
        }
        unsafe {
            (*self.packet.items.get())[len] = object;
        }
        self.packet.size.store(len as u32 + 1, Ordering::Relaxed);
        true
    }

    #[inline]
    pub fn pop(&mut self) -> Option<usize> {
        let len = self.len();
        if len == 0 {
            return None;
        }
        self.packet.size.store(len as u32 - 1, Ordering::Relaxed);
        Some(unsafe { (*self.packet.items.get())[len - 1] })
    }
}

pub struct GreyPackets {
    packets: MetaArena<GreyPacket>,
    empty: IndexList,
    full: IndexList,
    total: u32,
}

impl GreyPackets {
    /// Sizes the packet arena from the largest heap this collector may reach.
    pub fn packet_count_for(max_heap_size: usize) -> usize {
        let budget = (max_heap_size as f64 * GREY_PACKET_RATIO) as usize;
        (budget / GREY_PACKET_SIZE).max(MIN_GREY_PACKETS).min(MAX_GREY_PACKETS)
    }

    pub fn new(count: usize) -> std::io::Result<Self> {
        let packets = MetaArena::<GreyPacket>::new("grey packets", count)?;
        let empty = IndexList::new();
        for index in (0..count as u32).rev() {
            empty.push(&packets, index);
        }
        Ok(Self {
            packets,
            empty,
            full: IndexList::new(),
            total: count as u32,
        })
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    fn own(&self, index: u32) -> OwnedPacket<'_> {
        OwnedPacket {
            index,
            packet: &self.packets[index as usize],
        }
    }

    pub fn take_empty(&self) -> Option<OwnedPacket<'_>> {
        let packet = self.own(self.empty.pop(&self.packets)?);
        debug_assert!(packet.is_empty());
        Some(packet)
    }

    pub fn take_full(&self) -> Option<OwnedPacket<'_>> {
        let index = self.full.pop(&self.packets)?;
        // pairs with the release in `give_full`, makes the items visible
        fence(Ordering::Acquire);
        Some(self.own(index))
    }

    pub fn give_empty(&self, packet: OwnedPacket<'_>) {
        debug_assert!(packet.is_empty());
        self.empty.push(&self.packets, packet.index);
    }

    /// Publishes a packet with work. Empty packets go back to the empty list.
    pub fn give_full(&self, packet: OwnedPacket<'_>) {
        if packet.is_empty() {
            return self.give_empty(packet);
        }
        fence(Ordering::Release);
        self.full.push(&self.packets, packet.index);
    }

    pub fn has_full(&self) -> bool {
        !self.full.is_empty()
    }

    /// Marking is finished once every packet is back on the empty list.
    pub fn is_done(&self) -> bool {
        self.empty.len() == self.total
    }
}
