//! Heap geometry and collector tuning constants.

pub const WORD_SIZE: usize = core::mem::size_of::<usize>();

/// Allocation alignment. Every object starts on a granule boundary.
pub const GRANULE_SIZE_BITS: usize = 4;
pub const GRANULE_SIZE: usize = 1 << GRANULE_SIZE_BITS;

pub const LINE_SIZE_BITS: usize = 8;
pub const LINE_SIZE: usize = 1 << LINE_SIZE_BITS;

pub const BLOCK_SIZE_BITS: usize = 15;
pub const BLOCK_SIZE: usize = 1 << BLOCK_SIZE_BITS;

pub const LINE_COUNT: usize = BLOCK_SIZE / LINE_SIZE;
pub const GRANULES_IN_LINE: usize = LINE_SIZE / GRANULE_SIZE;
pub const GRANULES_IN_BLOCK: usize = BLOCK_SIZE / GRANULE_SIZE;

/// Objects larger than one line go through the overflow cursor.
pub const MEDIUM_CUTOFF: usize = LINE_SIZE;

/// Objects of at least this size are served by the large allocator. Large
/// chunks are also carved in units of this size.
pub const LARGE_BLOCK_SIZE_BITS: usize = 13;
pub const LARGE_BLOCK_SIZE: usize = 1 << LARGE_BLOCK_SIZE_BITS;
pub const CHUNKS_IN_BLOCK: usize = BLOCK_SIZE / LARGE_BLOCK_SIZE;

pub const BLOCK_COUNT_BITS: usize = 24;
pub const MAX_BLOCK_COUNT: usize = 1 << BLOCK_COUNT_BITS;
/// One list per power of two up to the largest possible superblock.
pub const SUPERBLOCK_LIST_SIZE: usize = BLOCK_COUNT_BITS + 1;

pub const GREY_PACKET_SIZE: usize = 2048;
/// Items that fit in a packet next to its size, link and pop counter.
pub const GREY_PACKET_ITEMS: usize = GREY_PACKET_SIZE / WORD_SIZE - 2;
pub const GREY_PACKET_RATIO: f64 = 0.01;
pub const MIN_GREY_PACKETS: usize = 64;
pub const MAX_GREY_PACKETS: usize = 4096;

pub const SWEEP_BATCH_SIZE: u32 = 32;
pub const LAZY_SWEEP_MIN_BATCH: u32 = 4;

pub const MIN_HEAP_SIZE: usize = 1024 * 1024;
pub const DEFAULT_MIN_HEAP_SIZE: usize = 128 * BLOCK_SIZE;
/// Below this many bytes the heap grows by [`EARLY_GROWTH_RATE`].
pub const EARLY_GROWTH_THRESHOLD: usize = 128 * 1024 * 1024;
pub const EARLY_GROWTH_RATE: f64 = 2.0;
pub const GROWTH_RATE: f64 = 1.414213562;

pub const MAX_GC_THREADS: usize = 8;
