//! # commix
//!
//! A concurrent mark-region garbage collected heap in the Immix family.
//!
//! The heap is carved into 32 KiB blocks of 256 byte lines. Small objects are
//! bump allocated into runs of free lines, objects of 8 KiB and more get
//! chunks of contiguous blocks (superblocks). Collection marks from roots
//! reported by constraints with a pool of collector threads sharing grey
//! packets, then sweeps concurrently with allocation: the mutator and the
//! collector threads claim batches of blocks from a shared cursor, and free
//! runs found on batch edges are coalesced lazily.
//!
//! Objects carry a `*const TypeInfo` in their first word, which tells the
//! marker where their references are. See [`object`].
//!
//! ```no_run
//! use commix::{heap::Heap, object::TypeInfo, Config};
//!
//! static NODE: TypeInfo = TypeInfo::plain(1, "Node", &[1, 2]);
//!
//! let mut heap = Heap::new(Config::from_env());
//! let node = heap.allocate(&NODE, 24);
//! heap.add_constraint(move |roots| roots.visit_precise(node as usize));
//! heap.collect();
//! ```
pub mod allocator;
pub mod block;
pub mod block_allocator;
pub mod block_range;
pub mod gc_thread;
pub mod globals;
pub mod grey_packet;
pub mod heap;
pub mod internal;
pub mod large_allocator;
pub mod marking;
pub mod mmap;
pub mod object;
pub mod object_meta;
pub mod settings;
pub mod space;
pub mod statistics;
pub mod sweeper;
pub mod visitor;

#[cfg(test)]
mod tests;

use globals::{DEFAULT_MIN_HEAP_SIZE, EARLY_GROWTH_RATE, EARLY_GROWTH_THRESHOLD, GROWTH_RATE};

/// Configuration for heap constructor.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Initial heap size. Never below one MiB.
    pub min_heap_size: usize,
    /// Heap size limit, clamped to the physical memory.
    pub max_heap_size: usize,
    /// Collector threads, `0` picks one per core minus one.
    pub gc_threads: usize,
    /// Below this heap size the heap grows by `early_growth_rate`.
    pub early_growth_threshold: usize,
    pub early_growth_rate: f64,
    pub growth_rate: f64,
    /// The heap grows when fewer blocks than this ratio are free after a
    /// sweep...
    pub min_free_ratio: f64,
    /// ...or when more than this ratio are neither free nor recyclable.
    pub max_unavailable_ratio: f64,
    /// Enables verbose printing
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_heap_size: DEFAULT_MIN_HEAP_SIZE,
            max_heap_size: usize::MAX,
            gc_threads: 0,
            early_growth_threshold: EARLY_GROWTH_THRESHOLD,
            early_growth_rate: EARLY_GROWTH_RATE,
            growth_rate: GROWTH_RATE,
            min_free_ratio: 0.5,
            max_unavailable_ratio: 0.25,
            verbose: false,
        }
    }
}

pub mod c_api {
    use crate::{heap::Heap, object::TypeInfo, visitor::RootVisitor, Config};

    #[no_mangle]
    pub extern "C" fn commix_default_config() -> Config {
        Config::default()
    }

    /// Default configuration overridden by the `COMMIX_*` environment
    /// variables.
    #[no_mangle]
    pub extern "C" fn commix_config_from_env() -> Config {
        Config::from_env()
    }

    #[no_mangle]
    pub extern "C" fn commix_heap_create(config: Config) -> *mut Heap {
        Box::into_raw(Box::new(Heap::new(config)))
    }

    /// Free commix heap
    #[no_mangle]
    pub unsafe extern "C" fn commix_heap_free(heap: *mut Heap) {
        if !heap.is_null() {
            drop(Box::from_raw(heap));
        }
    }

    /// Objects smaller than 8 KiB. Never returns NULL, the process exits
    /// when the heap cannot grow any further.
    #[no_mangle]
    pub unsafe extern "C" fn commix_allocate_small(
        heap: *mut Heap,
        info: *const TypeInfo,
        size: usize,
    ) -> *mut u8 {
        (*heap).allocate_small(&*info, size)
    }

    #[no_mangle]
    pub unsafe extern "C" fn commix_allocate_large(
        heap: *mut Heap,
        info: *const TypeInfo,
        size: usize,
    ) -> *mut u8 {
        (*heap).allocate_large(&*info, size)
    }

    #[no_mangle]
    pub unsafe extern "C" fn commix_collect(heap: *mut Heap) {
        (*heap).collect();
    }

    #[no_mangle]
    pub unsafe extern "C" fn commix_write_barrier(heap: *mut Heap, object: *mut u8) {
        (*heap).write_barrier(object);
    }

    /// Registers `callback(data, visitor)` to report roots at the start of
    /// every collection.
    #[no_mangle]
    pub unsafe extern "C" fn commix_add_root_constraint(
        heap: *mut Heap,
        data: *mut u8,
        callback: extern "C" fn(*mut u8, *mut RootVisitor),
    ) {
        (*heap).add_constraint(move |visitor: &mut RootVisitor| {
            callback(data, visitor as *mut RootVisitor);
        });
    }

    #[no_mangle]
    pub unsafe extern "C" fn commix_trace_conservatively(
        visitor: *mut RootVisitor,
        from: *const u8,
        to: *const u8,
    ) {
        (*visitor).visit_conservative(from, to);
    }

    #[no_mangle]
    pub unsafe extern "C" fn commix_trace_precise(visitor: *mut RootVisitor, value: usize) {
        (*visitor).visit_precise(value);
    }
}
