use std::sync::Arc;

use crate::{
    allocator::BumpAllocator,
    gc_thread::{GcThreads, Phase},
    globals::{BLOCK_SIZE, GRANULE_SIZE, LARGE_BLOCK_SIZE, LAZY_SWEEP_MIN_BATCH, SWEEP_BATCH_SIZE},
    large_allocator::{chunks_for, GRANULES_IN_CHUNK},
    marking::Marker,
    object::{write_word, TypeInfo},
    object_meta::GranuleState,
    settings::{clamp_gc_threads, default_gc_threads},
    space::{BlockCensus, Space},
    statistics::{formatted_size, GcEvent, HeapStatistics, NoopRecorder, Recorder},
    sweeper,
    visitor::RootVisitor,
    Config,
};

/// Root provider run at the start of every collection.
pub type Constraint = Box<dyn FnMut(&mut RootVisitor)>;

/// The mutator's handle on the heap.
///
/// Allocation and root marking happen on the thread owning the `Heap`;
/// marking and sweeping are shared with the collector threads.
pub struct Heap {
    threads: GcThreads,
    space: Arc<Space>,
    allocator: BumpAllocator,
    constraints: Vec<Constraint>,
    collections: usize,
    bytes_allocated: usize,
    objects_allocated: usize,
}

#[inline]
fn align_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

impl Heap {
    /// Creates a heap, exiting the process when the address space cannot be
    /// reserved.
    pub fn new(config: Config) -> Self {
        match Self::try_new(config, Arc::new(NoopRecorder)) {
            Ok(heap) => heap,
            Err(e) => {
                log::error!("failed to create heap: {}", e);
                eprintln!("commix: failed to create heap: {}", e);
                std::process::exit(1)
            }
        }
    }

    pub fn try_new(config: Config, recorder: Arc<dyn Recorder>) -> std::io::Result<Self> {
        let gc_threads = match config.gc_threads {
            0 => default_gc_threads(),
            n => clamp_gc_threads(n),
        };
        let space = Arc::new(Space::new(&config, gc_threads, recorder)?);
        let threads = GcThreads::spawn(&space)?;
        Ok(Self {
            threads,
            space,
            allocator: BumpAllocator::new(),
            constraints: Vec::new(),
            collections: 0,
            bytes_allocated: 0,
            objects_allocated: 0,
        })
    }

    pub fn space(&self) -> &Space {
        &self.space
    }

    /// Add a root constraint. Every constraint runs when marking starts and
    /// reports roots through the visitor.
    pub fn add_constraint(&mut self, constraint: impl FnMut(&mut RootVisitor) + 'static) {
        self.constraints.push(Box::new(constraint));
    }

    /// Allocates `size` bytes, dispatching on the size class.
    pub fn allocate(&mut self, info: &'static TypeInfo, size: usize) -> *mut u8 {
        if align_up(size, GRANULE_SIZE) >= LARGE_BLOCK_SIZE {
            self.allocate_large(info, size)
        } else {
            self.allocate_small(info, size)
        }
    }

    /// Allocates a zeroed object with word 0 set to `info`. Sizes rounding up
    /// to [`LARGE_BLOCK_SIZE`] or more are handed to [`Heap::allocate_large`].
    pub fn allocate_small(&mut self, info: &'static TypeInfo, size: usize) -> *mut u8 {
        let size = align_up(size.max(GRANULE_SIZE), GRANULE_SIZE);
        if size >= LARGE_BLOCK_SIZE {
            return self.allocate_large(info, size);
        }
        let start = match self.allocator.alloc(&self.space, size) {
            Some(start) => start,
            None => self.allocate_small_slow(size),
        };
        self.space
            .granules
            .set_allocated(self.space.granule_index(start), size / GRANULE_SIZE);
        self.finish_allocation(info, start, size)
    }

    #[cold]
    fn allocate_small_slow(&mut self, size: usize) -> usize {
        let try_alloc = |heap: &mut Self| heap.allocator.alloc(&heap.space, size);
        if let Some(start) = self.lazy_sweep(try_alloc) {
            return start;
        }
        self.collect();
        if let Some(start) = try_alloc(self).or_else(|| self.lazy_sweep(try_alloc)) {
            return start;
        }
        let blocks = if self.allocator.can_init_cursors(&self.space) {
            1
        } else {
            2
        };
        if self.space.grow(blocks) {
            if let Some(start) = try_alloc(self) {
                return start;
            }
        }
        self.out_of_memory(size)
    }

    /// Allocates a zeroed object of at least [`LARGE_BLOCK_SIZE`] bytes in a
    /// superblock, with word 0 set to `info`.
    pub fn allocate_large(&mut self, info: &'static TypeInfo, size: usize) -> *mut u8 {
        let size = align_up(size.max(LARGE_BLOCK_SIZE), LARGE_BLOCK_SIZE);
        let start = match self.try_allocate_large(size) {
            Some(start) => start,
            None => self.allocate_large_slow(size),
        };
        let space = &self.space;
        unsafe {
            space.zero(start, size);
        }
        let head = space.granule_index(start);
        space.granules.set_state(head, GranuleState::Allocated);
        for chunk in 1..chunks_for(size) as usize {
            space
                .granules
                .set_state(head + chunk * GRANULES_IN_CHUNK, GranuleState::Placeholder);
        }
        self.finish_allocation(info, start, size)
    }

    fn try_allocate_large(&self, size: usize) -> Option<usize> {
        let space = &self.space;
        space
            .large
            .get_chunk(&space.blocks, &space.block_allocator, size)
            .map(|chunk| space.chunk_address(chunk))
    }

    #[cold]
    fn allocate_large_slow(&mut self, size: usize) -> usize {
        let try_alloc = |heap: &mut Self| heap.try_allocate_large(size);
        if let Some(start) = self.lazy_sweep(try_alloc) {
            return start;
        }
        self.collect();
        if let Some(start) = try_alloc(self).or_else(|| self.lazy_sweep(try_alloc)) {
            return start;
        }
        let blocks = align_up(size, BLOCK_SIZE) / BLOCK_SIZE;
        if self.space.grow(blocks as u32) {
            if let Some(start) = try_alloc(self) {
                return start;
            }
        }
        self.out_of_memory(size)
    }

    fn finish_allocation(&mut self, info: &'static TypeInfo, start: usize, size: usize) -> *mut u8 {
        unsafe {
            write_word(start as *mut u8, 0, info as *const TypeInfo as usize);
        }
        self.bytes_allocated += size;
        self.objects_allocated += 1;
        start as *mut u8
    }

    /// Sweeps on the mutator in small batches until `try_alloc` succeeds or
    /// the sweep is over.
    fn lazy_sweep(&mut self, mut try_alloc: impl FnMut(&mut Self) -> Option<usize>) -> Option<usize> {
        let space = self.space.clone();
        if space.sweep.is_done() {
            return None;
        }
        let started = space.now_ns();
        let result = sweeper::sweep_until(&space, LAZY_SWEEP_MIN_BATCH, || try_alloc(self));
        space.record(GcEvent::LazySweep, started);
        result
    }

    /// Sweeps whatever is left of the current cycle on the mutator.
    pub fn finish_sweep(&mut self) {
        if !self.space.sweep.is_done() {
            sweeper::finish_sweep(&self.space, 0, SWEEP_BATCH_SIZE);
        }
    }

    /// Runs a full collection: roots and marking with the world stopped,
    /// then starts the concurrent sweep and returns.
    pub fn collect(&mut self) {
        let space = self.space.clone();
        let started = space.now_ns();
        self.finish_sweep();
        self.threads.join_all();
        log::debug!("collection {} started", self.collections + 1);

        {
            let mut marker = Marker::new(&space);
            let roots_started = space.now_ns();
            {
                let mut visitor = RootVisitor::new(&mut marker);
                for constraint in self.constraints.iter_mut() {
                    constraint(&mut visitor);
                }
                log::trace!("root constraints visited {} words", visitor.visited());
            }
            marker.flush();
            space.record(GcEvent::MarkRoots, roots_started);

            let mark_started = space.now_ns();
            space.control.set_phase(Phase::Mark);
            self.threads.wake(self.threads.count());
            while !space.grey.is_done() {
                marker.mark();
                std::thread::yield_now();
            }
            self.threads.join_all();
            // markers that ran out of packets may have published work late
            marker.mark();
            debug_assert!(space.grey.is_done());
            space.record(GcEvent::Mark, mark_started);
            log::debug!("marking done, mutator scanned {} objects", marker.scanned());
        }

        self.recycle();
        self.collections += 1;
        space.record(GcEvent::Collection, started);
        if space.verbose {
            eprintln!(
                "[commix] collection #{} in {:.3} ms, heap {}",
                self.collections,
                (space.now_ns() - started) as f64 / 1e6,
                formatted_size(space.block_count() as usize * BLOCK_SIZE)
            );
        }
    }

    /// Drops every free list and launches the sweep of all current blocks.
    fn recycle(&mut self) {
        let space = &self.space;
        self.allocator.clear();
        space.block_allocator.clear();
        space.recycled_blocks.clear();
        space.large.clear();
        space.sweep.reset(space.block_count());
        space.control.set_phase(Phase::Sweep);
        self.threads.wake(self.threads.count());
    }

    /// Write notification. Marking never overlaps mutation and the heap is
    /// not generational, so there is nothing to record.
    #[inline]
    pub fn write_barrier(&mut self, _object: *mut u8) {}

    /// Block counts by state. Finishes the current sweep first.
    pub fn block_census(&mut self) -> BlockCensus {
        self.finish_sweep();
        self.space.block_census()
    }

    pub fn statistics(&self) -> HeapStatistics {
        let space = &self.space;
        HeapStatistics {
            block_count: space.block_count() as usize,
            max_block_count: space.max_block_count() as usize,
            free_blocks: space.block_allocator.free_block_count() as usize,
            recyclable_blocks: space.recycled_blocks.len() as usize,
            large_free_chunks: space.large.free_chunk_count() as usize,
            total_gc_cycles_count: self.collections,
            total_memory_allocated: self.bytes_allocated,
            total_objects_allocated: self.objects_allocated,
            gc_threads: self.threads.count(),
        }
    }

    #[cold]
    fn out_of_memory(&self, size: usize) -> ! {
        let space = &self.space;
        log::error!(
            "out of memory: cannot allocate {} with a heap of {} (limit {})",
            formatted_size(size),
            formatted_size(space.block_count() as usize * BLOCK_SIZE),
            formatted_size(space.max_block_count() as usize * BLOCK_SIZE)
        );
        eprintln!(
            "commix: out of memory allocating {} bytes\n{:?}",
            size,
            backtrace::Backtrace::new()
        );
        std::process::exit(1)
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.finish_sweep();
        self.threads.join_all();
    }
}
