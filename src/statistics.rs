use parking_lot::Mutex;

/// Collector events reported to a [`Recorder`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GcEvent {
    /// Stop-the-world root marking on the mutator.
    MarkRoots,
    /// Parallel marking, from waking the pool to fixation.
    Mark,
    /// One sweep batch.
    SweepBatch,
    /// Sweep on a collector thread, from wake up to its last batch.
    ConcurrentSweep,
    /// Mutator time spent sweeping inline while allocating.
    LazySweep,
    /// Pending runs handed to the block pool.
    Coalesce,
    /// Whole collection as seen by the mutator.
    Collection,
}

/// Sink for collector timings, in nanoseconds since heap creation.
pub trait Recorder: Send + Sync {
    fn record(&self, event: GcEvent, start_ns: u64, end_ns: u64);
}

pub struct NoopRecorder;

impl Recorder for NoopRecorder {
    fn record(&self, _event: GcEvent, _start_ns: u64, _end_ns: u64) {}
}

/// Keeps every event in memory.
#[derive(Default)]
pub struct EventLog {
    events: Mutex<Vec<(GcEvent, u64, u64)>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(GcEvent, u64, u64)> {
        self.events.lock().clone()
    }

    pub fn count(&self, event: GcEvent) -> usize {
        self.events.lock().iter().filter(|e| e.0 == event).count()
    }

    /// Total time spent in `event`.
    pub fn total_ns(&self, event: GcEvent) -> u64 {
        self.events
            .lock()
            .iter()
            .filter(|e| e.0 == event)
            .map(|e| e.2.saturating_sub(e.1))
            .sum()
    }
}

impl Recorder for EventLog {
    fn record(&self, event: GcEvent, start_ns: u64, end_ns: u64) {
        self.events.lock().push((event, start_ns, end_ns));
    }
}

pub struct HeapStatistics {
    pub block_count: usize,
    pub max_block_count: usize,
    pub free_blocks: usize,
    pub recyclable_blocks: usize,
    pub large_free_chunks: usize,
    pub total_gc_cycles_count: usize,
    pub total_memory_allocated: usize,
    pub total_objects_allocated: usize,
    pub gc_threads: usize,
}

pub struct FormattedSize {
    pub size: usize,
}

impl std::fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ksize = (self.size as f64) / 1024f64;

        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }

        let msize = ksize / 1024f64;

        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }

        let gsize = msize / 1024f64;

        if gsize < 1f64 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

pub fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size }
}

impl std::fmt::Display for HeapStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use crate::globals::BLOCK_SIZE;
        writeln!(f, "Heap statistics:")?;
        writeln!(
            f,
            "  Heap size: {} of {}",
            formatted_size(self.block_count * BLOCK_SIZE),
            formatted_size(self.max_block_count * BLOCK_SIZE)
        )?;
        writeln!(
            f,
            "  Blocks: {} ({} free, {} recyclable)",
            self.block_count, self.free_blocks, self.recyclable_blocks
        )?;
        writeln!(f, "  Free large chunks: {}", self.large_free_chunks)?;
        writeln!(f, "  GC threads: {}", self.gc_threads)?;
        writeln!(f, "  Total GC cycles count: {}", self.total_gc_cycles_count)?;
        writeln!(
            f,
            "  Total memory allocated: {}",
            formatted_size(self.total_memory_allocated)
        )?;
        writeln!(
            f,
            "  Total objects allocated: {}",
            self.total_objects_allocated
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_format_with_units() {
        assert_eq!(formatted_size(512).to_string(), "512B");
        assert_eq!(formatted_size(1536).to_string(), "1.5K");
        assert_eq!(formatted_size(3 * 1024 * 1024).to_string(), "3.0M");
        assert_eq!(formatted_size(2 * 1024 * 1024 * 1024).to_string(), "2.0G");
    }

    #[test]
    fn event_log_accumulates() {
        let log = EventLog::new();
        log.record(GcEvent::Mark, 10, 25);
        log.record(GcEvent::Mark, 30, 35);
        log.record(GcEvent::SweepBatch, 40, 41);
        assert_eq!(log.count(GcEvent::Mark), 2);
        assert_eq!(log.total_ns(GcEvent::Mark), 20);
        assert_eq!(log.events().len(), 3);
    }
}
