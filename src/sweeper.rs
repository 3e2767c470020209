//! Batch sweeping, lazy coalescing and post-sweep.
//!
//! After marking, the sweep cursor walks `[0, limit)` where `limit` is the
//! block count at the start of the cycle. Participants (the mutator and the
//! collector threads) claim batches with `fetch_add` on the cursor. Each
//! participant publishes in its `cursor_done` slot the lowest block it may
//! still be sweeping, so that the coalescer never looks at a block that is
//! being swept.
//!
//! Free runs that lie strictly inside a batch go straight to the block pool.
//! Runs touching a batch boundary could continue in a neighbouring batch, so
//! their first block is flagged `CoalescePending { len }` and the coalescer
//! hands them over in address order, merging neighbours on the way.
use std::sync::atomic::{fence, AtomicBool, AtomicU32, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

use crate::{
    block::{BlockFlag, BlockState},
    block_range::{AtomicBlockRange, BlockRange},
    globals::{GRANULES_IN_BLOCK, GRANULES_IN_LINE, LINE_COUNT},
    large_allocator::SuperblockSweep,
    space::Space,
    statistics::GcEvent,
};

/// `cursor_done` of a participant that is not sweeping.
pub const IDLE: u32 = u32::MAX;

pub struct SweepState {
    cursor: CachePadded<AtomicU32>,
    limit: AtomicU32,
    /// `(coalesce_done, claimed)`. Equal values mean nobody is coalescing.
    coalesce: AtomicBlockRange,
    post_sweep_claimed: AtomicBool,
    post_sweep_done: AtomicBool,
    cursor_done: Box<[CachePadded<AtomicU32>]>,
}

impl SweepState {
    pub fn new(participants: usize) -> Self {
        Self {
            cursor: CachePadded::new(AtomicU32::new(0)),
            limit: AtomicU32::new(0),
            coalesce: AtomicBlockRange::new(BlockRange::EMPTY),
            post_sweep_claimed: AtomicBool::new(true),
            post_sweep_done: AtomicBool::new(true),
            cursor_done: (0..participants)
                .map(|_| CachePadded::new(AtomicU32::new(IDLE)))
                .collect(),
        }
    }

    /// Starts a cycle over the first `limit` blocks. No participant may be
    /// sweeping.
    pub fn reset(&self, limit: u32) {
        for slot in self.cursor_done.iter() {
            slot.store(IDLE, Ordering::Relaxed);
        }
        self.limit.store(limit, Ordering::Relaxed);
        self.coalesce.store(BlockRange::EMPTY);
        self.post_sweep_claimed.store(false, Ordering::Relaxed);
        self.post_sweep_done.store(false, Ordering::Relaxed);
        self.cursor.store(0, Ordering::SeqCst);
    }

    #[inline]
    pub fn limit(&self) -> u32 {
        self.limit.load(Ordering::Acquire)
    }

    /// Whether every batch has been claimed. Claimed batches may still be
    /// running.
    #[inline]
    pub fn is_claimed(&self) -> bool {
        self.cursor.load(Ordering::Acquire) >= self.limit()
    }

    #[inline]
    pub fn is_coalescing_done(&self) -> bool {
        let claim = self.coalesce.load();
        claim.first == claim.limit && claim.first >= self.limit()
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.post_sweep_done.load(Ordering::Acquire)
    }

    /// Lowest block that may still be under a sweeper: the cursor, read
    /// first, or any participant's published progress.
    fn min_cursor_done(&self) -> u32 {
        let cursor = self.cursor.load(Ordering::SeqCst).min(self.limit());
        self.cursor_done
            .iter()
            .map(|slot| slot.load(Ordering::SeqCst))
            .fold(cursor, u32::min)
    }
}

/// Claims and sweeps one batch of up to `max_count` blocks as
/// `participant`. Returns false when nothing was left to claim.
pub fn sweep(space: &Space, participant: usize, max_count: u32) -> bool {
    let state = &space.sweep;
    let done = &state.cursor_done[participant];
    let limit = state.limit();
    done.store(state.cursor.load(Ordering::SeqCst).min(limit), Ordering::SeqCst);
    let start = state.cursor.fetch_add(max_count, Ordering::SeqCst);
    if start >= limit {
        done.store(IDLE, Ordering::SeqCst);
        return false;
    }
    let end = (start + max_count).min(limit);
    done.store(start, Ordering::SeqCst);

    let started = space.now_ns();
    let freed = sweep_batch(space, start, end);
    done.store(IDLE, Ordering::SeqCst);
    space.record(GcEvent::SweepBatch, started);
    log::trace!(
        "participant {} swept blocks [{}, {}), {} freed",
        participant,
        start,
        end,
        freed
    );
    true
}

/// Tracks the free run being built while walking a batch.
struct FreeRun<'a> {
    space: &'a Space,
    start: u32,
    end: u32,
    run: Option<(u32, u32)>,
    freed: u32,
}

impl<'a> FreeRun<'a> {
    fn extend(&mut self, first: u32, len: u32) {
        self.freed += len;
        self.run = match self.run {
            Some((run_first, run_len)) => {
                debug_assert_eq!(run_first + run_len, first);
                Some((run_first, run_len + len))
            }
            None => Some((first, len)),
        };
    }

    fn close(&mut self) {
        let (first, len) = match self.run.take() {
            Some(run) => run,
            None => return,
        };
        let space = self.space;
        if first == self.start || first + len >= self.end {
            space.blocks[first as usize].set_state(BlockState::CoalescePending { len });
        } else {
            space
                .block_allocator
                .add_free_blocks(&space.blocks, first, len);
        }
    }
}

/// Sweeps blocks `[start, end)`. Superblocks starting inside may reach past
/// `end`; their blocks out there are only ever moved between middle and
/// pending.
fn sweep_batch(space: &Space, start: u32, end: u32) -> u32 {
    let mut run = FreeRun {
        space,
        start,
        end,
        run: None,
        freed: 0,
    };
    let mut index = start;
    while index < end {
        let block = space.block(index);
        match block.flag() {
            BlockFlag::SuperblockMiddle | BlockFlag::CoalescePending => {
                run.close();
                index += 1;
            }
            BlockFlag::SuperblockStart => {
                match space
                    .large
                    .sweep_superblock(&space.granules, &space.blocks, index)
                {
                    SuperblockSweep::Dead { len } => {
                        run.extend(index, len);
                        index += len;
                    }
                    SuperblockSweep::Live { len, free_tail } => {
                        run.close();
                        index += len;
                        if free_tail > 0 {
                            run.extend(index, free_tail);
                            index += free_tail;
                        }
                    }
                }
            }
            BlockFlag::Marked => {
                run.close();
                sweep_marked_block(space, index);
                index += 1;
            }
            BlockFlag::Simple | BlockFlag::Free => {
                space
                    .granules
                    .clear(index as usize * GRANULES_IN_BLOCK, GRANULES_IN_BLOCK);
                run.extend(index, 1);
                index += 1;
            }
        }
    }
    run.close();
    run.freed
}

/// Unmarks a surviving block and threads its unmarked lines into the free
/// line records. Blocks with free lines are published on the recycled list.
fn sweep_marked_block(space: &Space, index: u32) {
    let first_line = index as usize * LINE_COUNT;
    let first_granule = index as usize * GRANULES_IN_BLOCK;
    let lines = &space.lines[first_line..first_line + LINE_COUNT];

    let mut first_free: Option<u8> = None;
    let mut previous: Option<(usize, usize)> = None;
    let mut dead = true;
    let mut line = 0;
    while line < LINE_COUNT {
        if lines[line].is_marked() {
            lines[line].unmark();
            space.granules.sweep(
                first_granule + line * GRANULES_IN_LINE,
                GRANULES_IN_LINE,
                &mut dead,
            );
            line += 1;
            continue;
        }
        let run_start = line;
        while line < LINE_COUNT && !lines[line].is_marked() {
            line += 1;
        }
        let size = line - run_start;
        space.granules.clear(
            first_granule + run_start * GRANULES_IN_LINE,
            size * GRANULES_IN_LINE,
        );
        dead = true;
        match previous {
            Some((prev_start, prev_size)) => space.free_lines[first_line + prev_start]
                .set(Some(run_start as u8), prev_size as u8),
            None => first_free = Some(run_start as u8),
        }
        previous = Some((run_start, size));
    }
    if let Some((last_start, last_size)) = previous {
        space.free_lines[first_line + last_start].set(None, last_size as u8);
    }

    let block = space.block(index);
    block.set_state(BlockState::Simple {
        first_free_line: first_free,
    });
    if first_free.is_some() {
        // make the free line records visible to the allocator popping it
        fence(Ordering::Release);
        space.recycled_blocks.push(&space.blocks, index);
    }
}

/// Hands pending runs below every participant's progress to the block pool.
/// Runs post-sweep once coalescing has reached the sweep limit.
pub fn lazy_coalesce(space: &Space) {
    let state = &space.sweep;
    let limit = state.limit();
    loop {
        let claim = state.coalesce.load();
        if claim.first != claim.limit {
            // someone else is coalescing
            return;
        }
        if claim.first >= limit {
            break;
        }
        let target = state.min_cursor_done();
        if target <= claim.first {
            return;
        }
        if state
            .coalesce
            .compare_exchange(claim, BlockRange::new(claim.first, target))
            .is_err()
        {
            continue;
        }
        let started = space.now_ns();
        let reached = coalesce(space, claim.first, target);
        state.coalesce.store(BlockRange::new(reached, reached));
        space.record(GcEvent::Coalesce, started);
        if reached < target {
            return;
        }
    }
    post_sweep(space);
}

/// Walks `[from, to)`. Stops at a pending run that reaches past `to`.
fn coalesce(space: &Space, from: u32, to: u32) -> u32 {
    let mut index = from;
    while index < to {
        match space.block(index).state() {
            BlockState::CoalescePending { len } => {
                if index + len > to {
                    break;
                }
                space
                    .block_allocator
                    .add_free_blocks(&space.blocks, index, len);
                index += len;
            }
            BlockState::SuperblockStart { len } => index += len.max(1),
            _ => index += 1,
        }
    }
    index
}

/// Runs once per cycle, by whoever first finds coalescing complete.
pub fn post_sweep(space: &Space) {
    let state = &space.sweep;
    if state
        .post_sweep_claimed
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }
    space.block_allocator.flush(&space.blocks);
    space.grow_if_needed();
    let census = (
        space.block_allocator.free_block_count(),
        space.recycled_blocks.len(),
    );
    state.post_sweep_done.store(true, Ordering::Release);
    log::debug!(
        "sweep finished: {} free, {} recyclable of {} blocks",
        census.0,
        census.1,
        space.block_count()
    );
}

/// Mutator-side sweeping in batches of `max_count`, stopping as soon as
/// `try_alloc` succeeds or the sweep is over. Once every batch is claimed the
/// mutator backs off a bounded number of times, then finishes the sweep in
/// place and retries once.
pub fn sweep_until(
    space: &Space,
    max_count: u32,
    mut try_alloc: impl FnMut() -> Option<usize>,
) -> Option<usize> {
    let backoff = Backoff::new();
    loop {
        let claimed = sweep(space, 0, max_count);
        lazy_coalesce(space);
        if let Some(start) = try_alloc() {
            return Some(start);
        }
        if space.sweep.is_done() {
            return None;
        }
        if !claimed {
            if backoff.is_completed() {
                finish_sweep(space, 0, max_count);
                return try_alloc();
            }
            backoff.snooze();
        }
    }
}

/// Sweeps in batches of `max_count` until every batch is claimed, then waits
/// for the post-sweep. Used by the mutator before starting a new cycle.
pub fn finish_sweep(space: &Space, participant: usize, max_count: u32) {
    while sweep(space, participant, max_count) {}
    let backoff = Backoff::new();
    while !space.sweep.is_done() {
        lazy_coalesce(space);
        backoff.snooze();
    }
}
