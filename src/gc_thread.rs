//! Collector thread pool.
//!
//! Threads sleep on one of two counting semaphores: thread 0 (the master) on
//! `start_master`, the others on `start_workers`. Once woken a thread reads
//! the phase and runs the matching routine until it runs out of work. The
//! phase only changes from the mutator, between [`GcThreads::join_all`] and
//! the next [`GcThreads::wake`].
use std::{
    sync::{
        atomic::{fence, AtomicBool, AtomicU8, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use crossbeam_utils::{Backoff, CachePadded};
use parking_lot::{Condvar, Mutex};

use crate::{
    globals::SWEEP_BATCH_SIZE,
    marking::Marker,
    space::Space,
    statistics::GcEvent,
    sweeper,
};

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle = 0,
    Mark = 1,
    Sweep = 2,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Phase::Mark,
            2 => Phase::Sweep,
            _ => Phase::Idle,
        }
    }
}

/// Counting semaphore.
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    pub fn post(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cond.notify_one();
    }

    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }

    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock();
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }
}

/// Phase and wake-up state shared with the collector threads.
pub struct Control {
    phase: AtomicU8,
    start_master: Semaphore,
    start_workers: Semaphore,
    active: Box<[CachePadded<AtomicBool>]>,
    shutdown: AtomicBool,
}

impl Control {
    pub fn new(threads: usize) -> Self {
        Self {
            phase: AtomicU8::new(Phase::Idle as u8),
            start_master: Semaphore::new(0),
            start_workers: Semaphore::new(0),
            active: (0..threads)
                .map(|_| CachePadded::new(AtomicBool::new(false)))
                .collect(),
            shutdown: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }

    pub fn any_active(&self) -> bool {
        self.active.iter().any(|flag| flag.load(Ordering::SeqCst))
    }
}

/// Handles of the running collector threads. Dropping it stops them.
pub struct GcThreads {
    space: Arc<Space>,
    handles: Vec<JoinHandle<()>>,
}

impl GcThreads {
    pub fn spawn(space: &Arc<Space>) -> std::io::Result<Self> {
        let mut threads = Self {
            space: space.clone(),
            handles: Vec::with_capacity(space.gc_threads()),
        };
        for id in 0..space.gc_threads() {
            let space = space.clone();
            let handle = std::thread::Builder::new()
                .name(format!("commix-gc-{}", id))
                .spawn(move || run(space, id))?;
            threads.handles.push(handle);
        }
        log::debug!("started {} collector threads", threads.handles.len());
        Ok(threads)
    }

    pub fn count(&self) -> usize {
        self.handles.len()
    }

    /// Wakes the master and `count - 1` workers.
    pub fn wake(&self, count: usize) {
        let count = count.min(self.handles.len());
        if count == 0 {
            return;
        }
        let control = &self.space.control;
        control.start_master.post();
        for _ in 1..count {
            control.start_workers.post();
        }
    }

    /// Returns once every thread is idle. Wake-ups not consumed yet are
    /// cancelled.
    pub fn join_all(&self) {
        let control = &self.space.control;
        control.set_phase(Phase::Idle);
        while control.start_master.try_wait() {}
        while control.start_workers.try_wait() {}
        let backoff = Backoff::new();
        while control.any_active() {
            backoff.snooze();
        }
    }
}

impl Drop for GcThreads {
    fn drop(&mut self) {
        let control = &self.space.control;
        control.set_phase(Phase::Idle);
        control.shutdown.store(true, Ordering::SeqCst);
        control.start_master.post();
        for _ in 1..self.handles.len() {
            control.start_workers.post();
        }
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                log::error!("collector thread panicked");
            }
        }
    }
}

fn run(space: Arc<Space>, id: usize) {
    let control = &space.control;
    let master = id == 0;
    // slot 0 is the mutator's
    let participant = id + 1;
    loop {
        control.active[id].store(false, Ordering::SeqCst);
        if master {
            control.start_master.wait();
        } else {
            control.start_workers.wait();
        }
        if control.shutdown.load(Ordering::SeqCst) {
            break;
        }
        fence(Ordering::SeqCst);
        control.active[id].store(true, Ordering::SeqCst);
        match control.phase() {
            Phase::Idle => {}
            Phase::Mark => mark(&space, master),
            Phase::Sweep => sweep(&space, participant, master),
        }
        fence(Ordering::SeqCst);
    }
    control.active[id].store(false, Ordering::SeqCst);
}

fn mark(space: &Space, master: bool) {
    let mut marker = Marker::new(space);
    if master {
        while !space.grey.is_done() {
            marker.mark();
            std::thread::yield_now();
        }
    } else {
        marker.mark();
    }
    log::trace!("{} marker scanned {} objects", if master { "master" } else { "worker" }, marker.scanned());
}

fn sweep(space: &Space, participant: usize, master: bool) {
    let started = space.now_ns();
    while sweeper::sweep(space, participant, SWEEP_BATCH_SIZE) {}
    if master {
        let backoff = Backoff::new();
        while !space.sweep.is_done() {
            sweeper::lazy_coalesce(space);
            backoff.snooze();
        }
    }
    space.record(GcEvent::ConcurrentSweep, started);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn semaphore_counts() {
        let semaphore = Semaphore::new(0);
        assert!(!semaphore.try_wait());
        semaphore.post();
        semaphore.post();
        assert!(semaphore.try_wait());
        semaphore.wait();
        assert!(!semaphore.try_wait());
    }

    #[test]
    fn semaphore_wakes_waiter() {
        let semaphore = Arc::new(Semaphore::new(0));
        let waiter = {
            let semaphore = semaphore.clone();
            std::thread::spawn(move || semaphore.wait())
        };
        semaphore.post();
        waiter.join().unwrap();
        assert!(!semaphore.try_wait());
    }

    #[test]
    fn phase_round_trips_through_byte() {
        let control = Control::new(2);
        assert_eq!(control.phase(), Phase::Idle);
        control.set_phase(Phase::Sweep);
        assert_eq!(control.phase(), Phase::Sweep);
        assert!(!control.any_active());
    }
}
