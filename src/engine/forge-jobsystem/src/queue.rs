//! Bounded, waitable job queue (spec §4.C).
//!
//! This intentionally does not reuse a work-stealing deque: the contract here is
//! a strict FIFO ring with blocking push/take and a sticky out-of-band signal
//! that every waiter observes, which a stealing deque cannot express. The
//! synchronization primitives (`Mutex` + two `Condvar`s) are the same ones the
//! rest of this crate uses for everything else.
//!
//! Queues are created independently of any [`crate::scheduler::Scheduler`] via
//! [`JobQueue::create`] and registered into a scheduler's queue registry when a
//! context is acquired against one.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;

use crate::job::JobId;
use crate::job::Signal;
use crate::QUEUE_CAPACITY;

struct State {
    ring: VecDeque<JobId>,
    push_count: u64,
    take_count: u64,
    signal: Signal,
}

/// A single-producer-friendly, multi-consumer FIFO of runnable [`JobId`]s.
pub struct JobQueue {
    state: Mutex<State>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                ring: VecDeque::with_capacity(QUEUE_CAPACITY.min(1024)),
                push_count: 0,
                take_count: 0,
                signal: Signal::Clear,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Create a queue behind an `Arc`, the handle shape every caller actually
    /// wants (a queue outlives whichever context is currently acquired against it).
    pub fn create() -> Arc<JobQueue> {
        Arc::new(Self::new())
    }

    /// Block until there is room and the queue is not signaled, then push `job`.
    /// Returns `false` if the queue carries any signal other than `Clear`,
    /// whether that was already true or became true while waiting for room.
    pub fn push(&self, job: JobId) -> bool {
        let mut state = self.state.lock();
        loop {
            if !matches!(state.signal, Signal::Clear) {
                return false;
            }
            if state.ring.len() < QUEUE_CAPACITY {
                state.ring.push_back(job);
                state.push_count += 1;
                self.not_empty.notify_one();
                return true;
            }
            self.not_full.wait(&mut state);
        }
    }

    /// Block until a job is available. A job already queued is always handed
    /// out even if the queue has since been signaled; once the ring is empty,
    /// any signal other than `Clear` makes this return `None` instead of
    /// waiting for more work.
    pub fn take(&self) -> Option<JobId> {
        let mut state = self.state.lock();
        loop {
            if let Some(job) = state.ring.pop_front() {
                state.take_count += 1;
                self.not_full.notify_one();
                return Some(job);
            }
            if !matches!(state.signal, Signal::Clear) {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Non-blocking take; returns `None` if the queue is currently empty.
    pub fn try_take(&self) -> Option<JobId> {
        let mut state = self.state.lock();
        let job = state.ring.pop_front()?;
        state.take_count += 1;
        self.not_full.notify_one();
        Some(job)
    }

    /// Drop all queued jobs without running them and reset the counters.
    pub fn flush(&self) {
        let mut state = self.state.lock();
        state.take_count += state.ring.len() as u64;
        state.ring.clear();
        self.not_full.notify_all();
    }

    /// Post a sticky out-of-band signal, waking every blocked waiter. Pass
    /// `Signal::Clear` to resume normal push/take blocking.
    pub fn signal(&self, signal: Signal) {
        let mut state = self.state.lock();
        state.signal = signal;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Read the current sticky signal without clearing it; clearing only
    /// happens via an explicit `signal(Signal::Clear)` call.
    pub fn check_signal(&self) -> Signal {
        self.state.lock().signal
    }

    pub fn push_count(&self) -> u64 {
        self.state.lock().push_count
    }

    pub fn take_count(&self) -> u64 {
        self.state.lock().take_count
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self.state.lock().signal, Signal::Terminate)
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}
