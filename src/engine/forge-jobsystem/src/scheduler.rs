//! Job scheduler (spec §4.D): owns the job slab, the buffer pool, and a
//! registry of independently-created queues that [`crate::context`] acquires
//! contexts against.

use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::job::{JobDescriptor, JobId, JobState};
use crate::job_buffer::JobBufferPool;
use crate::queue::JobQueue;
use crate::{CONTEXT_COUNT_MAX, QUEUE_MAX, SLOT_COUNT, WAITER_MAX};
use forge_core::forge_warn;

pub struct SchedulerConfig {
    pub prealloc_jobbuf_count: usize,
    /// Total number of worker contexts [`Scheduler::acquire_context`] can hand
    /// out at once, across every queue.
    pub context_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            prealloc_jobbuf_count: 16,
            context_capacity: CONTEXT_COUNT_MAX,
        }
    }
}

/// Identifies a worker's context, returned by [`Scheduler::acquire_context`].
/// `namespace` is the index this queue was registered under in the
/// scheduler's queue registry, not a caller-chosen namespace id.
#[repr(C)]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct ContextId {
    pub namespace: u32,
    pub index: u32,
}

pub(crate) struct SlotInner {
    pub generation: u16,
    pub state: JobState,
    pub descriptor: JobDescriptor,
    /// Outstanding work: 1 for the job itself plus one per unfinished child.
    /// Reaching zero means the job (and every descendant) has settled.
    pub work: u32,
    /// Outstanding dependencies gating this job's `NotReady -> Ready`
    /// transition. Distinct from `work`: `work` aggregates *children*
    /// finishing, `wait` aggregates *dependencies* finishing.
    pub wait: u32,
    /// Other jobs waiting on this one via a dependency edge (bounded by [`WAITER_MAX`]).
    pub dependents: Vec<JobId>,
}

impl Default for SlotInner {
    fn default() -> Self {
        Self {
            generation: 0,
            state: JobState::Uninitialized,
            descriptor: JobDescriptor::default(),
            work: 0,
            wait: 0,
            dependents: Vec::new(),
        }
    }
}

pub(crate) struct Slot {
    pub inner: Mutex<SlotInner>,
    /// Signaled whenever a slot transitions into Ready/Running/Completed/Canceled.
    pub ready_cv: Condvar,
    /// Signaled whenever a slot transitions into Completed/Canceled.
    pub done_cv: Condvar,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            inner: Mutex::new(SlotInner::default()),
            ready_cv: Condvar::new(),
            done_cv: Condvar::new(),
        }
    }
}

/// A snapshot of a job's descriptor and lifecycle state, returned by
/// [`Scheduler::resolve`]. Copied out from behind the slot's lock rather than
/// handed back as a live pointer, since (unlike the system this was ported
/// from) each slot here is guarded by its own mutex.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct JobDescriptorView {
    pub id: JobId,
    pub parent: JobId,
    pub target: u32,
    pub jobbuf: u32,
    pub user1: u64,
    pub user2: u64,
    pub data: *mut u8,
    pub size: u32,
    pub exit: i32,
    pub state: JobState,
}

struct QueueRegistryEntry {
    queue: Arc<JobQueue>,
    refcount: u32,
}

pub struct Scheduler {
    pub(crate) slots: Vec<Slot>,
    free_slots: Mutex<VecDeque<u16>>,
    pub(crate) buffer_pool: JobBufferPool,
    /// Linearly-scanned, refcounted table of queues currently acquired by at
    /// least one context. A queue occupies a slot here only while it has
    /// live acquisitions; `index` into this table is what [`ContextId::namespace`]
    /// and [`crate::job::JobDescriptor::target`] actually name.
    queue_registry: RwLock<[Option<QueueRegistryEntry>; QUEUE_MAX]>,
    free_contexts: Mutex<VecDeque<u32>>,
    terminated: AtomicBool,
}

impl Scheduler {
    pub fn create(config: SchedulerConfig) -> Self {
        let mut slots = Vec::with_capacity(SLOT_COUNT);
        slots.resize_with(SLOT_COUNT, Slot::default);

        Self {
            slots,
            // `SLOT_COUNT` is 65536, one past u16::MAX: cast each index after
            // ranging over `usize`, rather than truncating the range bound itself.
            free_slots: Mutex::new((0..SLOT_COUNT).map(|i| i as u16).collect()),
            buffer_pool: JobBufferPool::new(config.prealloc_jobbuf_count),
            queue_registry: RwLock::new(std::array::from_fn(|_| None)),
            free_contexts: Mutex::new((0..config.context_capacity as u32).collect()),
            terminated: AtomicBool::new(false),
        }
    }

    /// Signal every currently registered queue to terminate, unblocking any
    /// thread parked in `take`.
    ///
    /// Jobs already running are not interrupted; this only stops new work from
    /// being handed out. Queues registered after this call are not retroactively
    /// signaled.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        let registry = self.queue_registry.read();
        for entry in registry.iter().flatten() {
            entry.queue.signal(crate::job::Signal::Terminate);
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Cancel a single job by id (spec §4.D). Has no effect on a job that is
    /// already `Running`, `Completed` or `Canceled`. A job still sitting in a
    /// queue is simply marked `Canceled` in place — the worker that eventually
    /// dequeues it discovers this and skips `jobmain` — since that's the only
    /// thread allowed to free its slot. A job that was never enqueued
    /// (`NotSubmitted`/`NotReady`) is resolved immediately, since nothing else
    /// will ever dequeue it.
    pub fn cancel(&self, job: JobId) {
        let Some(slot) = self.slot(job) else {
            forge_warn!("cancel: unknown or stale job {job:?}");
            return;
        };

        let resolve_now = {
            let mut inner = slot.inner.lock();
            match inner.state {
                JobState::Running | JobState::Completed | JobState::Canceled => return,
                JobState::Ready => {
                    inner.state = JobState::Canceled;
                    false
                }
                JobState::NotSubmitted | JobState::NotReady | JobState::Uninitialized => {
                    inner.state = JobState::Canceled;
                    true
                }
            }
        };
        slot.ready_cv.notify_all();
        if resolve_now {
            crate::context::resolve_job(self, job);
        }
    }

    /// Look up a job's current descriptor and state. Returns `None` if `job`
    /// is invalid or stale (its slot has since been reused).
    pub fn resolve(&self, job: JobId) -> Option<JobDescriptorView> {
        let slot = self.slot(job)?;
        let inner = slot.inner.lock();
        let d = &inner.descriptor;
        Some(JobDescriptorView {
            id: d.id,
            parent: d.parent,
            target: d.target,
            jobbuf: d.jobbuf,
            user1: d.user1,
            user2: d.user2,
            data: d.data,
            size: d.size,
            exit: d.exit,
            state: inner.state,
        })
    }

    /// Acquire a fresh worker context against `queue`, registering it in the
    /// queue registry (or bumping its refcount if already registered) and
    /// handing out a free context slot. Returns `None` if the registry is full
    /// of *other* queues or no context slots remain.
    pub fn acquire_context(&self, queue: Arc<JobQueue>) -> Option<ContextId> {
        let mut registry = self.queue_registry.write();
        let mut existing = None;
        let mut free_slot = None;
        for (i, entry) in registry.iter().enumerate() {
            match entry {
                Some(e) if Arc::ptr_eq(&e.queue, &queue) => {
                    existing = Some(i);
                    break;
                }
                None if free_slot.is_none() => free_slot = Some(i),
                _ => {}
            }
        }

        let namespace = match existing {
            Some(i) => i,
            None => {
                let i = free_slot?;
                registry[i] = Some(QueueRegistryEntry { queue, refcount: 0 });
                i
            }
        };
        registry[namespace].as_mut().unwrap().refcount += 1;
        drop(registry);

        let index = self.free_contexts.lock().pop_front()?;
        Some(ContextId {
            namespace: namespace as u32,
            index,
        })
    }

    /// Re-home an *existing* context id onto the calling thread — e.g. to let
    /// a replacement worker resume a queue whose original worker thread died —
    /// without allocating a new context slot or touching the queue's refcount.
    /// Returns `false` if `id`'s queue is no longer registered.
    pub fn assign_context(&self, id: ContextId) -> bool {
        matches!(
            self.queue_registry.read().get(id.namespace as usize),
            Some(Some(_))
        )
    }

    /// Release a context acquired via [`Scheduler::acquire_context`], freeing
    /// its context slot and dropping the queue registry's refcount on its
    /// queue (deregistering the queue entirely once nothing else holds it).
    pub fn release_context(&self, id: ContextId) {
        self.free_contexts.lock().push_back(id.index);
        let mut registry = self.queue_registry.write();
        if let Some(slot) = registry.get_mut(id.namespace as usize) {
            if let Some(entry) = slot {
                entry.refcount = entry.refcount.saturating_sub(1);
                if entry.refcount == 0 {
                    *slot = None;
                }
            }
        }
    }

    pub fn get_queue(&self, namespace: u32) -> Option<Arc<JobQueue>> {
        self.queue_registry
            .read()
            .get(namespace as usize)?
            .as_ref()
            .map(|e| e.queue.clone())
    }

    pub(crate) fn allocate_slot(&self) -> Option<(u16, u16)> {
        let index = self.free_slots.lock().pop_front()?;
        let generation = {
            let mut inner = self.slots[index as usize].inner.lock();
            inner.generation = inner.generation.wrapping_add(1).max(1);
            inner.generation
        };
        Some((index, generation))
    }

    pub(crate) fn free_slot(&self, index: u16) {
        self.free_slots.lock().push_back(index);
    }

    pub(crate) fn slot(&self, id: JobId) -> Option<&Slot> {
        let slot = self.slots.get(id.index() as usize)?;
        if slot.inner.lock().generation != id.generation() {
            return None;
        }
        Some(slot)
    }

    /// Register `dependent` against `dependency`. Returns `Ok(true)` if
    /// `dependency` is already settled (or stale), meaning the caller doesn't
    /// need to wait on it after all; `Ok(false)` if registered and still
    /// pending; `Err(())` if `dependency`'s waiter list is full.
    pub(crate) fn register_dependent(&self, dependency: JobId, dependent: JobId) -> Result<bool, ()> {
        let Some(slot) = self.slot(dependency) else {
            return Ok(true); // stale dependency id: treat as already satisfied
        };
        let mut inner = slot.inner.lock();
        if matches!(inner.state, JobState::Completed | JobState::Canceled) {
            return Ok(true);
        }
        if inner.dependents.len() >= WAITER_MAX {
            return Err(());
        }
        inner.dependents.push(dependent);
        Ok(false)
    }

    /// Undo a [`Scheduler::register_dependent`] registration. Used to roll
    /// back a `submit_job` call that hits `TooManyWaiters` partway through a
    /// multi-dependency registration.
    pub(crate) fn deregister_dependent(&self, dependency: JobId, dependent: JobId) {
        if let Some(slot) = self.slot(dependency) {
            slot.inner.lock().dependents.retain(|&d| d != dependent);
        }
    }
}

const _: () = assert!(QUEUE_MAX >= 1);
