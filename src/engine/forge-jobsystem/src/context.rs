//! Job context and lifecycle engine (spec §4.E).
//!
//! A [`JobContext`] is the per-worker-thread handle into a [`Scheduler`]: it
//! creates jobs, submits them, drives the run loop, and blocks callers on
//! completion or readiness. All of its methods assert that they are called
//! from the thread the context was created on; a context is not meant to be
//! shared concurrently, though it can be *moved* to another thread (see
//! [`Scheduler::assign_context`] for re-homing an existing context id after a
//! worker dies).

use std::cell::Cell;
use std::sync::Arc;
use std::thread::ThreadId;

use crate::job::{JobDescriptor, JobId, JobMainFn, JobState, SubmitResult, SubmitType};
use crate::scheduler::{ContextId, Scheduler, Slot};
use forge_core::{forge_error, forge_verbose};

/// Template used to create a job; mirrors the fields a caller actually chooses
/// (storage bookkeeping like `id`/`jobbuf` is filled in by [`JobContext::create_job`]).
pub struct JobSpec<'a> {
    pub target: u32,
    pub jobmain: Option<JobMainFn>,
    pub user1: u64,
    pub user2: u64,
    pub parent: JobId,
    pub data: &'a [u8],
}

pub struct JobContext {
    scheduler: Arc<Scheduler>,
    id: ContextId,
    owning_thread: Cell<ThreadId>,
    current_buffer: Cell<Option<u32>>,
}

// SAFETY: a `JobContext` is only ever read/written from the thread recorded in
// `owning_thread` (enforced by `assert_owning_thread`); `Cell`'s contents
// (`ThreadId`, `Option<u32>`) are themselves `Send`, so moving the whole
// struct to a new thread — e.g. to re-home it via `Scheduler::assign_context`
// after its original owner died — is sound as long as the new owner calls
// `rebind_to_current_thread` before using it.
unsafe impl Send for JobContext {}

impl JobContext {
    pub fn new(scheduler: Arc<Scheduler>, id: ContextId) -> Self {
        Self {
            scheduler,
            id,
            owning_thread: Cell::new(std::thread::current().id()),
            current_buffer: Cell::new(None),
        }
    }

    /// Re-home this context onto the calling thread. Used after
    /// [`Scheduler::assign_context`] re-validates an existing [`ContextId`]
    /// for a new owner (e.g. a replacement worker picking up after a crashed
    /// one); the caller must not use the context from its previous thread
    /// again after this.
    pub fn rebind_to_current_thread(&self) {
        self.owning_thread.set(std::thread::current().id());
    }

    fn assert_owning_thread(&self) {
        debug_assert_eq!(
            std::thread::current().id(),
            self.owning_thread.get(),
            "JobContext used from a thread other than the one that owns it"
        );
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Inspect a job's current lifecycle state. Mainly useful for diagnostics
    /// and tests; scheduling decisions should rely on `wait_job`/`wait_ready_job`
    /// rather than polling this.
    pub fn job_state(&self, job: JobId) -> Option<JobState> {
        let slot = self.scheduler.slot(job)?;
        Some(slot.inner.lock().state)
    }

    /// Allocate a job slot and inline storage for `spec.data`. The job starts
    /// in `NotSubmitted` and must be handed to [`JobContext::submit_job`].
    pub fn create_job(&self, spec: JobSpec<'_>) -> Option<JobId> {
        self.assert_owning_thread();

        let (index, generation) = self.scheduler.allocate_slot()?;
        let (buffer, data_ptr) = self
            .scheduler
            .buffer_pool
            .acquire(self.current_buffer.get(), spec.data.len() as u32)?;
        self.current_buffer.set(Some(buffer));

        if !spec.data.is_empty() {
            unsafe {
                std::ptr::copy_nonoverlapping(spec.data.as_ptr(), data_ptr, spec.data.len());
            }
        }

        let id = JobId::pack(index, generation);

        if spec.parent.is_valid() {
            if let Some(parent_slot) = self.scheduler.slot(spec.parent) {
                parent_slot.inner.lock().work += 1;
            }
        }

        let slot = &self.scheduler.slots[index as usize];
        let mut inner = slot.inner.lock();
        inner.descriptor = JobDescriptor {
            jobbuf: buffer,
            target: spec.target,
            jobmain: spec.jobmain,
            exit: 0,
            user1: spec.user1,
            user2: spec.user2,
            data: data_ptr,
            size: spec.data.len() as u32,
            id,
            parent: spec.parent,
        };
        inner.work = 1;
        inner.wait = 0;
        inner.state = JobState::NotSubmitted;
        drop(inner);

        Some(id)
    }

    /// Submit a job for execution, gating it on every id in `deps`.
    ///
    /// Registers against each dependency in turn; if any registration hits
    /// `TooManyWaiters`, the whole submission is aborted — every dependency
    /// already registered against is deregistered and the job's state rolls
    /// back to `NotSubmitted` — rather than leaving the job partially gated.
    pub fn submit_job(&self, job: JobId, deps: &[JobId], submit_type: SubmitType) -> SubmitResult {
        self.assert_owning_thread();

        let Some(slot) = self.scheduler.slot(job) else {
            return SubmitResult::InvalidJob;
        };

        if let SubmitType::Cancel = submit_type {
            let mut inner = slot.inner.lock();
            if !matches!(inner.state, JobState::NotSubmitted) {
                return SubmitResult::InvalidJob;
            }
            inner.state = JobState::Canceled;
            drop(inner);
            slot.ready_cv.notify_all();
            resolve_job(&self.scheduler, job);
            return SubmitResult::Success;
        }

        {
            let mut inner = slot.inner.lock();
            if !matches!(inner.state, JobState::NotSubmitted) {
                return SubmitResult::InvalidJob;
            }
            inner.state = JobState::NotReady;
            inner.wait = deps.len() as u32;
        }

        let mut registered = Vec::with_capacity(deps.len());
        for &dep in deps {
            match self.scheduler.register_dependent(dep, job) {
                Ok(true) => {
                    // Already settled: doesn't count against this job's wait.
                    slot.inner.lock().wait -= 1;
                }
                Ok(false) => registered.push(dep),
                Err(()) => {
                    for dep in registered {
                        self.scheduler.deregister_dependent(dep, job);
                    }
                    let mut inner = slot.inner.lock();
                    inner.state = JobState::NotSubmitted;
                    inner.wait = 0;
                    return SubmitResult::TooManyWaiters;
                }
            }
        }

        // The last dependency to settle might do so concurrently on another
        // thread (via `resolve_job`'s dependents walk) right as this loop
        // finishes; `try_make_ready` is the single atomic check-and-set both
        // paths go through so only one of them actually enqueues the job.
        if let Some(target) = try_make_ready(slot) {
            slot.ready_cv.notify_all();
            if let Some(queue) = self.scheduler.get_queue(target) {
                queue.push(job);
            } else {
                forge_error!("submit_job: job targets an unregistered queue {target}");
            }
        }

        SubmitResult::Success
    }

    /// Cancel a previously submitted job. Only legal before it starts running.
    pub fn cancel_job(&self, job: JobId) -> SubmitResult {
        self.assert_owning_thread();
        let Some(slot) = self.scheduler.slot(job) else {
            return SubmitResult::InvalidJob;
        };
        {
            let inner = slot.inner.lock();
            if matches!(inner.state, JobState::Running | JobState::Completed | JobState::Canceled) {
                return SubmitResult::InvalidJob;
            }
        }
        self.scheduler.cancel(job);
        SubmitResult::Success
    }

    /// Block until `job` and all of its descendants have completed or been
    /// canceled. Cooperative: rather than passively parking, this thread keeps
    /// pulling and running other ready jobs from its own queue (via
    /// [`JobContext::run_next_job`]) until the target settles or its queue is
    /// signaled and has nothing left to hand out.
    pub fn wait_job(&self, job: JobId) {
        self.assert_owning_thread();
        loop {
            match self.job_state(job) {
                Some(JobState::Completed) | Some(JobState::Canceled) | None => return,
                _ => {}
            }
            if !self.run_next_job() {
                return;
            }
        }
    }

    /// Dequeue the next ready job from this context's queue (spec §4.E). Walks
    /// the job's ancestor chain so a job whose parent — or a more distant
    /// ancestor — was canceled after this job was enqueued is itself
    /// discovered-canceled here rather than run. Blocks until a job is
    /// available or the queue is signaled/terminated, in which case this
    /// returns `None`.
    pub fn wait_ready_job(&self) -> Option<JobId> {
        self.assert_owning_thread();
        let queue = self.scheduler.get_queue(self.id.namespace)?;
        let job = queue.take()?;
        self.mark_running_or_inherit_cancellation(job);
        Some(job)
    }

    fn mark_running_or_inherit_cancellation(&self, job: JobId) {
        let Some(slot) = self.scheduler.slot(job) else {
            return;
        };
        let ancestor_canceled = self.ancestor_is_canceled(job);
        let mut inner = slot.inner.lock();
        if ancestor_canceled {
            inner.state = JobState::Canceled;
        } else if !matches!(inner.state, JobState::Canceled) {
            inner.state = JobState::Running;
        }
    }

    fn ancestor_is_canceled(&self, job: JobId) -> bool {
        let Some(slot) = self.scheduler.slot(job) else {
            return false;
        };
        let parent = slot.inner.lock().descriptor.parent;
        if !parent.is_valid() {
            return false;
        }
        let Some(parent_slot) = self.scheduler.slot(parent) else {
            return false;
        };
        let parent_state = parent_slot.inner.lock().state;
        if matches!(parent_state, JobState::Canceled) {
            return true;
        }
        self.ancestor_is_canceled(parent)
    }

    /// Dequeue and run the next ready job, then complete it. Returns `false`
    /// if no job could be dequeued (queue signaled or terminated).
    pub fn run_next_job(&self) -> bool {
        self.assert_owning_thread();
        match self.run_next_job_no_completion() {
            Some(job) => {
                self.complete_job(job);
                true
            }
            None => false,
        }
    }

    /// Dequeue and run the next ready job's `jobmain` (unless it was
    /// discovered-canceled), but do *not* run the shared completion path —
    /// the caller is responsible for calling [`JobContext::complete_job`]
    /// once it's actually done with the job. Useful when a job's body hands
    /// off to other state (e.g. another language runtime) before it's ready
    /// to be marked finished. Returns the job taken, or `None` if none could
    /// be dequeued.
    pub fn run_next_job_no_completion(&self) -> Option<JobId> {
        self.assert_owning_thread();
        let job = self.wait_ready_job()?;
        self.invoke_main_if_not_canceled(job);
        Some(job)
    }

    fn invoke_main_if_not_canceled(&self, job: JobId) {
        let Some(slot) = self.scheduler.slot(job) else {
            return;
        };

        let (jobmain, data, size, user1, user2, canceled) = {
            let inner = slot.inner.lock();
            let canceled = matches!(inner.state, JobState::Canceled);
            let d = &inner.descriptor;
            (d.jobmain, d.data, d.size, d.user1, d.user2, canceled)
        };

        if canceled {
            return;
        }

        if let Some(jobmain) = jobmain {
            let ctx_ptr = self as *const JobContext as *mut std::ffi::c_void;
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| unsafe {
                jobmain(ctx_ptr, job, data, size, user1, user2)
            }));
            match result {
                Ok(exit) => slot.inner.lock().descriptor.exit = exit,
                Err(_) => forge_error!("job main panicked; treating job as complete"),
            }
        }
    }

    /// Complete `job`: run the shared settlement path (propagate to parent and
    /// dependents, release its buffer reference, wake waiters). Safe to call
    /// whether or not this context itself ran the job's `jobmain` — e.g. after
    /// [`JobContext::run_next_job_no_completion`], or after a caller ran the
    /// job's body through some other mechanism entirely.
    pub fn complete_job(&self, job: JobId) {
        self.assert_owning_thread();
        resolve_job(&self.scheduler, job);
    }
}

/// Atomically transition a job out of `NotReady` into `Ready` if its
/// dependency count has reached zero, returning its target queue id if so.
/// Shared by `submit_job`'s own post-registration check and by
/// `resolve_job`'s dependents walk below, since the job's *last* outstanding
/// dependency can settle on either side of that race.
fn try_make_ready(slot: &Slot) -> Option<u32> {
    let mut inner = slot.inner.lock();
    if inner.wait == 0 && matches!(inner.state, JobState::NotReady) {
        inner.state = JobState::Ready;
        Some(inner.descriptor.target)
    } else {
        None
    }
}

/// Settle `job` (as `Canceled` if its current state is `Canceled`, else as
/// `Completed`), release its buffer reference, wake its waiters, release any
/// jobs depending on it, and propagate completion up to its parent. Used by
/// the normal run path, by [`Scheduler::cancel`] for jobs resolved before ever
/// reaching a queue, and by `submit_job`'s `SubmitType::Cancel` branch.
pub(crate) fn resolve_job(scheduler: &Scheduler, job: JobId) {
    let mut stack = vec![job];

    while let Some(job) = stack.pop() {
        let Some(slot) = scheduler.slot(job) else {
            continue;
        };

        let (parent, buffer, dependents, settled_canceled) = {
            let mut inner = slot.inner.lock();
            if inner.work > 1 {
                inner.work -= 1;
                continue;
            }
            inner.work = 0;
            let was_canceled = matches!(inner.state, JobState::Canceled);
            inner.state = if was_canceled {
                JobState::Canceled
            } else {
                JobState::Completed
            };
            let d = &inner.descriptor;
            (
                d.parent,
                d.jobbuf,
                std::mem::take(&mut inner.dependents),
                was_canceled,
            )
        };

        scheduler.buffer_pool.release(buffer);
        slot.done_cv.notify_all();
        slot.ready_cv.notify_all();

        for dependent in dependents {
            if let Some(dep_slot) = scheduler.slot(dependent) {
                {
                    let mut dep_inner = dep_slot.inner.lock();
                    if matches!(dep_inner.state, JobState::Canceled) {
                        continue;
                    }
                    dep_inner.wait = dep_inner.wait.saturating_sub(1);
                }
                let target = try_make_ready(dep_slot);
                dep_slot.ready_cv.notify_all();
                if let Some(target) = target {
                    if let Some(queue) = scheduler.get_queue(target) {
                        queue.push(dependent);
                    }
                }
            }
        }

        scheduler.free_slot(job.index());
        if parent.is_valid() {
            stack.push(parent);
        }

        forge_verbose!("resolve_job: {job:?} settled (canceled={settled_canceled})");
    }
}

impl Drop for JobContext {
    fn drop(&mut self) {
        if let Some(buffer) = self.current_buffer.get() {
            self.scheduler.buffer_pool.release(buffer);
        }
    }
}
