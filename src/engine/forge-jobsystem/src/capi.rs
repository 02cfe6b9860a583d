//! C ABI surface (spec §6). Every exported function catches panics at the
//! boundary so a bug in a job's body can never unwind into a foreign caller.
//!
//! This layer is a thin, faithful wrapper around the safe Rust API in
//! [`crate::scheduler`]/[`crate::context`]; it does not itself implement any
//! scheduling logic. A host-language binding (e.g. a Python extension module)
//! would sit on top of this, but is out of scope here.

use std::sync::Arc;

use forge_core::forge_error;

use crate::context::{JobContext, JobSpec};
use crate::job::{JobId, JobMainFn, SubmitResult, SubmitType};
use crate::queue::JobQueue;
use crate::scheduler::{ContextId, JobDescriptorView, Scheduler, SchedulerConfig};

macro_rules! ffi_guard {
    ($default:expr, $body:expr) => {
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| $body)) {
            Ok(value) => value,
            Err(_) => {
                forge_error!("panic caught at FFI boundary, returning default");
                $default
            }
        }
    };
}

pub type JobSchedulerHandle = *mut Scheduler;
pub type JobContextHandle = *mut JobContext;
pub type JobQueueHandle = *const JobQueue;

#[no_mangle]
pub extern "C" fn logical_processor_count() -> u32 {
    ffi_guard!(1, num_cpus::get() as u32)
}

#[no_mangle]
pub extern "C" fn current_thread_id() -> u64 {
    ffi_guard!(0, current_thread_id_impl())
}

#[cfg(unix)]
fn current_thread_id_impl() -> u64 {
    unsafe { libc::pthread_self() as u64 }
}

#[cfg(not(unix))]
fn current_thread_id_impl() -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    hasher.finish()
}

#[repr(C)]
pub struct JobSchedulerConfigDesc {
    pub prealloc_jobbuf_count: u32,
    pub context_capacity: u32,
}

/// # Safety
/// `config` must point at a valid, fully initialized [`JobSchedulerConfigDesc`].
#[no_mangle]
pub unsafe extern "C" fn job_scheduler_create(config: *const JobSchedulerConfigDesc) -> JobSchedulerHandle {
    ffi_guard!(std::ptr::null_mut(), {
        if config.is_null() {
            return std::ptr::null_mut();
        }
        let config = &*config;
        let scheduler = Arc::new(Scheduler::create(SchedulerConfig {
            prealloc_jobbuf_count: config.prealloc_jobbuf_count as usize,
            context_capacity: config.context_capacity as usize,
        }));
        Arc::into_raw(scheduler) as JobSchedulerHandle
    })
}

/// # Safety
/// `scheduler` must be a handle previously returned by [`job_scheduler_create`]
/// and not already deleted.
#[no_mangle]
pub unsafe extern "C" fn job_scheduler_delete(scheduler: JobSchedulerHandle) {
    ffi_guard!((), {
        if !scheduler.is_null() {
            drop(Arc::from_raw(scheduler as *const Scheduler));
        }
    })
}

/// # Safety
/// `scheduler` must be a live handle from [`job_scheduler_create`].
#[no_mangle]
pub unsafe extern "C" fn job_scheduler_terminate(scheduler: JobSchedulerHandle) {
    ffi_guard!((), {
        if let Some(s) = scheduler.as_ref() {
            s.terminate();
        }
    })
}

/// # Safety
/// `scheduler` must be a live handle from [`job_scheduler_create`].
#[no_mangle]
pub unsafe extern "C" fn job_scheduler_cancel(scheduler: JobSchedulerHandle, job: JobId) {
    ffi_guard!((), {
        if let Some(s) = scheduler.as_ref() {
            s.cancel(job);
        }
    })
}

/// # Safety
/// `scheduler` must be a live handle from [`job_scheduler_create`].
#[no_mangle]
pub unsafe extern "C" fn job_scheduler_resolve(
    scheduler: JobSchedulerHandle,
    job: JobId,
    out: *mut JobDescriptorView,
) -> bool {
    ffi_guard!(false, {
        let Some(s) = scheduler.as_ref() else {
            return false;
        };
        if out.is_null() {
            return false;
        }
        match s.resolve(job) {
            Some(view) => {
                *out = view;
                true
            }
            None => false,
        }
    })
}

/// Create a standalone queue, independent of any scheduler, that can later be
/// handed to [`job_scheduler_acquire_context`].
#[no_mangle]
pub extern "C" fn job_queue_create() -> JobQueueHandle {
    ffi_guard!(std::ptr::null(), Arc::into_raw(JobQueue::create()))
}

/// # Safety
/// `queue` must be a handle previously returned by [`job_queue_create`] and not
/// already deleted, with no context still acquired against it.
#[no_mangle]
pub unsafe extern "C" fn job_queue_delete(queue: JobQueueHandle) {
    ffi_guard!((), {
        if !queue.is_null() {
            drop(Arc::from_raw(queue));
        }
    })
}

/// Acquire a fresh worker context against `queue`, registering it with the
/// scheduler if it isn't already.
///
/// # Safety
/// `scheduler` must be a live handle from [`job_scheduler_create`]; `queue`
/// must be a live handle from [`job_queue_create`].
#[no_mangle]
pub unsafe extern "C" fn job_scheduler_acquire_context(
    scheduler: JobSchedulerHandle,
    queue: JobQueueHandle,
) -> JobContextHandle {
    ffi_guard!(std::ptr::null_mut(), {
        let Some(s) = scheduler.as_ref() else {
            return std::ptr::null_mut();
        };
        if queue.is_null() {
            return std::ptr::null_mut();
        }
        // Reconstruct the Arcs without taking ownership away from the caller's handles.
        let arc_s = Arc::from_raw(scheduler as *const Scheduler);
        let arc_s_clone = arc_s.clone();
        std::mem::forget(arc_s);
        let arc_q = Arc::from_raw(queue);
        let arc_q_clone = arc_q.clone();
        std::mem::forget(arc_q);
        match s.acquire_context(arc_q_clone) {
            Some(id) => Box::into_raw(Box::new(JobContext::new(arc_s_clone, id))),
            None => std::ptr::null_mut(),
        }
    })
}

/// Re-home an existing, still-registered context id onto the calling thread —
/// e.g. to let a replacement worker resume a queue whose original worker
/// thread died.
///
/// # Safety
/// `scheduler` must be a live handle from [`job_scheduler_create`].
#[no_mangle]
pub unsafe extern "C" fn job_scheduler_assign_context(
    scheduler: JobSchedulerHandle,
    context_id: ContextId,
) -> JobContextHandle {
    ffi_guard!(std::ptr::null_mut(), {
        let Some(s) = scheduler.as_ref() else {
            return std::ptr::null_mut();
        };
        if !s.assign_context(context_id) {
            return std::ptr::null_mut();
        }
        let arc_s = Arc::from_raw(scheduler as *const Scheduler);
        let arc_s_clone = arc_s.clone();
        std::mem::forget(arc_s);
        Box::into_raw(Box::new(JobContext::new(arc_s_clone, context_id)))
    })
}

/// # Safety
/// `scheduler` and `context` must be live handles owned by the caller; `context`
/// must have come from [`job_scheduler_acquire_context`] or
/// [`job_scheduler_assign_context`] on this `scheduler`.
#[no_mangle]
pub unsafe extern "C" fn job_scheduler_release_context(
    scheduler: JobSchedulerHandle,
    context: JobContextHandle,
) {
    ffi_guard!((), {
        if context.is_null() {
            return;
        }
        let ctx = Box::from_raw(context);
        if let Some(s) = scheduler.as_ref() {
            s.release_context(ctx.id());
        }
    })
}

/// # Safety
/// `context` must be a live handle from [`job_scheduler_acquire_context`] or
/// [`job_scheduler_assign_context`].
#[no_mangle]
pub unsafe extern "C" fn job_context_id(context: JobContextHandle) -> ContextId {
    ffi_guard!(
        ContextId {
            namespace: u32::MAX,
            index: u32::MAX
        },
        (*context).id()
    )
}

/// # Safety
/// `context` must be a live handle; `data` must be valid for `size` bytes (or
/// null if `size` is zero).
#[no_mangle]
pub unsafe extern "C" fn job_context_create_job(
    context: JobContextHandle,
    target: u32,
    jobmain: Option<JobMainFn>,
    user1: u64,
    user2: u64,
    parent: JobId,
    data: *const u8,
    size: u32,
) -> JobId {
    ffi_guard!(JobId::INVALID, {
        let slice = if size == 0 {
            &[][..]
        } else {
            std::slice::from_raw_parts(data, size as usize)
        };
        (*context)
            .create_job(JobSpec {
                target,
                jobmain,
                user1,
                user2,
                parent,
                data: slice,
            })
            .unwrap_or(JobId::INVALID)
    })
}

/// # Safety
/// `context` must be a live handle; `deps` must be valid for `dep_count` reads
/// (or null if `dep_count` is zero).
#[no_mangle]
pub unsafe extern "C" fn job_context_submit_job(
    context: JobContextHandle,
    job: JobId,
    deps: *const JobId,
    dep_count: u32,
    submit_type: SubmitType,
) -> SubmitResult {
    ffi_guard!(SubmitResult::InvalidJob, {
        let deps_slice = if dep_count == 0 {
            &[][..]
        } else {
            std::slice::from_raw_parts(deps, dep_count as usize)
        };
        (*context).submit_job(job, deps_slice, submit_type)
    })
}

/// # Safety
/// `context` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn job_context_cancel_job(context: JobContextHandle, job: JobId) -> SubmitResult {
    ffi_guard!(SubmitResult::InvalidJob, (*context).cancel_job(job))
}

/// # Safety
/// `context` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn job_context_wait_job(context: JobContextHandle, job: JobId) {
    ffi_guard!((), (*context).wait_job(job))
}

/// # Safety
/// `context` must be a live handle. Blocks until a job is available on this
/// context's queue or the queue is signaled/terminated; returns
/// [`JobId::INVALID`] in the latter case.
#[no_mangle]
pub unsafe extern "C" fn job_context_wait_ready_job(context: JobContextHandle) -> JobId {
    ffi_guard!(JobId::INVALID, (*context).wait_ready_job().unwrap_or(JobId::INVALID))
}

/// # Safety
/// `context` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn job_context_complete_job(context: JobContextHandle, job: JobId) {
    ffi_guard!((), (*context).complete_job(job))
}

/// # Safety
/// `context` must be a live handle. Runs the dequeued job's `jobmain` but does
/// not complete it; the caller must follow up with [`job_context_complete_job`].
#[no_mangle]
pub unsafe extern "C" fn job_context_run_next_job_no_completion(context: JobContextHandle) -> JobId {
    ffi_guard!(
        JobId::INVALID,
        (*context).run_next_job_no_completion().unwrap_or(JobId::INVALID)
    )
}

/// # Safety
/// `context` must be a live handle. Blocks until a job is available on this
/// context's queue or the queue terminates; returns `false` on termination.
#[no_mangle]
pub unsafe extern "C" fn job_context_run_next_job(context: JobContextHandle) -> bool {
    ffi_guard!(false, (*context).run_next_job())
}
