//! Host-process job scheduler: fork/join parallelism over a fixed-size job
//! slab, paired with a linear arena allocator used for both job argument
//! storage and general-purpose scratch allocation.

pub mod arena;
pub mod capi;
pub mod context;
pub mod job;
pub mod job_buffer;
pub mod queue;
pub mod scheduler;

use once_cell::sync::OnceCell;
use std::sync::Arc;

use scheduler::{Scheduler, SchedulerConfig};

/// Maximum number of concurrently live jobs across the whole scheduler.
pub const SLOT_COUNT: usize = 65536;
/// Maximum number of other jobs that may register a dependency on a single job.
pub const WAITER_MAX: usize = 32;
/// Maximum number of jobs that may share one [`job_buffer::Buffer`].
pub const BUFFER_JOBS: usize = 64;
/// Byte capacity of one [`job_buffer::Buffer`].
pub const BUFFER_BYTES: usize = BUFFER_JOBS * 1024;
/// Capacity of a single [`queue::JobQueue`]'s ring buffer: as many slots as
/// the job slab can ever hold live at once.
pub const QUEUE_CAPACITY: usize = SLOT_COUNT;
/// Maximum number of distinct queues the scheduler's registry can track at once.
pub const QUEUE_MAX: usize = 16;
/// Maximum number of worker contexts the scheduler can hand out at once.
pub const CONTEXT_COUNT_MAX: usize = 64;
/// Default stack size for threads this crate spawns on the caller's behalf.
pub const THREAD_STACK_SIZE_DEFAULT: usize = 4 * 1024 * 1024;

static GLOBAL_SCHEDULER: OnceCell<Arc<Scheduler>> = OnceCell::new();

/// Returns the process-wide scheduler, if one has been initialized.
pub fn global() -> Option<Arc<Scheduler>> {
    GLOBAL_SCHEDULER.get().cloned()
}

/// Initialize the process-wide scheduler. Panics if it was already initialized.
pub fn initialize_global(config: SchedulerConfig) -> Arc<Scheduler> {
    let scheduler = Arc::new(Scheduler::create(config));
    GLOBAL_SCHEDULER
        .set(scheduler.clone())
        .unwrap_or_else(|_| panic!("forge_jobsystem::initialize_global called more than once"));
    scheduler
}

/// Initialize the process-wide scheduler if it hasn't been already, returning
/// the existing one otherwise.
pub fn try_initialize_global(config: SchedulerConfig) -> Arc<Scheduler> {
    GLOBAL_SCHEDULER
        .get_or_init(|| Arc::new(Scheduler::create(config)))
        .clone()
}
