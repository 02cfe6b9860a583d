use forge_jobsystem::context::{JobContext, JobSpec};
use forge_jobsystem::job::{JobId, JobState, SubmitResult, SubmitType};
use forge_jobsystem::queue::JobQueue;
use forge_jobsystem::scheduler::{Scheduler, SchedulerConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

fn make_scheduler() -> Arc<Scheduler> {
    Arc::new(Scheduler::create(SchedulerConfig {
        prealloc_jobbuf_count: 4,
        context_capacity: 16,
    }))
}

fn spawn_workers(scheduler: Arc<Scheduler>, queue: Arc<JobQueue>, count: usize) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|_| {
            let scheduler = scheduler.clone();
            let queue = queue.clone();
            std::thread::spawn(move || {
                let id = scheduler.acquire_context(queue).unwrap();
                let ctx = JobContext::new(scheduler.clone(), id);
                while ctx.run_next_job() {}
            })
        })
        .collect()
}

unsafe extern "C" fn increment_job(
    _ctx: *mut std::ffi::c_void,
    _job: JobId,
    _data: *mut u8,
    _size: u32,
    user1: u64,
    _user2: u64,
) -> i32 {
    let counter = &*(user1 as *const AtomicUsize);
    counter.fetch_add(1, Ordering::SeqCst);
    0
}

unsafe extern "C" fn fork_four_children(
    ctx: *mut std::ffi::c_void,
    job: JobId,
    _data: *mut u8,
    _size: u32,
    user1: u64,
    _user2: u64,
) -> i32 {
    let ctx = &*(ctx as *const JobContext);
    for _ in 0..4 {
        let child = ctx
            .create_job(JobSpec {
                target: ctx.id().namespace,
                jobmain: Some(increment_job),
                user1,
                user2: 0,
                parent: job,
                data: &[],
            })
            .expect("child job creation failed");
        assert_eq!(
            ctx.submit_job(child, &[], SubmitType::Run),
            SubmitResult::Success
        );
    }
    0
}

#[test]
fn single_job_with_no_dependencies_runs_to_completion() {
    let scheduler = make_scheduler();
    let queue = JobQueue::create();
    let workers = spawn_workers(scheduler.clone(), queue.clone(), 2);

    let main_ctx = JobContext::new(scheduler.clone(), scheduler.acquire_context(queue).unwrap());
    let counter = AtomicUsize::new(0);
    let job = main_ctx
        .create_job(JobSpec {
            target: main_ctx.id().namespace,
            jobmain: Some(increment_job),
            user1: &counter as *const AtomicUsize as u64,
            user2: 0,
            parent: JobId::INVALID,
            data: &[],
        })
        .unwrap();

    assert_eq!(
        main_ctx.submit_job(job, &[], SubmitType::Run),
        SubmitResult::Success
    );
    main_ctx.wait_job(job);

    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(main_ctx.job_state(job), Some(JobState::Completed));

    scheduler.terminate();
    for w in workers {
        w.join().unwrap();
    }
}

#[test]
fn fork_join_parent_completes_only_after_all_children() {
    let scheduler = make_scheduler();
    let queue = JobQueue::create();
    let workers = spawn_workers(scheduler.clone(), queue.clone(), 4);

    let main_ctx = JobContext::new(scheduler.clone(), scheduler.acquire_context(queue).unwrap());
    let counter = AtomicUsize::new(0);
    let parent = main_ctx
        .create_job(JobSpec {
            target: main_ctx.id().namespace,
            jobmain: Some(fork_four_children),
            user1: &counter as *const AtomicUsize as u64,
            user2: 0,
            parent: JobId::INVALID,
            data: &[],
        })
        .unwrap();

    assert_eq!(
        main_ctx.submit_job(parent, &[], SubmitType::Run),
        SubmitResult::Success
    );
    main_ctx.wait_job(parent);

    assert_eq!(counter.load(Ordering::SeqCst), 4);
    assert_eq!(main_ctx.job_state(parent), Some(JobState::Completed));

    scheduler.terminate();
    for w in workers {
        w.join().unwrap();
    }
}

#[test]
fn dependency_edge_orders_execution() {
    let scheduler = make_scheduler();
    let queue = JobQueue::create();
    let workers = spawn_workers(scheduler.clone(), queue.clone(), 2);

    let main_ctx = JobContext::new(scheduler.clone(), scheduler.acquire_context(queue).unwrap());
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    unsafe extern "C" fn record_first(
        _ctx: *mut std::ffi::c_void,
        _job: JobId,
        _data: *mut u8,
        _size: u32,
        user1: u64,
        _user2: u64,
    ) -> i32 {
        let order = &*(user1 as *const Mutex<Vec<&'static str>>);
        order.lock().unwrap().push("first");
        0
    }
    unsafe extern "C" fn record_second(
        _ctx: *mut std::ffi::c_void,
        _job: JobId,
        _data: *mut u8,
        _size: u32,
        user1: u64,
        _user2: u64,
    ) -> i32 {
        let order = &*(user1 as *const Mutex<Vec<&'static str>>);
        order.lock().unwrap().push("second");
        0
    }

    let order_ptr = Arc::as_ptr(&order) as u64;

    let upstream = main_ctx
        .create_job(JobSpec {
            target: main_ctx.id().namespace,
            jobmain: Some(record_first),
            user1: order_ptr,
            user2: 0,
            parent: JobId::INVALID,
            data: &[],
        })
        .unwrap();
    let downstream = main_ctx
        .create_job(JobSpec {
            target: main_ctx.id().namespace,
            jobmain: Some(record_second),
            user1: order_ptr,
            user2: 0,
            parent: JobId::INVALID,
            data: &[],
        })
        .unwrap();

    // Submit the dependent job first; it must stay NotReady until `upstream` submits.
    assert_eq!(
        main_ctx.submit_job(downstream, &[upstream], SubmitType::Run),
        SubmitResult::Success
    );
    assert_eq!(main_ctx.job_state(downstream), Some(JobState::NotReady));

    assert_eq!(
        main_ctx.submit_job(upstream, &[], SubmitType::Run),
        SubmitResult::Success
    );

    main_ctx.wait_job(downstream);
    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);

    scheduler.terminate();
    for w in workers {
        w.join().unwrap();
    }
}

#[test]
fn fan_in_waits_for_every_dependency() {
    let scheduler = make_scheduler();
    let queue = JobQueue::create();
    let workers = spawn_workers(scheduler.clone(), queue.clone(), 3);

    let main_ctx = JobContext::new(scheduler.clone(), scheduler.acquire_context(queue).unwrap());
    let counter = AtomicUsize::new(0);
    let user1 = &counter as *const AtomicUsize as u64;

    let a = main_ctx
        .create_job(JobSpec {
            target: main_ctx.id().namespace,
            jobmain: Some(increment_job),
            user1,
            user2: 0,
            parent: JobId::INVALID,
            data: &[],
        })
        .unwrap();
    let b = main_ctx
        .create_job(JobSpec {
            target: main_ctx.id().namespace,
            jobmain: Some(increment_job),
            user1,
            user2: 0,
            parent: JobId::INVALID,
            data: &[],
        })
        .unwrap();
    let joined = main_ctx
        .create_job(JobSpec {
            target: main_ctx.id().namespace,
            jobmain: Some(increment_job),
            user1,
            user2: 0,
            parent: JobId::INVALID,
            data: &[],
        })
        .unwrap();

    assert_eq!(
        main_ctx.submit_job(joined, &[a, b], SubmitType::Run),
        SubmitResult::Success
    );
    assert_eq!(main_ctx.job_state(joined), Some(JobState::NotReady));

    assert_eq!(main_ctx.submit_job(a, &[], SubmitType::Run), SubmitResult::Success);
    assert_eq!(main_ctx.job_state(joined), Some(JobState::NotReady));

    assert_eq!(main_ctx.submit_job(b, &[], SubmitType::Run), SubmitResult::Success);

    main_ctx.wait_job(joined);
    assert_eq!(counter.load(Ordering::SeqCst), 3);

    scheduler.terminate();
    for w in workers {
        w.join().unwrap();
    }
}

#[test]
fn cancel_before_submit_skips_job_main() {
    let scheduler = make_scheduler();
    let queue = JobQueue::create();
    let workers = spawn_workers(scheduler.clone(), queue.clone(), 1);

    let main_ctx = JobContext::new(scheduler.clone(), scheduler.acquire_context(queue).unwrap());
    let counter = AtomicUsize::new(0);
    let job = main_ctx
        .create_job(JobSpec {
            target: main_ctx.id().namespace,
            jobmain: Some(increment_job),
            user1: &counter as *const AtomicUsize as u64,
            user2: 0,
            parent: JobId::INVALID,
            data: &[],
        })
        .unwrap();

    assert_eq!(main_ctx.cancel_job(job), SubmitResult::Success);
    main_ctx.wait_job(job);

    assert_eq!(counter.load(Ordering::SeqCst), 0);
    assert_eq!(main_ctx.job_state(job), Some(JobState::Canceled));

    scheduler.terminate();
    for w in workers {
        w.join().unwrap();
    }
}

#[test]
fn canceling_a_dependency_still_releases_its_waiters() {
    let scheduler = make_scheduler();
    let queue = JobQueue::create();
    let workers = spawn_workers(scheduler.clone(), queue.clone(), 1);

    let main_ctx = JobContext::new(scheduler.clone(), scheduler.acquire_context(queue).unwrap());
    let counter = AtomicUsize::new(0);

    let upstream = main_ctx
        .create_job(JobSpec {
            target: main_ctx.id().namespace,
            jobmain: Some(increment_job),
            user1: 0,
            user2: 0,
            parent: JobId::INVALID,
            data: &[],
        })
        .unwrap();
    let downstream = main_ctx
        .create_job(JobSpec {
            target: main_ctx.id().namespace,
            jobmain: Some(increment_job),
            user1: &counter as *const AtomicUsize as u64,
            user2: 0,
            parent: JobId::INVALID,
            data: &[],
        })
        .unwrap();

    assert_eq!(
        main_ctx.submit_job(downstream, &[upstream], SubmitType::Run),
        SubmitResult::Success
    );
    // Canceling before submission is the only legal way to cancel via SubmitType;
    // it still has to walk `upstream`'s dependents and release `downstream`.
    assert_eq!(
        main_ctx.submit_job(upstream, &[], SubmitType::Cancel),
        SubmitResult::Success
    );

    main_ctx.wait_job(downstream);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(main_ctx.job_state(upstream), Some(JobState::Canceled));
    assert_eq!(main_ctx.job_state(downstream), Some(JobState::Completed));

    scheduler.terminate();
    for w in workers {
        w.join().unwrap();
    }
}

#[test]
fn canceling_a_not_yet_run_job_by_id_skips_job_main() {
    let scheduler = make_scheduler();
    let queue = JobQueue::create();

    let main_ctx = JobContext::new(scheduler.clone(), scheduler.acquire_context(queue).unwrap());
    let counter = AtomicUsize::new(0);
    let job = main_ctx
        .create_job(JobSpec {
            target: main_ctx.id().namespace,
            jobmain: Some(increment_job),
            user1: &counter as *const AtomicUsize as u64,
            user2: 0,
            parent: JobId::INVALID,
            data: &[],
        })
        .unwrap();
    assert_eq!(
        main_ctx.submit_job(job, &[], SubmitType::Run),
        SubmitResult::Success
    );

    // No workers running: the job sits Ready in the queue. Cancel it directly
    // through the scheduler (spec §4.D), then let a worker discover the
    // cancellation when it eventually dequeues it.
    scheduler.cancel(job);
    assert_eq!(main_ctx.job_state(job), Some(JobState::Canceled));

    let worker = {
        let scheduler = scheduler.clone();
        let queue = main_ctx.scheduler().get_queue(main_ctx.id().namespace).unwrap();
        std::thread::spawn(move || {
            let id = scheduler.acquire_context(queue).unwrap();
            let ctx = JobContext::new(scheduler.clone(), id);
            ctx.run_next_job()
        })
    };
    assert!(worker.join().unwrap());

    assert_eq!(counter.load(Ordering::SeqCst), 0);
    assert_eq!(main_ctx.job_state(job), Some(JobState::Canceled));
}

#[test]
fn canceling_a_parent_inherits_to_not_yet_run_children() {
    let scheduler = make_scheduler();
    let queue = JobQueue::create();

    let main_ctx = JobContext::new(scheduler.clone(), scheduler.acquire_context(queue.clone()).unwrap());
    let counter = AtomicUsize::new(0);

    let parent = main_ctx
        .create_job(JobSpec {
            target: main_ctx.id().namespace,
            jobmain: Some(increment_job),
            user1: 0,
            user2: 0,
            parent: JobId::INVALID,
            data: &[],
        })
        .unwrap();
    let child = main_ctx
        .create_job(JobSpec {
            target: main_ctx.id().namespace,
            jobmain: Some(increment_job),
            user1: &counter as *const AtomicUsize as u64,
            user2: 0,
            parent,
            data: &[],
        })
        .unwrap();

    assert_eq!(
        main_ctx.submit_job(child, &[], SubmitType::Run),
        SubmitResult::Success
    );
    // Cancel the parent directly (child is already enqueued and Ready).
    scheduler.cancel(parent);

    let worker_ctx = JobContext::new(scheduler.clone(), scheduler.acquire_context(queue).unwrap());
    assert!(worker_ctx.run_next_job());

    assert_eq!(counter.load(Ordering::SeqCst), 0);
    assert_eq!(main_ctx.job_state(child), Some(JobState::Canceled));
}

#[test]
fn terminate_unblocks_idle_workers_promptly() {
    let scheduler = make_scheduler();
    let queue = JobQueue::create();
    let workers = spawn_workers(scheduler.clone(), queue, 3);

    std::thread::sleep(std::time::Duration::from_millis(20));
    scheduler.terminate();

    for w in workers {
        w.join().unwrap();
    }
    assert!(scheduler.is_terminated());
}
