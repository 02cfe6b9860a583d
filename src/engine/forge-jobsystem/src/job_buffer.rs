//! Reference-counted pool of inline job argument storage (spec §4.B).
//!
//! Each [`Buffer`] is a small bump region shared by up to [`BUFFER_JOBS`] jobs.
//! Contexts bump-allocate a job's `data` out of whichever buffer they currently
//! hold, and only reach for a fresh one from the free list once the current
//! buffer is full. Buffers are returned to the free list once every job that
//! referenced them has completed *and* the owning context has released its own
//! hold on the buffer, mirroring the Clone/Drop refcounting of a handle type
//! rather than a GC'd allocation.

use parking_lot::Mutex;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::arena::{AccessFlags, Arena, ArenaFlags};
use crate::{BUFFER_BYTES, BUFFER_JOBS};

struct Buffer {
    base: NonNull<u8>,
    /// Bump offset into this buffer's byte pool. Only ever touched by the single
    /// context thread that currently owns the buffer for allocation purposes.
    offset: AtomicU32,
    job_count: AtomicU32,
    /// Number of live jobs (plus the pool's own bookkeeping ref while it is the
    /// "current" buffer of some context) referencing this buffer's storage.
    refcount: AtomicU32,
}

// SAFETY: `base` points into the pool's own arena; the pool exposes only
// offset-checked slices out of it, each handed to exactly one job.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

pub struct JobBufferPool {
    _arena: Arena,
    buffers: Vec<Buffer>,
    free_list: Mutex<Vec<u32>>,
}

impl JobBufferPool {
    pub fn new(buffer_count: usize) -> Self {
        let mut arena = Arena::create(
            buffer_count * BUFFER_BYTES,
            0,
            16,
            ArenaFlags::Heap.into(),
            AccessFlags::Read | AccessFlags::Write,
            "job-buffer-pool",
            *b"JBUF",
        )
        .expect("job buffer pool allocation failed");

        let mut buffers = Vec::with_capacity(buffer_count);
        for _ in 0..buffer_count {
            let base = arena
                .allocate(BUFFER_BYTES, 16)
                .expect("job buffer pool arena undersized");
            buffers.push(Buffer {
                base,
                offset: AtomicU32::new(0),
                job_count: AtomicU32::new(0),
                refcount: AtomicU32::new(0),
            });
        }

        let free_list = Mutex::new((0..buffer_count as u32).collect());

        Self {
            _arena: arena,
            buffers,
            free_list,
        }
    }

    /// Reserve `size` bytes for a new job, reusing `current` if it has room.
    ///
    /// Returns `(buffer_index, data_ptr)`, or `None` if `size` exceeds a whole
    /// buffer's capacity or the pool is exhausted.
    ///
    /// Whenever this hands back a *fresh* buffer (not a bump within `current`),
    /// the returned index carries one extra reference beyond the job's own:
    /// the calling context's ongoing hold on it as its "current" buffer. That
    /// hold must be released exactly once, via [`JobBufferPool::release`], when
    /// the context stops using the buffer as current (moves on to a new one,
    /// or is dropped) — see [`crate::context::JobContext`]'s `Drop` impl and
    /// its handling of a full `current`. Without it, a buffer could be
    /// recycled and reset the instant its last in-flight job completes, while
    /// the owning context still believes it can bump-allocate more jobs out of
    /// it — corrupting whichever new tenant the free list hands the same
    /// index to next.
    pub fn acquire(&self, current: Option<u32>, size: u32) -> Option<(u32, *mut u8)> {
        if size as usize > BUFFER_BYTES {
            return None;
        }

        if let Some(index) = current {
            if let Some(ptr) = self.try_bump(index, size) {
                self.buffers[index as usize].refcount.fetch_add(1, Ordering::SeqCst);
                return Some((index, ptr));
            }
            // `current` is full: the context is about to move on to a new
            // buffer, so its persistent hold on this one is released here.
            self.release(index);
        }

        let index = self.free_list.lock().pop()?;
        let buffer = &self.buffers[index as usize];
        buffer.offset.store(0, Ordering::SeqCst);
        buffer.job_count.store(0, Ordering::SeqCst);
        // Seed with 2: one for the context's persistent hold on this buffer as
        // its "current" one, one for this first job.
        buffer.refcount.store(2, Ordering::SeqCst);
        let ptr = self
            .try_bump(index, size)
            .expect("freshly reset buffer must fit one job");
        Some((index, ptr))
    }

    fn try_bump(&self, index: u32, size: u32) -> Option<*mut u8> {
        let buffer = &self.buffers[index as usize];
        let job_count = buffer.job_count.load(Ordering::SeqCst);
        if job_count >= BUFFER_JOBS as u32 {
            return None;
        }
        let offset = buffer.offset.load(Ordering::SeqCst);
        let new_offset = offset.checked_add(size)?;
        if new_offset as usize > BUFFER_BYTES {
            return None;
        }
        buffer.offset.store(new_offset, Ordering::SeqCst);
        buffer.job_count.store(job_count + 1, Ordering::SeqCst);
        Some(unsafe { buffer.base.as_ptr().add(offset as usize) })
    }

    /// Drop one job's reference to `index`. Recycles the buffer once the count
    /// reaches zero.
    pub fn release(&self, index: u32) {
        let buffer = &self.buffers[index as usize];
        if buffer.refcount.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.free_list.lock().push(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_reuses_current_buffer_until_full() {
        let pool = JobBufferPool::new(2);
        let (first, _) = pool.acquire(None, 64).unwrap();
        let (second, _) = pool.acquire(Some(first), 64).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn acquire_falls_back_to_free_list_when_current_is_full() {
        let pool = JobBufferPool::new(2);
        let (first, _) = pool.acquire(None, BUFFER_BYTES as u32).unwrap();
        let (second, _) = pool.acquire(Some(first), 64).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn release_recycles_buffer_only_once_job_and_context_hold_both_release() {
        let pool = JobBufferPool::new(1);
        let (first, _) = pool.acquire(None, 64).unwrap();
        pool.release(first); // the job completes; the context's hold is still live
        assert!(pool.acquire(None, 64).is_none(), "buffer must not be recycled yet");
        pool.release(first); // the context moves on / is dropped, releasing its hold
        let (second, _) = pool.acquire(None, 64).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn acquire_returns_none_when_pool_exhausted() {
        let pool = JobBufferPool::new(1);
        let (first, _) = pool.acquire(None, BUFFER_BYTES as u32).unwrap();
        assert!(pool.acquire(Some(first), BUFFER_BYTES as u32).is_none());
        let _ = first;
    }
}
