//! Linear / growable arena allocator (spec §4.A).
//!
//! A chain of bump-allocated chunks backed by either the process heap or the
//! virtual memory manager. Not thread-safe: callers must externalize
//! synchronization, or use one allocator per thread (see [`crate::job_buffer`]).

use enumflags2::{bitflags, BitFlags};
use forge_core::forge_warn;
use std::alloc::{self, Layout};
use std::ptr::NonNull;

#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArenaFlags {
    /// The arena's storage is only ever touched by one thread.
    Local,
    /// The arena's storage may be observed by other threads (informational only).
    Shared,
    /// Chunks are backed by the process heap.
    Heap,
    /// Chunks are backed by the system virtual memory manager.
    Virtual,
    /// Storage was supplied by the caller; the arena does not own it.
    External,
    /// A new chunk may be appended when the tail chunk is exhausted.
    Growable,
}

#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AccessFlags {
    Read,
    Write,
}

#[derive(Debug)]
pub enum ArenaError {
    AllocFailure,
}

const DEFAULT_ALIGNMENT: usize = 16;

struct Chunk {
    memory_start: NonNull<u8>,
    /// Number of bytes usable for bump allocation (excludes the guard region).
    maximum_offset: u64,
    next_offset: u64,
    /// Total bytes actually reserved from the backing allocator (including guard).
    reserved_bytes: usize,
    guard_size: usize,
}

/// Snapshot of an arena's bump position, for rollback via [`Arena::reset_to_marker`].
#[derive(Copy, Clone, Debug)]
pub struct Marker {
    chunk: usize,
    offset: u64,
    tag: [u8; 4],
    version: u32,
}

/// A marker-paired allocation whose size may be trimmed on [`Arena::commit`].
#[derive(Copy, Clone, Debug)]
pub struct Reservation {
    chunk: usize,
    offset: u64,
    length: u64,
    tag: [u8; 4],
    version: u32,
}

pub struct Arena {
    chunks: Vec<Chunk>,
    /// Index of the chunk currently being bumped (`tail` in spec terms). `head` is always 0.
    tail: usize,
    name: String,
    chunk_size: u64,
    high_watermark: u64,
    version: u32,
    flags: BitFlags<ArenaFlags>,
    access: BitFlags<AccessFlags>,
    guard_size: usize,
    alignment: usize,
    page_size: usize,
    tag: [u8; 4],
}

fn align_up(value: u64, alignment: u64) -> u64 {
    (value + (alignment - 1)) & !(alignment - 1)
}

fn is_pow2(v: usize) -> bool {
    v != 0 && (v & (v - 1)) == 0
}

#[cfg(unix)]
fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(not(unix))]
fn page_size() -> usize {
    4096
}

#[cfg(unix)]
fn vmm_allocate(min_size: usize, access: BitFlags<AccessFlags>) -> Option<(NonNull<u8>, usize)> {
    let size = align_up(min_size as u64, page_size() as u64) as usize;
    let prot = access_to_prot(access);
    unsafe {
        let ptr = libc::mmap(
            std::ptr::null_mut(),
            size,
            prot,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if ptr == libc::MAP_FAILED {
            None
        } else {
            Some((NonNull::new_unchecked(ptr as *mut u8), size))
        }
    }
}

#[cfg(unix)]
fn vmm_protect(address: NonNull<u8>, size: usize, access: BitFlags<AccessFlags>) -> bool {
    if size == 0 {
        return true;
    }
    let prot = access_to_prot(access);
    unsafe { libc::mprotect(address.as_ptr() as *mut libc::c_void, size, prot) == 0 }
}

#[cfg(unix)]
fn vmm_release(address: NonNull<u8>, size: usize) -> bool {
    if size == 0 {
        return true;
    }
    unsafe { libc::munmap(address.as_ptr() as *mut libc::c_void, size) == 0 }
}

#[cfg(unix)]
fn access_to_prot(access: BitFlags<AccessFlags>) -> libc::c_int {
    let mut prot = libc::PROT_NONE;
    if access.contains(AccessFlags::Read) {
        prot = libc::PROT_READ;
    }
    if access.contains(AccessFlags::Write) {
        prot |= libc::PROT_WRITE;
    }
    prot
}

#[cfg(not(unix))]
fn vmm_allocate(min_size: usize, _access: BitFlags<AccessFlags>) -> Option<(NonNull<u8>, usize)> {
    heap_allocate(min_size, page_size())
}

#[cfg(not(unix))]
fn vmm_protect(_address: NonNull<u8>, _size: usize, _access: BitFlags<AccessFlags>) -> bool {
    true
}

#[cfg(not(unix))]
fn vmm_release(address: NonNull<u8>, size: usize) -> bool {
    heap_release(address, size);
    true
}

fn heap_allocate(min_size: usize, alignment: usize) -> Option<(NonNull<u8>, usize)> {
    let alignment = alignment.max(std::mem::align_of::<usize>());
    debug_assert!(is_pow2(alignment), "alignment must be a power of two");
    let layout = Layout::from_size_align(min_size, alignment).ok()?;
    let ptr = unsafe { alloc::alloc(layout) };
    NonNull::new(ptr).map(|p| (p, min_size))
}

fn heap_release(address: NonNull<u8>, size: usize) {
    // Layout's alignment only matters for the deallocator's bookkeeping; use the
    // minimum alignment guaranteed by `heap_allocate`.
    let layout = Layout::from_size_align(size, std::mem::align_of::<usize>())
        .unwrap_or_else(|_| Layout::from_size_align(size.max(1), 1).unwrap());
    unsafe { alloc::dealloc(address.as_ptr(), layout) };
}

impl Arena {
    /// Allocate an initial chunk and build an allocator around it.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        chunk_size: usize,
        guard_size: usize,
        alignment: usize,
        mut flags: BitFlags<ArenaFlags>,
        access: BitFlags<AccessFlags>,
        name: impl Into<String>,
        tag: [u8; 4],
    ) -> Result<Self, ArenaError> {
        debug_assert!(
            !flags.contains(ArenaFlags::External),
            "ArenaFlags::External is rejected by Arena::create; use create_with_memory"
        );
        let alignment = if alignment == 0 {
            DEFAULT_ALIGNMENT
        } else {
            alignment
        };
        debug_assert!(is_pow2(alignment), "alignment must be a power of two");

        if !flags.contains(ArenaFlags::Heap) && !flags.contains(ArenaFlags::Virtual) {
            flags.insert(ArenaFlags::Heap);
        }

        let page_size = page_size();
        let mut arena = Self {
            chunks: Vec::new(),
            tail: 0,
            name: name.into(),
            chunk_size: chunk_size as u64,
            high_watermark: 0,
            version: 0,
            flags,
            access,
            guard_size,
            alignment,
            page_size,
            tag,
        };

        let chunk = arena.allocate_chunk(chunk_size)?;
        arena.chunks.push(chunk);
        Ok(arena)
    }

    /// Wrap caller-owned storage. Implies `External`, disables `Growable`.
    pub fn create_with_memory(
        memory: NonNull<u8>,
        length: usize,
        flags: BitFlags<ArenaFlags>,
        access: BitFlags<AccessFlags>,
        name: impl Into<String>,
        tag: [u8; 4],
    ) -> Result<Self, ArenaError> {
        let mut flags = flags | ArenaFlags::External;
        flags.remove(ArenaFlags::Growable);

        Ok(Self {
            chunks: vec![Chunk {
                memory_start: memory,
                maximum_offset: length as u64,
                next_offset: 0,
                reserved_bytes: length,
                guard_size: 0,
            }],
            tail: 0,
            name: name.into(),
            chunk_size: length as u64,
            high_watermark: 0,
            version: 0,
            flags,
            access,
            guard_size: 0,
            alignment: DEFAULT_ALIGNMENT,
            page_size: page_size(),
            tag,
        })
    }

    /// Allocate `length` bytes from `parent` and wrap it as external storage.
    pub fn create_suballocator(
        parent: &mut Arena,
        length: usize,
        name: impl Into<String>,
        tag: [u8; 4],
    ) -> Result<Self, ArenaError> {
        let memory = parent
            .allocate(length, parent.alignment)
            .ok_or(ArenaError::AllocFailure)?;
        Self::create_with_memory(
            memory,
            length,
            BitFlags::from(ArenaFlags::External),
            parent.access,
            name,
            tag,
        )
    }

    fn allocate_chunk(&self, size: usize) -> Result<Chunk, ArenaError> {
        if self.flags.contains(ArenaFlags::Virtual) {
            let requested = align_up(size as u64, self.page_size as u64) as usize;
            let total = requested + align_up(self.guard_size as u64, self.page_size as u64) as usize;
            let (memory_start, reserved_bytes) = vmm_allocate(total, self.access)
                .ok_or(ArenaError::AllocFailure)?;
            if self.guard_size > 0 {
                let guard_addr = unsafe { memory_start.as_ptr().add(requested) };
                let guard_addr = unsafe { NonNull::new_unchecked(guard_addr) };
                vmm_protect(guard_addr, reserved_bytes - requested, BitFlags::empty());
            }
            Ok(Chunk {
                memory_start,
                maximum_offset: requested as u64,
                next_offset: 0,
                reserved_bytes,
                guard_size: reserved_bytes - requested,
            })
        } else {
            let (memory_start, reserved_bytes) = heap_allocate(size, self.alignment)
                .ok_or(ArenaError::AllocFailure)?;
            Ok(Chunk {
                memory_start,
                maximum_offset: reserved_bytes as u64,
                next_offset: 0,
                reserved_bytes,
                guard_size: 0,
            })
        }
    }

    fn free_chunk(&self, chunk: &Chunk) {
        if self.flags.contains(ArenaFlags::External) {
            return;
        }
        if self.flags.contains(ArenaFlags::Virtual) {
            vmm_release(chunk.memory_start, chunk.reserved_bytes);
        } else {
            heap_release(chunk.memory_start, chunk.reserved_bytes);
        }
    }

    /// Bump-allocate `length` bytes aligned to `alignment` (a non-zero power of two).
    pub fn allocate(&mut self, length: usize, alignment: usize) -> Option<NonNull<u8>> {
        debug_assert!(is_pow2(alignment), "alignment must be a power of two");
        let ptr = self.bump(length, alignment)?;
        self.version = self.version.wrapping_add(1);
        Some(ptr)
    }

    /// Bump without touching the version counter; used internally by `allocate`/`reserve`.
    fn bump(&mut self, length: usize, alignment: usize) -> Option<NonNull<u8>> {
        if let Some(ptr) = self.try_bump_tail(length, alignment) {
            return Some(ptr);
        }

        if !self.flags.contains(ArenaFlags::Growable) {
            return None;
        }

        let new_size = (self.chunk_size as usize).max(length + alignment);
        let chunk = self.allocate_chunk(new_size).ok()?;
        self.chunks.push(chunk);
        self.tail = self.chunks.len() - 1;
        self.try_bump_tail(length, alignment)
    }

    fn try_bump_tail(&mut self, length: usize, alignment: usize) -> Option<NonNull<u8>> {
        let chunk = &mut self.chunks[self.tail];
        let base = chunk.memory_start.as_ptr() as u64;
        let aligned_offset = align_up(base + chunk.next_offset, alignment as u64) - base;
        let end = aligned_offset + length as u64;
        if end > chunk.maximum_offset {
            return None;
        }
        chunk.next_offset = end;
        let used = unsafe { chunk.memory_start.as_ptr().add(aligned_offset as usize) };
        let total_used: u64 = self
            .chunks
            .iter()
            .enumerate()
            .map(|(i, c)| if i == self.tail { end } else { c.next_offset })
            .sum();
        self.high_watermark = self.high_watermark.max(total_used);
        Some(unsafe { NonNull::new_unchecked(used) })
    }

    /// Snapshot the current bump position for later rollback.
    pub fn mark(&self) -> Marker {
        Marker {
            chunk: self.tail,
            offset: self.chunks[self.tail].next_offset,
            tag: self.tag,
            version: self.version,
        }
    }

    /// Reserve up to `max_bytes`; the caller trims the unused tail via [`Arena::commit`].
    pub fn reserve(&mut self, max_bytes: usize, alignment: usize) -> Option<(NonNull<u8>, Reservation)> {
        debug_assert!(is_pow2(alignment), "alignment must be a power of two");
        let offset_before = self.chunks[self.tail].next_offset;
        let chunk_before = self.tail;
        let ptr = self.bump(max_bytes, alignment)?;
        self.version = self.version.wrapping_add(1);

        // If bump() grew into a new chunk, the reservation lives entirely in that chunk.
        let (chunk, offset) = if self.tail == chunk_before {
            (chunk_before, offset_before)
        } else {
            (self.tail, 0)
        };

        Some((
            ptr,
            Reservation {
                chunk,
                offset: self.bump_offset_for(&ptr, chunk) .unwrap_or(offset),
                length: max_bytes as u64,
                tag: self.tag,
                version: self.version,
            },
        ))
    }

    fn bump_offset_for(&self, ptr: &NonNull<u8>, chunk: usize) -> Option<u64> {
        let base = self.chunks.get(chunk)?.memory_start.as_ptr() as u64;
        Some(ptr.as_ptr() as u64 - base)
    }

    /// Complete a reservation. `used_bytes == 0` cancels it.
    pub fn commit(&mut self, reservation: Reservation, start: NonNull<u8>, used_bytes: usize) -> NonNull<u8> {
        debug_assert_eq!(reservation.tag, self.tag, "reservation from a different allocator");
        let no_intervening_alloc =
            self.tail == reservation.chunk && self.version == reservation.version;

        if no_intervening_alloc {
            let new_offset = reservation.offset + used_bytes as u64;
            debug_assert!(new_offset <= reservation.offset + reservation.length);
            self.chunks[reservation.chunk].next_offset = new_offset;
            self.version = self.version.wrapping_add(1);
        }
        // Else: an intervening allocation happened; the reservation is irrevocable and the
        // unused tail of it is wasted.
        start
    }

    /// Free all chunks past `head`, restoring the allocator to its just-created state.
    pub fn reset(&mut self) {
        self.reset_to_marker(None);
    }

    /// Roll the allocator back to a previously obtained [`Marker`]. `None` is equivalent to [`Arena::reset`].
    pub fn reset_to_marker(&mut self, marker: Option<Marker>) {
        match marker {
            Some(m) if m.tag == self.tag => {
                for chunk in self.chunks.drain(m.chunk + 1..) {
                    self.free_chunk(&chunk);
                }
                self.chunks[m.chunk].next_offset = m.offset;
                self.tail = m.chunk;
            }
            Some(_) => {
                forge_warn!("reset_to_marker: marker tag does not match allocator tag, ignoring");
                return;
            }
            None => {
                for chunk in self.chunks.drain(1..) {
                    self.free_chunk(&chunk);
                }
                self.chunks[0].next_offset = 0;
                self.tail = 0;
            }
        }
        self.version = self.version.wrapping_add(1);
    }

    pub fn high_water_mark(&self) -> u64 {
        self.high_watermark
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag(&self) -> [u8; 4] {
        self.tag
    }

    pub fn flags(&self) -> BitFlags<ArenaFlags> {
        self.flags
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        for chunk in &self.chunks {
            self.free_chunk(chunk);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_arena(growable: bool) -> Arena {
        let mut flags = BitFlags::from(ArenaFlags::Heap);
        if growable {
            flags.insert(ArenaFlags::Growable);
        }
        Arena::create(4096, 0, 16, flags, BitFlags::from(AccessFlags::Read) | AccessFlags::Write, "test", *b"TEST")
            .unwrap()
    }

    #[test]
    fn allocations_are_aligned_and_update_watermark() {
        let mut arena = default_arena(false);
        for &(size, align) in &[(1usize, 1usize), (3, 4), (7, 8), (100, 32)] {
            let ptr = arena.allocate(size, align).unwrap();
            assert_eq!(ptr.as_ptr() as usize % align, 0);
        }
        assert!(arena.high_water_mark() >= 1);
    }

    #[test]
    fn mark_then_reset_to_marker_restores_offset() {
        let mut arena = default_arena(false);
        arena.allocate(64, 8).unwrap();
        let marker = arena.mark();
        arena.allocate(64, 8).unwrap();
        arena.allocate(128, 16).unwrap();
        arena.reset_to_marker(Some(marker));
        assert_eq!(arena.chunks[0].next_offset, marker.offset);
    }

    #[test]
    fn reserve_then_commit_with_no_intervening_alloc_shrinks() {
        let mut arena = default_arena(false);
        let (ptr, res) = arena.reserve(128, 8).unwrap();
        let before_version = arena.version();
        let committed = arena.commit(res, ptr, 16);
        assert_eq!(committed, ptr);
        assert_ne!(arena.version(), before_version);
        assert_eq!(arena.chunks[0].next_offset, res.offset + 16);
    }

    #[test]
    fn reserve_then_commit_with_intervening_alloc_wastes_tail() {
        let mut arena = default_arena(false);
        let (ptr, res) = arena.reserve(128, 8).unwrap();
        arena.allocate(8, 8).unwrap();
        let offset_after_intervening = arena.chunks[0].next_offset;
        arena.commit(res, ptr, 16);
        assert_eq!(arena.chunks[0].next_offset, offset_after_intervening);
    }

    #[test]
    fn commit_zero_used_bytes_cancels_reservation() {
        let mut arena = default_arena(false);
        let offset_before = arena.chunks[0].next_offset;
        let (ptr, res) = arena.reserve(128, 8).unwrap();
        arena.commit(res, ptr, 0);
        assert_eq!(arena.chunks[0].next_offset, offset_before);
    }

    #[test]
    fn reset_then_repeat_allocations_on_nongrowable_yields_same_addresses() {
        let mut arena = default_arena(false);
        let first: Vec<_> = (0..8).map(|i| arena.allocate(16, 8).unwrap().as_ptr() as usize).collect();
        arena.reset();
        let second: Vec<_> = (0..8).map(|i| arena.allocate(16, 8).unwrap().as_ptr() as usize).collect();
        assert_eq!(first, second);
        let _ = (first, second);
    }

    #[test]
    fn growable_arena_allocates_new_chunk_on_overflow() {
        let mut arena = default_arena(true);
        // Exhaust the first 4096-byte chunk, forcing growth.
        for _ in 0..300 {
            arena.allocate(16, 8).unwrap();
        }
        assert!(arena.chunks.len() > 1);
    }

    #[test]
    fn nongrowable_arena_fails_on_overflow() {
        let mut arena = default_arena(false);
        assert!(arena.allocate(4096 * 2, 8).is_none());
    }
}
