//! Per-thread two-space bump allocator.
//!
//! Mutators allocate from the tospace. A run swaps the two spaces, copies
//! survivors into the fresh tospace and then allocation continues right
//! after the copies. Whatever is left in the fromspace up to the old cursor
//! is garbage once the run's barrier has passed.

use std::ptr::NonNull;

use sys_alloc::Region;

use crate::fatal::{fatal_with, GcFatal};
use crate::header::{align_size, Collectable, Ref};

/// Semispaces and allocation cursor of one thread.
pub(crate) struct Nursery {
    fromspace: Region,
    tospace: Region,
    alloc: *mut u8,
    limit: *mut u8,
}

// SAFETY: the nursery is only touched by its owning thread or by the
// thread collecting on its behalf.
unsafe impl Send for Nursery {}

impl Nursery {
    /// Maps both semispaces.
    pub(crate) fn new(size: usize) -> Self {
        let map = |len| {
            Region::map(len).unwrap_or_else(|err| {
                fatal_with(GcFatal::AllocationFailure, format_args!("nursery: {err}"))
            })
        };
        let fromspace = map(size);
        let tospace = map(size);
        let alloc = tospace.start();
        let limit = tospace.end();
        Self {
            fromspace,
            tospace,
            alloc,
            limit,
        }
    }

    /// Bytes per semispace.
    pub(crate) fn capacity(&self) -> usize {
        self.tospace.len()
    }

    /// Bump-allocates `size` zeroed bytes, or `None` when the space is full.
    pub(crate) fn allocate(&mut self, size: usize) -> Option<NonNull<Collectable>> {
        let size = align_size(size);
        let remaining = self.limit as usize - self.alloc as usize;
        if size > remaining {
            return None;
        }
        let ptr = self.alloc;
        // SAFETY: `size` bytes fit before `limit`.
        self.alloc = unsafe { self.alloc.add(size) };
        NonNull::new(ptr.cast())
    }

    /// Swaps the semispaces for a run and returns the fromspace sweep limit.
    pub(crate) fn swap(&mut self) -> *mut u8 {
        let sweep_limit = self.alloc;
        std::mem::swap(&mut self.fromspace, &mut self.tospace);
        self.alloc = self.tospace.start();
        self.limit = self.tospace.end();
        sweep_limit
    }

    /// Whether `r` is a copy made into the tospace during this run.
    pub(crate) fn in_copied_tospace(&self, r: Ref) -> bool {
        let a = r.addr();
        a >= self.tospace.start() as usize && a < self.alloc as usize
    }

    /// Whether `r` lies in the part of the tospace not handed out yet.
    pub(crate) fn in_unallocated_tospace(&self, r: Ref) -> bool {
        let a = r.addr();
        a >= self.alloc as usize && a < self.tospace.end() as usize
    }

    /// Whether `r` lies anywhere in this nursery.
    pub(crate) fn contains(&self, r: Ref) -> bool {
        let a = r.as_ptr().cast::<u8>().cast_const();
        self.fromspace.contains(a) || self.tospace.contains(a)
    }

    /// Clears the tospace past the last copy so later allocations read zero.
    pub(crate) fn zero_free_space(&self) {
        let offset = self.alloc as usize - self.tospace.start() as usize;
        // SAFETY: nothing live lies past the cursor.
        unsafe { self.tospace.zero(offset, self.tospace.len() - offset) };
    }

    /// Headers in the fromspace up to `limit`.
    pub(crate) fn fromspace_objects(&self, limit: *mut u8) -> FromspaceIter {
        FromspaceIter {
            cur: self.fromspace.start(),
            limit,
        }
    }

    /// Bytes allocated in the tospace.
    pub(crate) fn used(&self) -> usize {
        self.alloc as usize - self.tospace.start() as usize
    }
}

impl std::fmt::Debug for Nursery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nursery")
            .field("capacity", &self.capacity())
            .field("used", &self.used())
            .finish_non_exhaustive()
    }
}

/// Walks the allocations of a fromspace in address order.
pub(crate) struct FromspaceIter {
    cur: *mut u8,
    limit: *mut u8,
}

impl Iterator for FromspaceIter {
    type Item = Ref;

    fn next(&mut self) -> Option<Ref> {
        if self.cur >= self.limit {
            return None;
        }
        let r = Ref::from_raw(self.cur.cast());
        // SAFETY: every allocation below the old cursor starts with a header.
        let size = unsafe { r.size() };
        if size == 0 {
            fatal_with(GcFatal::HeapCorruption, format_args!("zero-sized nursery object at {r:?}"));
        }
        // SAFETY: sizes never run past the cursor they were bumped from.
        self.cur = unsafe { self.cur.add(size) };
        Some(r)
    }
}
