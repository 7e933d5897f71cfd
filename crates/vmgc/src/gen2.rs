//! Generation-2 store: non-moving size-class bins with free lists.
//!
//! Each bin hands out fixed-size slots carved from pages of
//! `gen2_page_items` slots. A dead slot keeps its header and records the next
//! free slot of the bin in its [`Forward`] state. Objects larger than the
//! largest bin are allocated individually and tracked on an overflow list.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::{self, NonNull};

use crate::descriptor::TypeDescriptor;
use crate::fatal::{fatal, GcFatal};
use crate::header::{align_size, Collectable, Flags, Forward, Kind, Object, Ref, ALIGN};
use crate::thread::ThreadContext;

/// log2 of the bin granularity.
pub const BIN_BITS: usize = 3;
/// Number of size classes.
pub const BINS: usize = 32;
/// Largest size served from a bin.
pub const MAX_BIN_SIZE: usize = BINS << BIN_BITS;

/// Bin serving allocations of `size` bytes.
#[must_use]
pub const fn bin_for(size: usize) -> usize {
    (align_size(size) >> BIN_BITS) - 1
}

/// Slot size of `bin`.
#[must_use]
pub const fn bin_size(bin: usize) -> usize {
    (bin + 1) << BIN_BITS
}

/// How dead type descriptors are handled by [`Gen2Store::sweep`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepMode {
    /// Ordinary full run: dead descriptors get one run of grace.
    Run,
    /// Shutdown: dead descriptors are handed to the deferred list.
    GlobalDestruction,
}

/// Counts produced by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Gen2SweepStats {
    /// Objects and type objects returned to free lists.
    pub freed: usize,
    /// Descriptors destroyed after their grace run.
    pub descriptors_freed: usize,
    /// Descriptors that started their grace run.
    pub descriptors_graced: usize,
    /// Surviving allocations.
    pub live: usize,
}

struct SizeClass {
    pages: Vec<NonNull<u8>>,
    current: Option<NonNull<u8>>,
    alloc_pos: *mut u8,
    alloc_limit: *mut u8,
    free_list: Option<NonNull<Collectable>>,
}

impl SizeClass {
    const fn new() -> Self {
        Self {
            pages: Vec::new(),
            current: None,
            alloc_pos: ptr::null_mut(),
            alloc_limit: ptr::null_mut(),
            free_list: None,
        }
    }
}

/// Per-thread generation-2 store.
pub(crate) struct Gen2Store {
    bins: Vec<SizeClass>,
    overflow: Vec<(NonNull<Collectable>, usize)>,
    page_items: usize,
}

// SAFETY: the store is only touched by its owning thread, by the thread
// collecting on its behalf, or by the thread absorbing it.
unsafe impl Send for Gen2Store {}

impl Gen2Store {
    pub(crate) fn new(page_items: usize) -> Self {
        Self {
            bins: (0..BINS).map(|_| SizeClass::new()).collect(),
            overflow: Vec::new(),
            page_items,
        }
    }

    fn page_layout(&self, bin: usize) -> Layout {
        Layout::from_size_align(bin_size(bin) * self.page_items, ALIGN)
            .unwrap_or_else(|_| fatal(GcFatal::AllocationFailure))
    }

    /// Allocates `size` zeroed bytes.
    pub(crate) fn allocate(&mut self, size: usize) -> NonNull<Collectable> {
        let size = align_size(size);
        if size > MAX_BIN_SIZE {
            return self.allocate_overflow(size);
        }
        let bin = bin_for(size);
        let slot_size = bin_size(bin);

        if let Some(head) = self.bins[bin].free_list {
            let r = Ref::from_non_null(head);
            // SAFETY: free slots carry a valid header with a free-list link.
            self.bins[bin].free_list = match unsafe { r.forward() } {
                Forward::FreeListNext(next) => next,
                _ => fatal(GcFatal::HeapCorruption),
            };
            // SAFETY: the slot belongs to this bin and is free.
            unsafe { ptr::write_bytes(head.as_ptr().cast::<u8>(), 0, slot_size) };
            return head;
        }

        let class = &mut self.bins[bin];
        if class.alloc_pos.is_null() || class.alloc_pos >= class.alloc_limit {
            let layout = self.page_layout(bin);
            // SAFETY: the layout is non-zero sized.
            let page = unsafe { alloc_zeroed(layout) };
            let Some(page) = NonNull::new(page) else {
                fatal(GcFatal::AllocationFailure)
            };
            let class = &mut self.bins[bin];
            class.pages.push(page);
            class.current = Some(page);
            class.alloc_pos = page.as_ptr();
            // SAFETY: the page spans `layout.size()` bytes.
            class.alloc_limit = unsafe { page.as_ptr().add(layout.size()) };
        }
        let class = &mut self.bins[bin];
        let slot = class.alloc_pos;
        // SAFETY: a whole slot fits before the limit.
        class.alloc_pos = unsafe { slot.add(slot_size) };
        NonNull::new(slot.cast()).unwrap_or_else(|| fatal(GcFatal::AllocationFailure))
    }

    fn allocate_overflow(&mut self, size: usize) -> NonNull<Collectable> {
        let layout =
            Layout::from_size_align(size, ALIGN).unwrap_or_else(|_| fatal(GcFatal::AllocationFailure));
        // SAFETY: the layout is non-zero sized.
        let p = unsafe { alloc_zeroed(layout) };
        let Some(p) = NonNull::new(p.cast::<Collectable>()) else {
            fatal(GcFatal::AllocationFailure)
        };
        self.overflow.push((p, size));
        p
    }

    /// Used extent of `page` in `bin`.
    fn page_end(&self, bin: usize, page: NonNull<u8>) -> *mut u8 {
        let class = &self.bins[bin];
        if class.current == Some(page) {
            return class.alloc_pos;
        }
        // SAFETY: pages span a whole page layout.
        unsafe { page.as_ptr().add(bin_size(bin) * self.page_items) }
    }

    fn slots(&self, bin: usize) -> Vec<Ref> {
        let size = bin_size(bin);
        let mut out = Vec::new();
        for &page in &self.bins[bin].pages {
            let end = self.page_end(bin, page) as usize;
            let mut cur = page.as_ptr() as usize;
            while cur < end {
                out.push(Ref::from_raw(cur as *mut Collectable));
                cur += size;
            }
        }
        out
    }

    /// Frees every allocation not visited in the finished run and clears
    /// the mark of every survivor.
    ///
    /// Free lists are rebuilt in address order, so sweeping a store in which
    /// nothing new died leaves them unchanged.
    pub(crate) fn sweep(&mut self, mode: SweepMode, deferred: &mut Vec<Ref>) -> Gen2SweepStats {
        let mut stats = Gen2SweepStats::default();
        for bin in 0..BINS {
            let mut head: Option<NonNull<Collectable>> = None;
            let mut tail: Option<Ref> = None;
            for r in self.slots(bin) {
                // SAFETY: every slot up to the used extent holds a header.
                let free = match unsafe { r.forward() } {
                    Forward::FreeListNext(_) => true,
                    Forward::Forwarded(_) => {
                        // SAFETY: live slot owned by this store.
                        unsafe { reset_survivor(r) };
                        stats.live += 1;
                        false
                    }
                    // SAFETY: dead slot owned by this store.
                    Forward::Unvisited => unsafe { free_dead(r, mode, deferred, &mut stats) },
                };
                if free {
                    // SAFETY: the slot is free and owned by this store.
                    unsafe { r.set_forward(Forward::FreeListNext(None)) };
                    let link = NonNull::new(r.as_ptr());
                    match tail {
                        // SAFETY: the previous free slot is owned by this store.
                        Some(prev) => unsafe { prev.set_forward(Forward::FreeListNext(link)) },
                        None => head = link,
                    }
                    tail = Some(r);
                }
            }
            self.bins[bin].free_list = head;
        }

        let mut kept = Vec::with_capacity(self.overflow.len());
        for (p, size) in std::mem::take(&mut self.overflow) {
            let r = Ref::from_non_null(p);
            // SAFETY: overflow entries hold live headers until deallocated.
            match unsafe { r.forward() } {
                Forward::Forwarded(_) => {
                    // SAFETY: live allocation owned by this store.
                    unsafe { reset_survivor(r) };
                    stats.live += 1;
                    kept.push((p, size));
                }
                _ => {
                    // SAFETY: dead allocation owned by this store.
                    let release = unsafe { free_dead(r, mode, deferred, &mut stats) };
                    if release {
                        // SAFETY: allocated in allocate_overflow with this size.
                        unsafe { dealloc(p.as_ptr().cast(), Layout::from_size_align_unchecked(size, ALIGN)) };
                    } else {
                        kept.push((p, size));
                    }
                }
            }
        }
        self.overflow = kept;
        stats
    }

    /// Takes over every page of `other`, rewriting owners to `new_owner`.
    pub(crate) fn absorb(&mut self, mut other: Self, new_owner: *const ThreadContext) {
        for bin in 0..BINS {
            let size = bin_size(bin);
            for slot in other.slots(bin) {
                // SAFETY: every slot up to the used extent holds a header.
                unsafe {
                    if !matches!(slot.forward(), Forward::FreeListNext(_)) {
                        slot.set_owner(new_owner);
                    }
                }
            }
            // Unused tail of the last page becomes free slots.
            let class = &mut other.bins[bin];
            let mut cur = class.alloc_pos;
            while !cur.is_null() && cur < class.alloc_limit {
                let r = Ref::from_raw(cur.cast());
                // SAFETY: zeroed slot inside the page.
                unsafe { r.set_forward(Forward::FreeListNext(class.free_list)) };
                class.free_list = NonNull::new(cur.cast());
                // SAFETY: stays within the page.
                cur = unsafe { cur.add(size) };
            }
            class.alloc_pos = class.alloc_limit;
            class.current = None;

            let mut next = class.free_list.take();
            while let Some(slot) = next {
                let r = Ref::from_non_null(slot);
                // SAFETY: free slots carry a link.
                next = match unsafe { r.forward() } {
                    Forward::FreeListNext(n) => n,
                    _ => fatal(GcFatal::HeapCorruption),
                };
                // SAFETY: the slot now belongs to this store.
                unsafe { r.set_forward(Forward::FreeListNext(self.bins[bin].free_list)) };
                self.bins[bin].free_list = Some(slot);
            }
            let pages = std::mem::take(&mut class.pages);
            self.bins[bin].pages.splice(0..0, pages);
        }
        for (p, size) in std::mem::take(&mut other.overflow) {
            // SAFETY: no run is tracing the absorbed allocations.
            unsafe { Ref::from_non_null(p).set_owner(new_owner) };
            self.overflow.push((p, size));
        }
    }

    /// Whether `r` points into this store.
    pub(crate) fn contains(&self, r: Ref) -> bool {
        let a = r.addr();
        for bin in 0..BINS {
            let len = bin_size(bin) * self.page_items;
            for page in &self.bins[bin].pages {
                let start = page.as_ptr() as usize;
                if a >= start && a < start + len {
                    return true;
                }
            }
        }
        self.overflow.iter().any(|(p, _)| p.as_ptr() as usize == a)
    }

    /// Addresses on the free list of `bin`, head first.
    pub(crate) fn free_list_snapshot(&self, bin: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut next = self.bins[bin].free_list;
        while let Some(slot) = next {
            out.push(slot.as_ptr() as usize);
            // SAFETY: free slots carry a link.
            next = match unsafe { Ref::from_non_null(slot).forward() } {
                Forward::FreeListNext(n) => n,
                _ => None,
            };
        }
        out
    }
}

impl Drop for Gen2Store {
    fn drop(&mut self) {
        for bin in 0..BINS {
            let layout = self.page_layout(bin);
            for page in self.bins[bin].pages.drain(..) {
                // SAFETY: pages were allocated with this layout.
                unsafe { dealloc(page.as_ptr(), layout) };
            }
        }
        for (p, size) in self.overflow.drain(..) {
            // SAFETY: allocated in allocate_overflow with this size.
            unsafe { dealloc(p.as_ptr().cast(), Layout::from_size_align_unchecked(size, ALIGN)) };
        }
    }
}

impl std::fmt::Debug for Gen2Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pages: usize = self.bins.iter().map(|b| b.pages.len()).sum();
        f.debug_struct("Gen2Store")
            .field("pages", &pages)
            .field("overflow", &self.overflow.len())
            .finish_non_exhaustive()
    }
}

unsafe fn reset_survivor(r: Ref) {
    // SAFETY: caller guarantees r is a live slot of the sweeping store.
    unsafe {
        r.set_forward(Forward::Unvisited);
        r.header().remove_flags(Flags::DIED_LAST_RUN);
    }
}

/// Releases a dead allocation. Returns whether its memory may be reused.
unsafe fn free_dead(
    r: Ref,
    mode: SweepMode,
    deferred: &mut Vec<Ref>,
    stats: &mut Gen2SweepStats,
) -> bool {
    // SAFETY: caller guarantees r is a dead allocation of the sweeping store.
    let header = unsafe { r.header() };
    match header.kind() {
        Kind::Object => {
            // SAFETY: objects carry a descriptor slot.
            let desc = unsafe { Object::descriptor_of(r) };
            if !desc.is_null() {
                // SAFETY: a descriptor outlives its instances by a grace run.
                unsafe { TypeDescriptor::repr_of(desc) }.free(r);
            }
            stats.freed += 1;
            true
        }
        Kind::TypeObject => {
            stats.freed += 1;
            true
        }
        Kind::Descriptor => match mode {
            SweepMode::GlobalDestruction => {
                deferred.push(r);
                false
            }
            SweepMode::Run if header.flags().contains(Flags::DIED_LAST_RUN) => {
                // SAFETY: unreachable for a whole run; no worklist can hold it.
                unsafe { TypeDescriptor::destroy(r) };
                stats.descriptors_freed += 1;
                true
            }
            SweepMode::Run => {
                header.insert_flags(Flags::DIED_LAST_RUN);
                stats.descriptors_graced += 1;
                false
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn type_object(store: &mut Gen2Store) -> Ref {
        let size = crate::header::OBJECT_BODY_OFFSET;
        let p = store.allocate(size);
        unsafe {
            Collectable::init(
                p,
                align_size(size),
                Flags::IS_TYPE_OBJECT | Flags::SECOND_GEN,
                ptr::null(),
            );
        }
        Ref::from_non_null(p)
    }

    fn mark(r: Ref) {
        unsafe { r.set_forward(Forward::Forwarded(NonNull::new(r.as_ptr()).unwrap())) };
    }

    #[test]
    fn test_bins() {
        assert_eq!(bin_for(8), 0);
        assert_eq!(bin_for(48), 5);
        assert_eq!(bin_size(5), 48);
        assert_eq!(bin_for(MAX_BIN_SIZE), BINS - 1);
    }

    #[test]
    fn test_sweep_frees_unmarked_and_reuses() {
        let mut store = Gen2Store::new(4);
        let a = type_object(&mut store);
        let b = type_object(&mut store);
        mark(a);
        let stats = store.sweep(SweepMode::Run, &mut Vec::new());
        assert_eq!(stats.freed, 1);
        assert_eq!(stats.live, 1);
        let bin = bin_for(crate::header::OBJECT_BODY_OFFSET);
        assert_eq!(store.free_list_snapshot(bin), vec![b.addr()]);
        assert_eq!(unsafe { a.forward() }, Forward::Unvisited);

        let c = store.allocate(crate::header::OBJECT_BODY_OFFSET);
        assert_eq!(c.as_ptr() as usize, b.addr());
        assert!(store.free_list_snapshot(bin).is_empty());
    }

    #[test]
    fn test_sweep_is_idempotent() {
        let mut store = Gen2Store::new(8);
        let objs: Vec<Ref> = (0..6).map(|_| type_object(&mut store)).collect();
        for r in objs.iter().step_by(2) {
            mark(*r);
        }
        store.sweep(SweepMode::Run, &mut Vec::new());
        let bin = bin_for(crate::header::OBJECT_BODY_OFFSET);
        let before = store.free_list_snapshot(bin);
        assert_eq!(before.len(), 3);

        for r in objs.iter().step_by(2) {
            mark(*r);
        }
        let stats = store.sweep(SweepMode::Run, &mut Vec::new());
        assert_eq!(stats.freed, 0);
        assert_eq!(store.free_list_snapshot(bin), before);
    }

    #[test]
    fn test_overflow_allocation() {
        let mut store = Gen2Store::new(4);
        let p = store.allocate(MAX_BIN_SIZE + 8);
        unsafe { Collectable::init(p, MAX_BIN_SIZE + 8, Flags::IS_TYPE_OBJECT, ptr::null()) };
        let r = Ref::from_non_null(p);
        assert!(store.contains(r));
        let stats = store.sweep(SweepMode::Run, &mut Vec::new());
        assert_eq!(stats.freed, 1);
        assert!(!store.contains(r));
    }

    #[test]
    fn test_absorb_rewrites_owner_and_free_slots() {
        let mut a = Gen2Store::new(4);
        let mut b = Gen2Store::new(4);
        let live = type_object(&mut b);
        let new_owner = 0x1000 as *const ThreadContext;
        a.absorb(b, new_owner);
        assert!(a.contains(live));
        assert_eq!(unsafe { live.owner() }, new_owner);
        let bin = bin_for(crate::header::OBJECT_BODY_OFFSET);
        assert_eq!(a.free_list_snapshot(bin).len(), 3);
    }
}
