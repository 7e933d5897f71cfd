//! Copying, promotion and marking of one thread's heap.
//!
//! [`process_worklist`] drains a worklist on behalf of a single target
//! thread. Slots whose referent belongs to another thread are handed to the
//! [`WorkRouter`]; everything else is forwarded, copied within the nursery,
//! promoted into gen2, or (in full runs) marked in place. Tracing a moved
//! object pushes its slots onto the same worklist, so the loop never
//! recurses.

use std::ptr::{self, NonNull};
use std::sync::Arc;

use crate::descriptor::TypeDescriptor;
use crate::fatal::{fatal, fatal_with, GcFatal};
use crate::gc::passing::WorkRouter;
use crate::gc::worklist::Worklist;
use crate::gc::Generation;
use crate::header::{Flags, Forward, Kind, Object, Ref};
use crate::metrics::RunStats;
use crate::thread::{ThreadContext, ThreadStage};

/// State of one participant for the duration of a run.
pub(crate) struct Collector<'a> {
    /// The thread doing the work.
    pub(crate) tc: &'a ThreadContext,
    pub(crate) seq: u32,
    pub(crate) generation: Generation,
    pub(crate) router: WorkRouter,
    pub(crate) stats: RunStats,
}

impl<'a> Collector<'a> {
    pub(crate) fn new(tc: &'a ThreadContext, seq: u32, generation: Generation, pass_work_size: usize) -> Self {
        Self {
            tc,
            seq,
            generation,
            router: WorkRouter::new(pass_work_size),
            stats: RunStats::default(),
        }
    }

    /// A fresh worklist filtered for this run's generation.
    pub(crate) fn worklist(&self) -> Worklist {
        Worklist::new(self.generation == Generation::Full)
    }
}

/// Enqueues every outgoing slot of `r`.
///
/// # Safety
///
/// `r` must be a live allocation that only the caller is tracing.
pub(crate) unsafe fn trace_collectable(r: Ref, worklist: &mut Worklist) {
    // SAFETY: caller guarantees r is live.
    unsafe { worklist.add_slot(r.sc_slot()) };
    // SAFETY: as above.
    match unsafe { r.header() }.kind() {
        Kind::Object => {
            // SAFETY: objects begin with the object prefix.
            let obj = unsafe { Object::from_ref(r) };
            if obj.descriptor.is_null() {
                fatal_with(GcFatal::NullDescriptor, format_args!("object {r:?}"));
            }
            // The descriptor may already have moved; its old copy stays
            // readable until the run ends.
            // SAFETY: non-null descriptor slots point at a descriptor.
            let repr = unsafe { TypeDescriptor::repr_of(obj.descriptor) };
            worklist.add(&mut obj.descriptor);
            repr.trace(r, worklist);
        }
        Kind::TypeObject => {
            // SAFETY: type objects carry the object prefix.
            worklist.add(&mut unsafe { Object::from_ref(r) }.descriptor);
        }
        Kind::Descriptor => {
            // SAFETY: r is a descriptor only the caller is tracing.
            let desc = unsafe { TypeDescriptor::from_ref(r) };
            desc.trace_shared(worklist);
            let repr = Arc::clone(&desc.repr);
            repr.trace_type_metadata(desc, worklist);
        }
    }
}

/// Whether instances of `r`'s representation can reach call frames.
///
/// # Safety
///
/// `r` must be live.
pub(crate) unsafe fn refs_frames(r: Ref) -> bool {
    // SAFETY: caller guarantees r is live.
    if unsafe { r.header() }.kind() != Kind::Object {
        return false;
    }
    // SAFETY: objects carry a descriptor slot.
    let desc = unsafe { Object::descriptor_of(r) };
    // SAFETY: a live object's descriptor is live.
    !desc.is_null() && unsafe { TypeDescriptor::repr_of(desc) }.refs_frames()
}

/// Drains `worklist` on behalf of `target`.
///
/// # Safety
///
/// The caller must be `target`'s collector for the current run, and every
/// queued slot must hold null or a live allocation.
pub(crate) unsafe fn process_worklist(c: &mut Collector<'_>, target: &ThreadContext, worklist: &mut Worklist) {
    let promote_all = matches!(target.stage(), ThreadStage::Exited | ThreadStage::ClearingNursery);
    loop {
        if let Some(frame) = worklist.pop_frame() {
            // SAFETY: queued frames are live for the run.
            let frame = unsafe { &mut *frame.as_ptr() };
            if frame.claim_for_run(c.seq) {
                frame.add_roots(worklist);
            }
            continue;
        }
        let Some(slot) = worklist.pop() else { break };
        // SAFETY: forwarded from the caller.
        unsafe { process_slot(c, target, slot, worklist, promote_all) };
    }
}

unsafe fn process_slot(
    c: &mut Collector<'_>,
    target: &ThreadContext,
    slot: *mut Ref,
    worklist: &mut Worklist,
    promote_all: bool,
) {
    // SAFETY: queued slots are valid.
    let r = unsafe { *slot };
    if r.is_null() {
        return;
    }
    // SAFETY: non-null slots hold live allocations.
    let flags = unsafe { r.flags() };
    if c.generation == Generation::Nursery && flags.contains(Flags::SECOND_GEN) {
        return;
    }

    // SAFETY: we are target's collector.
    let heap = unsafe { target.heap() };
    if heap.nursery.in_copied_tospace(r) {
        return;
    }
    if heap.nursery.in_unallocated_tospace(r) {
        fatal_with(
            GcFatal::HeapCorruption,
            format_args!("slot {slot:p} -> {r:?} past the copy cursor of thread {}", target.thread_id()),
        );
    }

    // SAFETY: as above.
    let owner = unsafe { r.owner() };
    if !ptr::eq(owner, target) {
        // SAFETY: owners of live allocations are registered threads.
        unsafe { c.router.route(slot, owner) };
        return;
    }

    // SAFETY: r is owned by target, whose collector we are.
    match unsafe { r.forward() } {
        Forward::Forwarded(to) => {
            // SAFETY: slot is valid.
            unsafe { *slot = Ref::from_non_null(to) };
            return;
        }
        Forward::FreeListNext(_) => {
            fatal_with(GcFatal::HeapCorruption, format_args!("slot {slot:p} -> freed gen2 slot {r:?}"));
        }
        Forward::Unvisited => {}
    }

    if flags.contains(Flags::SECOND_GEN) {
        // Full run: mark in place.
        let this = NonNull::new(r.as_ptr()).unwrap_or_else(|| fatal(GcFatal::HeapCorruption));
        // SAFETY: owned by target.
        unsafe { r.set_forward(Forward::Forwarded(this)) };
        c.stats.gen2_marked += 1;
        // SAFETY: marked objects are traced exactly once per run.
        unsafe { trace_collectable(r, worklist) };
        return;
    }

    // SAFETY: as above.
    let size = unsafe { r.size() };
    let promote = promote_all || flags.contains(Flags::NURSERY_SEEN);
    let new = if promote {
        let p = heap.gen2.allocate(size);
        // SAFETY: both regions hold at least `size` bytes and do not overlap.
        unsafe { ptr::copy_nonoverlapping(r.as_ptr().cast::<u8>(), p.as_ptr().cast::<u8>(), size) };
        let n = Ref::from_non_null(p);
        // SAFETY: the copy is ours.
        let header = unsafe { n.header() };
        header.remove_flags(Flags::NURSERY_SEEN);
        header.insert_flags(Flags::SECOND_GEN);
        if c.generation == Generation::Full {
            // Gen2 sweep of this run must see the copy as reached.
            // SAFETY: as above.
            unsafe { n.set_forward(Forward::Forwarded(p)) };
        }
        c.stats.promoted += 1;
        n
    } else {
        let Some(p) = heap.nursery.allocate(size) else {
            fatal_with(
                GcFatal::AllocationFailure,
                format_args!("tospace of thread {} exhausted while copying", target.thread_id()),
            );
        };
        // SAFETY: as in the promotion branch.
        unsafe { ptr::copy_nonoverlapping(r.as_ptr().cast::<u8>(), p.as_ptr().cast::<u8>(), size) };
        let n = Ref::from_non_null(p);
        // SAFETY: the copy is ours.
        unsafe { n.header() }.insert_flags(Flags::NURSERY_SEEN);
        c.stats.copied += 1;
        n
    };

    let to = NonNull::new(new.as_ptr()).unwrap_or_else(|| fatal(GcFatal::HeapCorruption));
    // SAFETY: the old copy is owned by target.
    unsafe {
        r.set_forward(Forward::Forwarded(to));
        *slot = new;
    }

    let start = worklist.len();
    // SAFETY: the new copy is live and only reachable by us so far.
    unsafe { trace_collectable(new, worklist) };

    if promote {
        // SAFETY: the new copy is live and its slots hold live referents.
        let young_referent = worklist
            .slots_since(start)
            .iter()
            .any(|&s| !unsafe { stays_in_gen2(*s, target) });
        // SAFETY: as above.
        if young_referent || unsafe { refs_frames(new) } {
            heap.gen2roots.add(new);
        }
    }
}

/// Whether `r` is, or has already been promoted to, a gen2 object.
///
/// # Safety
///
/// `r` must be live, and the caller must be `target`'s collector.
unsafe fn stays_in_gen2(r: Ref, target: &ThreadContext) -> bool {
    // SAFETY: caller guarantees r is live.
    if unsafe { r.flags() }.contains(Flags::SECOND_GEN) {
        return true;
    }
    // Forwarding state of foreign objects belongs to their collector.
    // SAFETY: as above.
    if !ptr::eq(unsafe { r.owner() }, target) {
        return false;
    }
    // SAFETY: r is owned by target.
    match unsafe { r.forward() } {
        // SAFETY: forwarded copies are live.
        Forward::Forwarded(to) => unsafe { Ref::from_non_null(to).flags() }.contains(Flags::SECOND_GEN),
        _ => false,
    }
}

/// Frees every fromspace allocation below `limit` that was not copied.
/// Dead descriptors are queued on `deferred` instead.
///
/// # Safety
///
/// The run's finish barrier must have passed, and the caller must be
/// `target`'s collector.
pub(crate) unsafe fn free_nursery_uncopied(target: &ThreadContext, limit: *mut u8, deferred: &mut Vec<Ref>) -> usize {
    // SAFETY: as above.
    let heap = unsafe { target.heap() };
    let mut freed = 0;
    for r in heap.nursery.fromspace_objects(limit) {
        // SAFETY: fromspace headers stay readable until the next swap.
        if unsafe { r.forward() }.is_forwarded() {
            continue;
        }
        // SAFETY: as above.
        match unsafe { r.header() }.kind() {
            Kind::Object => {
                // SAFETY: objects carry a descriptor slot.
                let desc = unsafe { Object::descriptor_of(r) };
                if !desc.is_null() {
                    // SAFETY: descriptors are destroyed only after every
                    // participant has swept.
                    unsafe { TypeDescriptor::repr_of(desc) }.free(r);
                }
                freed += 1;
            }
            Kind::TypeObject => freed += 1,
            Kind::Descriptor => deferred.push(r),
        }
    }
    freed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::StructRepr;
    use crate::instance::Instance;
    use crate::GcConfig;

    #[derive(Default)]
    #[repr(C)]
    struct Cell {
        next: Ref,
    }

    // SAFETY: the only slot is enqueued.
    unsafe impl crate::Trace for Cell {
        fn trace(&mut self, worklist: &mut Worklist) {
            worklist.add(&mut self.next);
        }
    }

    #[test]
    fn test_trace_collectable_enqueues_descriptor_and_body() {
        let instance = Instance::new(GcConfig::default()).unwrap();
        let tc = instance.main_thread();
        let desc = tc.allocate_descriptor(Arc::new(StructRepr::<Cell>::new("Cell")), "Cell");
        let a = tc.allocate_object(desc, StructRepr::<Cell>::body_size());
        let b = tc.allocate_object(desc, StructRepr::<Cell>::body_size());
        unsafe { StructRepr::<Cell>::body(a) }.next = b;

        let mut wl = Worklist::new(true);
        unsafe { trace_collectable(a, &mut wl) };
        // Descriptor slot and `next`; the null sc slot is skipped.
        assert_eq!(wl.len(), 2);
    }

    #[test]
    #[should_panic(expected = "null type descriptor")]
    fn test_null_descriptor_is_fatal() {
        let instance = Instance::new(GcConfig::default()).unwrap();
        let tc = instance.main_thread();
        let desc = tc.allocate_descriptor(Arc::new(StructRepr::<Cell>::new("Cell")), "Cell");
        let obj = tc.allocate_object(desc, StructRepr::<Cell>::body_size());
        unsafe { Object::from_ref(obj) }.descriptor = Ref::NULL;
        let mut wl = Worklist::new(true);
        unsafe { trace_collectable(obj, &mut wl) };
    }
}
