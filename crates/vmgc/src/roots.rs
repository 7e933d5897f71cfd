//! Root sets.
//!
//! Roots are slots that are not reachable through another traced object:
//! process-lifetime permanent roots, instance-wide tables, per-thread
//! interpreter slots, scoped temporaries, and gen2 objects that reference the
//! nursery.

use crate::fatal::{fatal, GcFatal};
use crate::gc::collect::{refs_frames, trace_collectable};
use crate::gc::worklist::Worklist;
use crate::header::{Flags, Forward, Ref};
use crate::thread::ThreadContext;

// ============================================================================
// TempRoots - scoped protection of intermediate values
// ============================================================================

/// Per-thread stack of temporarily rooted slots.
#[derive(Debug, Default)]
pub(crate) struct TempRoots {
    slots: Vec<*mut Ref>,
}

impl TempRoots {
    pub(crate) const fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Roots `slot` until the matching pop.
    pub(crate) fn push(&mut self, slot: *mut Ref) {
        if slot.is_null() {
            fatal(GcFatal::NullRoot);
        }
        self.slots.push(slot);
    }

    pub(crate) fn pop(&mut self) {
        if self.slots.pop().is_none() {
            fatal(GcFatal::TempRootUnderflow);
        }
    }

    pub(crate) fn pop_n(&mut self, n: usize) {
        if n > self.slots.len() {
            fatal(GcFatal::TempRootUnderflow);
        }
        self.slots.truncate(self.slots.len() - n);
    }

    /// Current depth, for [`TempRoots::reset_to`].
    pub(crate) fn mark(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn reset_to(&mut self, mark: usize) {
        if mark > self.slots.len() {
            fatal(GcFatal::TempRootUnderflow);
        }
        self.slots.truncate(mark);
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn add_to(&self, worklist: &mut Worklist) {
        for &slot in &self.slots {
            // SAFETY: pushed slots stay valid until popped.
            unsafe { worklist.add_slot(slot) };
        }
    }
}

/// Pops every temporary root pushed during its lifetime.
///
/// # Examples
///
/// ```
/// use vmgc::{GcConfig, Instance, Ref};
///
/// let instance = Instance::new(GcConfig::default()).unwrap();
/// let tc = instance.main_thread();
/// let mut slot = Ref::NULL;
/// {
///     let _scope = tc.root_scope();
///     unsafe { tc.root_push(&mut slot) };
///     tc.collect();
/// }
/// assert_eq!(tc.temp_root_count(), 0);
/// ```
pub struct RootScope<'a> {
    tc: &'a ThreadContext,
    mark: usize,
}

impl<'a> RootScope<'a> {
    pub(crate) fn new(tc: &'a ThreadContext) -> Self {
        // SAFETY: the owning thread is the only mutator of its temp roots.
        let mark = unsafe { tc.heap() }.temp.mark();
        Self { tc, mark }
    }
}

impl Drop for RootScope<'_> {
    fn drop(&mut self) {
        // SAFETY: as in `new`.
        unsafe { self.tc.heap() }.temp.reset_to(self.mark);
    }
}

// ============================================================================
// Gen2Roots - inter-generational back-pointers
// ============================================================================

/// Gen2 objects that may reference nursery objects.
#[derive(Debug, Default)]
pub(crate) struct Gen2Roots {
    list: Vec<Ref>,
}

impl Gen2Roots {
    pub(crate) const fn new() -> Self {
        Self { list: Vec::new() }
    }

    /// Adds `r` unless it is already listed.
    pub(crate) fn add(&mut self, r: Ref) {
        // SAFETY: callers pass live gen2 objects.
        let header = unsafe { r.header() };
        if !header.flags().contains(Flags::IN_GEN2_ROOT_LIST) {
            header.insert_flags(Flags::IN_GEN2_ROOT_LIST);
            self.list.push(r);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.list.len()
    }

    pub(crate) fn contains(&self, r: Ref) -> bool {
        self.list.contains(&r)
    }

    /// Enqueues the nursery referents of every root and drops roots that no
    /// longer reference the nursery.
    pub(crate) fn add_nursery_referents(&mut self, worklist: &mut Worklist) {
        let mut scratch = Worklist::new(false);
        self.list.retain(|&root| {
            // SAFETY: listed roots are live gen2 objects.
            unsafe { trace_collectable(root, &mut scratch) };
            // SAFETY: as above.
            let mut keep = !scratch.is_empty() || unsafe { refs_frames(root) };
            while let Some(slot) = scratch.pop() {
                worklist.push_unchecked(slot);
            }
            for frame in scratch.take_frames() {
                worklist.add_frame(frame);
                keep = true;
            }
            if !keep {
                // SAFETY: as above.
                unsafe { root.header() }.remove_flags(Flags::IN_GEN2_ROOT_LIST);
            }
            keep
        });
    }

    /// Drops roots that were not reached in the finished full run.
    pub(crate) fn remove_dead(&mut self) {
        // SAFETY: forward states are read by the owning collector before the
        // gen2 sweep resets them.
        self.list
            .retain(|&r| matches!(unsafe { r.forward() }, Forward::Forwarded(_)));
    }

    pub(crate) fn clear(&mut self) {
        for r in self.list.drain(..) {
            // SAFETY: listed roots are live until the store is swept.
            unsafe { r.header() }.remove_flags(Flags::IN_GEN2_ROOT_LIST);
        }
    }

    /// Moves every root of `other` into this list.
    pub(crate) fn absorb(&mut self, other: &mut Self) {
        self.list.append(&mut other.list);
    }
}

// ============================================================================
// ThreadRoots / InstanceRoots / PermanentRoots
// ============================================================================

/// Interpreter-level slots of one thread.
#[derive(Debug, Default)]
pub struct ThreadRoots {
    /// The language-level thread object.
    pub thread_obj: Ref,
    /// Result of the last exception handler.
    pub last_handler_result: Ref,
    /// Current `usecapture` argument capture.
    pub cur_usecapture: Ref,
    /// Serialization contexts being compiled.
    pub compiling_scs: Ref,
    /// Dispatcher for the next call.
    pub cur_dispatcher: Ref,
    /// Compilation unit of the interpreter loop.
    pub interp_cu: Ref,
    /// Objects of active exception handlers.
    pub active_handlers: Vec<Ref>,
}

impl ThreadRoots {
    pub(crate) fn add_to(&mut self, worklist: &mut Worklist) {
        worklist.add(&mut self.thread_obj);
        worklist.add(&mut self.last_handler_result);
        worklist.add(&mut self.cur_usecapture);
        worklist.add(&mut self.compiling_scs);
        worklist.add(&mut self.cur_dispatcher);
        worklist.add(&mut self.interp_cu);
        for slot in &mut self.active_handlers {
            worklist.add(slot);
        }
    }
}

/// A weakly held entry: the handle is kept alive until it resolves.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeakHandle {
    /// Key object.
    pub handle: Ref,
    /// Resolution, null while unresolved.
    pub resolved: Ref,
}

/// Instance-wide tables.
#[derive(Debug, Default)]
pub struct InstanceRoots {
    /// Registered compilers.
    pub compiler_registry: Ref,
    /// Per-language symbol table.
    pub hll_syms: Ref,
    /// Command-line arguments object.
    pub clargs: Ref,
    /// Loaded compilation units.
    pub loaded_compunits: Vec<Ref>,
    /// Weak handle table.
    pub weak_handles: Vec<WeakHandle>,
}

impl InstanceRoots {
    pub(crate) fn add_to(&mut self, worklist: &mut Worklist) {
        worklist.add(&mut self.compiler_registry);
        worklist.add(&mut self.hll_syms);
        worklist.add(&mut self.clargs);
        for slot in &mut self.loaded_compunits {
            worklist.add(slot);
        }
        for entry in &mut self.weak_handles {
            if entry.resolved.is_null() {
                worklist.add(&mut entry.handle);
            }
        }
    }
}

/// Process-lifetime root slots.
#[derive(Debug, Default)]
pub(crate) struct PermanentRoots {
    slots: Vec<*mut Ref>,
}

// SAFETY: registered slots live for the process and are only written by
// the collector during a run.
unsafe impl Send for PermanentRoots {}

impl PermanentRoots {
    pub(crate) fn add(&mut self, slot: *mut Ref) {
        if slot.is_null() {
            fatal(GcFatal::NullRoot);
        }
        self.slots.push(slot);
    }

    pub(crate) fn add_to(&self, worklist: &mut Worklist) {
        for &slot in &self.slots {
            // SAFETY: permanent slots live for the process.
            unsafe { worklist.add_slot(slot) };
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}
