//! Per-thread collector state.
//!
//! Every mutator thread owns a [`ThreadContext`]: its nursery, its gen2
//! store, its root sets, and the atomics through which a run interrupts,
//! steals and releases it.
//!
//! A context is driven by exactly one OS thread at a time. The heap half of
//! it is touched either by that thread while it mutates, or by the single
//! collector that owns it for the duration of a run.

use std::cell::UnsafeCell;
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use crossbeam::utils::Backoff;
use crossbeam_queue::SegQueue;

use crate::config::GcConfig;
use crate::descriptor::{Representation, TypeDescriptor, DESCRIPTOR_SIZE};
use crate::fatal::{fatal, fatal_with, GcFatal};
use crate::frame::Frame;
use crate::gc::orchestrate;
use crate::gc::passing::InTray;
use crate::gc::sync::{LockOrder, OrderedMutex};
use crate::gen2::Gen2Store;
use crate::header::{align_size, Collectable, Flags, Object, Ref, OBJECT_BODY_OFFSET};
use crate::instance::Instance;
use crate::nursery::Nursery;
use crate::roots::{Gen2Roots, RootScope, TempRoots, ThreadRoots};

/// Participation of a thread in collection runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GcStatus {
    /// Running; will notice an interrupt at its next safepoint.
    None = 0,
    /// Blocked outside the VM; may be stolen.
    Unable = 1,
    /// Asked to join the current run.
    Interrupt = 2,
    /// Blocked, and another thread is collecting on its behalf.
    Stolen = 3,
}

impl GcStatus {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::None,
            1 => Self::Unable,
            2 => Self::Interrupt,
            _ => Self::Stolen,
        }
    }
}

/// Lifecycle of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ThreadStage {
    /// Registered, OS thread not yet running.
    Starting = 0,
    /// Running user code.
    Started = 1,
    /// User code returned; objects still owned.
    Exited = 2,
    /// Collected once after exit; destroyed by the next run.
    ClearingNursery = 3,
    /// Heap handed to another thread and unregistered.
    Destroyed = 4,
}

impl ThreadStage {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Starting,
            1 => Self::Started,
            2 => Self::Exited,
            3 => Self::ClearingNursery,
            _ => Self::Destroyed,
        }
    }
}

/// Heap and roots of one thread.
pub(crate) struct HeapState {
    pub(crate) nursery: Nursery,
    pub(crate) gen2: Gen2Store,
    pub(crate) temp: TempRoots,
    pub(crate) gen2roots: Gen2Roots,
    pub(crate) thread_roots: ThreadRoots,
    pub(crate) cur_frame: Option<NonNull<Frame>>,
}

/// Collector state of one mutator thread.
pub struct ThreadContext {
    instance: Weak<Instance>,
    config: GcConfig,
    thread_id: u32,
    status: AtomicU8,
    stage: AtomicU8,
    gc_owner: AtomicPtr<ThreadContext>,
    gc_thread_id: AtomicU32,
    /// Children awaiting their first run between runs; threads being
    /// collected on this thread's behalf during one.
    pub(crate) gc_work: OrderedMutex<Vec<Arc<ThreadContext>>>,
    pub(crate) in_tray: InTray,
    /// Own gen2 containers written by other threads, drained at run start.
    remote_roots: SegQueue<Ref>,
    heap: UnsafeCell<HeapState>,
}

// SAFETY: the heap is only accessed by the owning thread between runs and by
// its collector during one; the run protocol hands it over through the
// status atomics. Everything else is atomic or locked.
unsafe impl Send for ThreadContext {}
// SAFETY: see above.
unsafe impl Sync for ThreadContext {}

impl ThreadContext {
    pub(crate) fn new(
        instance: Weak<Instance>,
        config: GcConfig,
        thread_id: u32,
        status: GcStatus,
        stage: ThreadStage,
    ) -> Self {
        Self {
            instance,
            config,
            thread_id,
            status: AtomicU8::new(status as u8),
            stage: AtomicU8::new(stage as u8),
            gc_owner: AtomicPtr::new(ptr::null_mut()),
            gc_thread_id: AtomicU32::new(0),
            gc_work: OrderedMutex::new(LockOrder::ThreadWork, Vec::new()),
            in_tray: InTray::new(),
            remote_roots: SegQueue::new(),
            heap: UnsafeCell::new(HeapState {
                nursery: Nursery::new(config.nursery_size),
                gen2: Gen2Store::new(config.gen2_page_items),
                temp: TempRoots::new(),
                gen2roots: Gen2Roots::new(),
                thread_roots: ThreadRoots::default(),
                cur_frame: None,
            }),
        }
    }

    /// The owning instance.
    pub(crate) fn instance(&self) -> Arc<Instance> {
        self.instance.upgrade().unwrap_or_else(|| {
            fatal_with(
                GcFatal::InstanceGone,
                format_args!("thread {}", self.thread_id),
            )
        })
    }

    /// Collector configuration of the instance.
    pub(crate) const fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Mutable access to the heap half of the context.
    ///
    /// # Safety
    ///
    /// The caller must be the owning thread outside a run, or the thread
    /// collecting this context inside one, and must not keep an earlier
    /// borrow alive across the call.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn heap(&self) -> &mut HeapState {
        // SAFETY: caller upholds exclusivity.
        unsafe { &mut *self.heap.get() }
    }

    /// Instance-unique id, starting at 1 for the main thread.
    #[must_use]
    pub const fn thread_id(&self) -> u32 {
        self.thread_id
    }

    /// Current run participation.
    #[must_use]
    pub fn status(&self) -> GcStatus {
        GcStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Current lifecycle stage.
    #[must_use]
    pub fn stage(&self) -> ThreadStage {
        ThreadStage::from_u8(self.stage.load(Ordering::Acquire))
    }

    pub(crate) fn set_stage(&self, stage: ThreadStage) {
        self.stage.store(stage as u8, Ordering::Release);
    }

    /// Atomically moves the status from `from` to `to`, returning the
    /// observed status on failure.
    pub(crate) fn cas_status(&self, from: GcStatus, to: GcStatus) -> Result<(), GcStatus> {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(GcStatus::from_u8)
    }

    /// The thread collecting this one in the current run, or null.
    pub(crate) fn gc_owner(&self) -> *const ThreadContext {
        self.gc_owner.load(Ordering::Acquire)
    }

    pub(crate) fn set_gc_owner(&self, owner: *const ThreadContext) {
        self.gc_owner.store(owner.cast_mut(), Ordering::Release);
    }

    /// Run-scoped participant id, 0 outside a run.
    pub(crate) fn gc_thread_id(&self) -> u32 {
        self.gc_thread_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_gc_thread_id(&self, id: u32) {
        self.gc_thread_id.store(id, Ordering::Release);
    }

    /// Moves gen2 containers written by other threads into this thread's
    /// inter-generational root list.
    ///
    /// # Safety
    ///
    /// As [`ThreadContext::heap`].
    pub(crate) unsafe fn drain_remote_roots_into(&self, roots: &mut Gen2Roots) {
        while let Some(r) = self.remote_roots.pop() {
            roots.add(r);
        }
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    fn allocate_raw(&self, size: usize, flags: Flags) -> Ref {
        let size = align_size(size);
        let owner: *const Self = self;
        // SAFETY: the owning thread is mutating; no run holds the heap.
        let fits = size <= unsafe { self.heap() }.nursery.capacity();
        if fits {
            // SAFETY: as above.
            if let Some(p) = unsafe { self.heap() }.nursery.allocate(size) {
                // SAFETY: fresh nursery memory of `size` bytes.
                unsafe { Collectable::init(p, size, flags, owner) };
                return Ref::from_non_null(p);
            }
            orchestrate::trigger_from_allocator(self);
            // SAFETY: the run has released the heap.
            if let Some(p) = unsafe { self.heap() }.nursery.allocate(size) {
                // SAFETY: as above.
                unsafe { Collectable::init(p, size, flags, owner) };
                return Ref::from_non_null(p);
            }
        }
        // SAFETY: as above.
        let p = unsafe { self.heap() }.gen2.allocate(size);
        // SAFETY: fresh zeroed gen2 slot.
        unsafe { Collectable::init(p, size, flags.union(Flags::SECOND_GEN), owner) };
        Ref::from_non_null(p)
    }

    fn allocate_with_descriptor(&self, descriptor: Ref, size: usize, flags: Flags) -> Ref {
        if descriptor.is_null() {
            fatal(GcFatal::NullDescriptor);
        }
        let mut descriptor = descriptor;
        let obj = {
            let _scope = self.root_scope();
            // SAFETY: the slot outlives the scope.
            unsafe { self.root_push(&mut descriptor) };
            self.allocate_raw(size, flags)
        };
        // SAFETY: obj is a fresh object allocation.
        unsafe { Object::from_ref(obj) }.descriptor = descriptor;
        self.write_barrier(obj, descriptor);
        obj
    }

    /// Allocates an object of type `descriptor` with a zeroed body of
    /// `body_size` bytes.
    ///
    /// May run a collection, after which every unrooted [`Ref`] held by the
    /// caller is stale.
    pub fn allocate_object(&self, descriptor: Ref, body_size: usize) -> Ref {
        self.allocate_with_descriptor(descriptor, OBJECT_BODY_OFFSET + body_size, Flags::empty())
    }

    /// Allocates a type object of type `descriptor`.
    pub fn allocate_type_object(&self, descriptor: Ref) -> Ref {
        self.allocate_with_descriptor(descriptor, OBJECT_BODY_OFFSET, Flags::IS_TYPE_OBJECT)
    }

    /// Allocates a type descriptor using `repr` for its instances.
    pub fn allocate_descriptor(&self, repr: Arc<dyn Representation>, name: impl Into<String>) -> Ref {
        let desc = self.allocate_raw(DESCRIPTOR_SIZE, Flags::IS_TYPE_DESCRIPTOR);
        // SAFETY: fresh zeroed descriptor allocation.
        unsafe { TypeDescriptor::init(desc, repr, name.into()) };
        desc
    }

    /// Records that `container` now references `referent`.
    ///
    /// Must follow every store of a reference into an existing object; a
    /// gen2 container pointing at a young referent becomes an
    /// inter-generational root of its owner.
    pub fn write_barrier(&self, container: Ref, referent: Ref) {
        if container.is_null() || referent.is_null() {
            return;
        }
        // SAFETY: both are live allocations.
        let (cflags, rflags) = unsafe { (container.flags(), referent.flags()) };
        if !cflags.contains(Flags::SECOND_GEN)
            || rflags.contains(Flags::SECOND_GEN)
            || cflags.contains(Flags::IN_GEN2_ROOT_LIST)
        {
            return;
        }
        // SAFETY: as above.
        let owner = unsafe { container.owner() };
        if ptr::eq(owner, self) {
            // SAFETY: the owning thread is mutating.
            unsafe { self.heap() }.gen2roots.add(container);
        } else {
            // SAFETY: owners of live allocations are registered.
            unsafe { &*owner }.remote_roots.push(container);
        }
    }

    /// Stores `value` into `*slot` inside `container` and applies the write
    /// barrier.
    ///
    /// # Safety
    ///
    /// `slot` must be a reference slot of the live allocation `container`.
    pub unsafe fn assign_ref(&self, container: Ref, slot: *mut Ref, value: Ref) {
        // SAFETY: caller guarantees the slot.
        unsafe { *slot = value };
        self.write_barrier(container, value);
    }

    // ------------------------------------------------------------------
    // Roots
    // ------------------------------------------------------------------

    /// Roots `slot` until the matching pop.
    ///
    /// # Safety
    ///
    /// `slot` must stay valid until it is popped.
    pub unsafe fn root_push(&self, slot: *mut Ref) {
        // SAFETY: the owning thread is mutating.
        unsafe { self.heap() }.temp.push(slot);
    }

    /// Pops the most recent temporary root.
    pub fn root_pop(&self) {
        // SAFETY: as above.
        unsafe { self.heap() }.temp.pop();
    }

    /// Pops the `n` most recent temporary roots.
    pub fn root_pop_n(&self, n: usize) {
        // SAFETY: as above.
        unsafe { self.heap() }.temp.pop_n(n);
    }

    /// Number of temporary roots.
    #[must_use]
    pub fn temp_root_count(&self) -> usize {
        // SAFETY: as above.
        unsafe { self.heap() }.temp.len()
    }

    /// Opens a scope that pops every temporary root pushed inside it.
    #[must_use]
    pub fn root_scope(&self) -> RootScope<'_> {
        RootScope::new(self)
    }

    /// Runs `f` on the interpreter-level root slots.
    pub fn with_thread_roots<R>(&self, f: impl FnOnce(&mut ThreadRoots) -> R) -> R {
        // SAFETY: as above.
        f(&mut unsafe { self.heap() }.thread_roots)
    }

    /// Sets the innermost call frame; `None` clears it.
    ///
    /// # Safety
    ///
    /// The frame chain must stay valid and unmoved while installed.
    pub unsafe fn set_current_frame(&self, frame: Option<NonNull<Frame>>) {
        // SAFETY: as above.
        unsafe { self.heap() }.cur_frame = frame;
    }

    // ------------------------------------------------------------------
    // Run participation
    // ------------------------------------------------------------------

    /// Joins a pending run if this thread has been interrupted.
    pub fn safepoint(&self) {
        if self.status() == GcStatus::Interrupt {
            orchestrate::trigger_from_interrupt(self);
        }
    }

    /// Declares the thread blocked: runs proceed without waiting for it and
    /// may collect its heap on its behalf.
    pub fn mark_blocked(&self) {
        loop {
            match self.cas_status(GcStatus::None, GcStatus::Unable) {
                Ok(()) => return,
                Err(GcStatus::Interrupt) => orchestrate::trigger_from_interrupt(self),
                Err(status) => fatal_with(
                    GcFatal::InvalidTransition,
                    format_args!("thread {} blocking from {status:?}", self.thread_id),
                ),
            }
        }
    }

    /// Leaves the blocked state, waiting out any run collecting this thread.
    pub fn mark_unblocked(&self) {
        let backoff = Backoff::new();
        loop {
            match self.cas_status(GcStatus::Unable, GcStatus::None) {
                Ok(()) => return,
                Err(GcStatus::Stolen) => backoff.snooze(),
                Err(status) => fatal_with(
                    GcFatal::InvalidTransition,
                    format_args!("thread {} unblocking from {status:?}", self.thread_id),
                ),
            }
        }
    }

    /// Runs `f` with the thread marked blocked.
    pub fn blocking<R>(&self, f: impl FnOnce() -> R) -> R {
        self.mark_blocked();
        let out = f();
        self.mark_unblocked();
        out
    }

    /// Joins an OS thread without holding up collection runs.
    pub fn join<R>(&self, handle: JoinHandle<R>) -> std::thread::Result<R> {
        self.blocking(|| handle.join())
    }

    /// Runs a collection now.
    pub fn collect(&self) {
        orchestrate::trigger_from_allocator(self);
    }

    /// Runs a full collection now.
    pub fn collect_full(&self) {
        self.instance().coordinator.force_full(self.config.gen2_ratio);
        orchestrate::trigger_from_allocator(self);
    }

    /// Marks the thread exited and hands it over to the collector.
    pub(crate) fn exit(&self) {
        // SAFETY: the owning thread is still mutating.
        let heap = unsafe { self.heap() };
        heap.temp.clear();
        heap.cur_frame = None;
        self.set_stage(ThreadStage::Exited);
        self.instance().note_exited();
        self.mark_blocked();
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Whether `r` lies in this thread's nursery.
    #[must_use]
    pub fn nursery_contains(&self, r: Ref) -> bool {
        // SAFETY: read-only use by the owning thread.
        unsafe { self.heap() }.nursery.contains(r)
    }

    /// Whether `r` lies in this thread's gen2 store.
    #[must_use]
    pub fn gen2_contains(&self, r: Ref) -> bool {
        // SAFETY: as above.
        unsafe { self.heap() }.gen2.contains(r)
    }

    /// Whether `r` is in this thread's inter-generational root list.
    #[must_use]
    pub fn has_gen2_root(&self, r: Ref) -> bool {
        // SAFETY: as above.
        unsafe { self.heap() }.gen2roots.contains(r)
    }

    /// Length of this thread's inter-generational root list.
    #[must_use]
    pub fn gen2_root_count(&self) -> usize {
        // SAFETY: as above.
        unsafe { self.heap() }.gen2roots.len()
    }

    /// Bytes allocated in the nursery since the last run.
    #[must_use]
    pub fn nursery_used(&self) -> usize {
        // SAFETY: as above.
        unsafe { self.heap() }.nursery.used()
    }
}

impl fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadContext")
            .field("thread_id", &self.thread_id)
            .field("status", &self.status())
            .field("stage", &self.stage())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for s in [GcStatus::None, GcStatus::Unable, GcStatus::Interrupt, GcStatus::Stolen] {
            assert_eq!(GcStatus::from_u8(s as u8), s);
        }
        assert!(ThreadStage::Exited < ThreadStage::ClearingNursery);
    }

    #[test]
    fn test_blocking_round_trip() {
        let instance = Instance::new(GcConfig::default()).unwrap();
        let tc = instance.main_thread();
        let out = tc.blocking(|| {
            assert_eq!(tc.status(), GcStatus::Unable);
            7
        });
        assert_eq!(out, 7);
        assert_eq!(tc.status(), GcStatus::None);
    }

    #[test]
    #[should_panic(expected = "invalid thread status transition")]
    fn test_unblock_while_running_is_fatal() {
        let instance = Instance::new(GcConfig::default()).unwrap();
        instance.main_thread().mark_unblocked();
    }

    #[test]
    #[should_panic(expected = "null type descriptor")]
    fn test_null_descriptor_allocation_is_fatal() {
        let instance = Instance::new(GcConfig::default()).unwrap();
        let _ = instance.main_thread().allocate_object(Ref::NULL, 8);
    }
}
