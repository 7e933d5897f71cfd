//! The collector instance: thread registry, instance-wide roots and run
//! counters shared by every [`ThreadContext`].

use std::io;
use std::mem;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::utils::Backoff;

use crate::config::{ConfigError, GcConfig};
use crate::descriptor::TypeDescriptor;
use crate::fatal::{fatal_with, GcFatal};
use crate::gc::collect::free_nursery_uncopied;
use crate::gc::orchestrate::RunCoordinator;
use crate::gc::sync::{enter_thread_shutdown, LockOrder, OrderedMutex};
use crate::gen2::SweepMode;
use crate::header::Ref;
use crate::metrics::{GcMetrics, GlobalMetrics};
use crate::roots::{InstanceRoots, PermanentRoots};
use crate::thread::{GcStatus, ThreadContext, ThreadStage};

/// Every thread context the instance knows about.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    pub(crate) threads: Vec<Arc<ThreadContext>>,
    pub(crate) main: Option<Arc<ThreadContext>>,
}

/// A collector instance.
///
/// # Example
///
/// ```
/// use vmgc::{GcConfig, Instance};
///
/// let instance = Instance::new(GcConfig::default()).unwrap();
/// let main = instance.main_thread();
/// let handle = instance
///     .spawn(&main, |tc| {
///         tc.collect();
///     })
///     .unwrap();
/// main.join(handle).unwrap();
/// ```
pub struct Instance {
    config: GcConfig,
    pub(crate) coordinator: RunCoordinator,
    pub(crate) registry: OrderedMutex<Registry>,
    num_user_threads: AtomicUsize,
    morgue_thread_count: AtomicUsize,
    next_thread_id: AtomicU32,
    pub(crate) roots: OrderedMutex<InstanceRoots>,
    pub(crate) permanent_roots: OrderedMutex<PermanentRoots>,
    /// Dead type descriptors awaiting destruction.
    pub(crate) deferred: OrderedMutex<Vec<Ref>>,
    last_metrics: OrderedMutex<GcMetrics>,
    metrics: GlobalMetrics,
}

// SAFETY: the deferred list holds addresses of dead descriptors that only
// the thread draining it touches.
unsafe impl Send for Instance {}
// SAFETY: see above; all other state is atomic or locked.
unsafe impl Sync for Instance {}

impl Instance {
    /// Creates an instance with a registered main thread.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` is rejected by
    /// [`GcConfig::validate`].
    pub fn new(config: GcConfig) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        Ok(Arc::new_cyclic(|weak| {
            let main = Arc::new(ThreadContext::new(
                weak.clone(),
                config,
                1,
                GcStatus::None,
                ThreadStage::Started,
            ));
            Self {
                config,
                coordinator: RunCoordinator::new(),
                registry: OrderedMutex::new(
                    LockOrder::Registry,
                    Registry {
                        threads: vec![Arc::clone(&main)],
                        main: Some(main),
                    },
                ),
                num_user_threads: AtomicUsize::new(0),
                morgue_thread_count: AtomicUsize::new(0),
                next_thread_id: AtomicU32::new(2),
                roots: OrderedMutex::new(LockOrder::InstanceRoots, InstanceRoots::default()),
                permanent_roots: OrderedMutex::new(LockOrder::PermanentRoots, PermanentRoots::default()),
                deferred: OrderedMutex::new(LockOrder::DeferredDescriptors, Vec::new()),
                last_metrics: OrderedMutex::new(LockOrder::Metrics, GcMetrics::new()),
                metrics: GlobalMetrics::new(),
            }
        }))
    }

    /// Collector configuration.
    #[must_use]
    pub const fn config(&self) -> &GcConfig {
        &self.config
    }

    /// The context of the thread that created the instance.
    #[must_use]
    pub fn main_thread(&self) -> Arc<ThreadContext> {
        self.registry
            .lock()
            .main
            .clone()
            .unwrap_or_else(|| fatal_with(GcFatal::InstanceGone, format_args!("main thread released")))
    }

    /// Starts `f` on a new OS thread with its own context.
    ///
    /// Until the new thread starts running, `parent` collects it in any run
    /// it takes part in.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the thread cannot be created.
    pub fn spawn<F, R>(self: &Arc<Self>, parent: &ThreadContext, f: F) -> io::Result<JoinHandle<R>>
    where
        F: FnOnce(&Arc<ThreadContext>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let id = self.next_thread_id.fetch_add(1, Ordering::AcqRel);
        let child = Arc::new(ThreadContext::new(
            Arc::downgrade(self),
            self.config,
            id,
            GcStatus::Unable,
            ThreadStage::Starting,
        ));
        self.num_user_threads.fetch_add(1, Ordering::AcqRel);
        {
            let mut registry = self.registry.lock();
            registry.threads.push(Arc::clone(&child));
            parent.gc_work.lock().push(Arc::clone(&child));
        }
        // Any run that began before the child was visible must finish
        // before the child may start.
        parent.safepoint();

        let instance = Arc::clone(self);
        let tc = Arc::clone(&child);
        let spawned = thread::Builder::new()
            .name(format!("vmgc-{id}"))
            .spawn(move || {
                let _instance = instance;
                tc.mark_unblocked();
                tc.set_stage(ThreadStage::Started);
                let _exit = ExitGuard(&tc);
                f(&tc)
            });

        spawned.inspect_err(|_| {
            parent.gc_work.lock().retain(|t| !Arc::ptr_eq(t, &child));
            child.set_stage(ThreadStage::Destroyed);
            self.registry
                .lock()
                .threads
                .retain(|t| !Arc::ptr_eq(t, &child));
            self.num_user_threads.fetch_sub(1, Ordering::AcqRel);
        })
    }

    /// Registers `slot` as a root for the lifetime of the instance.
    ///
    /// # Safety
    ///
    /// `slot` must stay valid and only be written by its owner thread
    /// outside runs for as long as the instance lives.
    pub unsafe fn add_permanent_root(&self, slot: *mut Ref) {
        self.permanent_roots.lock().add(slot);
    }

    /// Number of permanent roots.
    #[must_use]
    pub fn permanent_root_count(&self) -> usize {
        self.permanent_roots.lock().len()
    }

    /// Runs `f` on the instance-wide roots.
    pub fn with_roots<R>(&self, f: impl FnOnce(&mut InstanceRoots) -> R) -> R {
        f(&mut self.roots.lock())
    }

    /// Metrics of the most recent run.
    #[must_use]
    pub fn last_gc_metrics(&self) -> GcMetrics {
        *self.last_metrics.lock()
    }

    /// Cumulative metrics.
    #[must_use]
    pub const fn global_metrics(&self) -> &GlobalMetrics {
        &self.metrics
    }

    /// Spawned threads not yet destroyed.
    #[must_use]
    pub fn num_user_threads(&self) -> usize {
        self.num_user_threads.load(Ordering::Acquire)
    }

    /// Exited threads awaiting destruction.
    #[must_use]
    pub fn morgue_thread_count(&self) -> usize {
        self.morgue_thread_count.load(Ordering::Acquire)
    }

    /// Registered contexts, including exited ones.
    #[must_use]
    pub fn registered_threads(&self) -> usize {
        self.registry.lock().threads.len()
    }

    /// The registered context with id `thread_id`.
    #[must_use]
    pub fn thread(&self, thread_id: u32) -> Option<Arc<ThreadContext>> {
        self.registry
            .lock()
            .threads
            .iter()
            .find(|t| t.thread_id() == thread_id)
            .cloned()
    }

    /// Destroys every deferred type descriptor. Returns how many.
    pub(crate) fn free_deferred_descriptors(&self) -> usize {
        let dead = mem::take(&mut *self.deferred.lock());
        for &desc in &dead {
            // SAFETY: descriptors reach this list once, after a sweep has
            // found them dead, and no run reaches them afterwards.
            unsafe { TypeDescriptor::destroy(desc) };
        }
        dead.len()
    }

    pub(crate) fn record_run(&self, mut run: GcMetrics) {
        run.total_collections = self.metrics.record(&run);
        *self.last_metrics.lock() = run;
    }

    pub(crate) fn note_exited(&self) {
        self.morgue_thread_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Forgets a destroyed thread.
    pub(crate) fn unregister(&self, tc: &ThreadContext) {
        let mut registry = self.registry.lock();
        let before = registry.threads.len();
        registry.threads.retain(|t| !std::ptr::eq(t.as_ref(), tc));
        if registry.threads.len() != before {
            self.morgue_thread_count.fetch_sub(1, Ordering::AcqRel);
            self.num_user_threads.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Collects until every spawned thread has exited and been destroyed,
    /// then frees everything left in `tc`'s heap.
    ///
    /// `tc` must be the only thread still running. The instance must not
    /// allocate afterwards.
    pub fn global_destruction(&self, tc: &ThreadContext) {
        let backoff = Backoff::new();
        while self.num_user_threads() > 0 {
            if self.morgue_thread_count() > 0 {
                tc.collect_full();
                backoff.reset();
            } else {
                tc.safepoint();
                backoff.snooze();
            }
        }
        tc.collect_full();

        let mut deferred = Vec::new();
        // SAFETY: no other thread is left to run a collection.
        unsafe {
            let limit = tc.heap().nursery.swap();
            free_nursery_uncopied(tc, limit, &mut deferred);
            let heap = tc.heap();
            heap.nursery.zero_free_space();
            heap.gen2roots.clear();
            heap.gen2.sweep(SweepMode::GlobalDestruction, &mut deferred);
        }
        self.deferred.lock().append(&mut deferred);
        self.free_deferred_descriptors();

        let mut registry = self.registry.lock();
        registry.threads.retain(|t| std::ptr::eq(t.as_ref(), tc));
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("config", &self.config)
            .field("num_user_threads", &self.num_user_threads())
            .field("morgue_thread_count", &self.morgue_thread_count())
            .finish_non_exhaustive()
    }
}

/// Hands the thread over to the collector when its closure returns or
/// unwinds.
struct ExitGuard<'a>(&'a ThreadContext);

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        self.0.exit();
        enter_thread_shutdown();
    }
}
