//! Run orchestration.
//!
//! A run is driven by four instance-wide counters:
//!
//! - `start`: participants that have not yet reached the start barrier.
//!   The first thread to raise it from zero is elected coordinator.
//! - `finish`: outstanding finish votes. A participant holds a vote while
//!   it has unprocessed or unacknowledged passed work.
//! - `ack`: participants that have not acknowledged the end of the run,
//!   plus one token held by the coordinator. The thread that brings it
//!   down to the token releases deferred descriptors and the token.
//! - `seq`: run sequence number; every `gen2_ratio`-th run is full.
//!
//! Threads move between [`GcStatus`] values only by compare-and-swap:
//! `None -> Interrupt` when signalled, `Unable -> Stolen` when another
//! thread takes over their collection, and back at cleanup.

use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::utils::Backoff;

use crate::fatal::{fatal_with, GcFatal};
use crate::gc::collect::{free_nursery_uncopied, process_worklist, Collector};
use crate::gc::passing::{owner_runs, sort_by_owner};
use crate::gc::{Generation, WhatToDo};
use crate::gen2::{Gen2Store, SweepMode};
use crate::header::Ref;
use crate::instance::Instance;
use crate::metrics::{RunStats, RunTotals};
use crate::thread::{GcStatus, ThreadContext, ThreadStage};
use crate::tracing::internal as trace_log;
use crate::tracing::GcPhase;

/// Instance-wide run counters.
#[derive(Debug, Default)]
pub(crate) struct RunCoordinator {
    start: AtomicUsize,
    finish: AtomicUsize,
    ack: AtomicUsize,
    seq: AtomicU32,
    next_worker_id: AtomicU32,
    pub(crate) totals: RunTotals,
}

impl RunCoordinator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Sequence number of the latest run.
    pub(crate) fn seq(&self) -> u32 {
        self.seq.load(Ordering::Acquire)
    }

    /// Makes the next run a full one. Never moves the sequence backwards.
    pub(crate) fn force_full(&self, ratio: u32) {
        let ratio = u64::from(ratio.max(1));
        let _ = self
            .seq
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |seq| {
                let next = u64::from(seq) + 1;
                let target = next.div_ceil(ratio) * ratio - 1;
                Some(u32::try_from(target).unwrap_or(u32::MAX))
            });
    }

    /// Whether no run is in progress.
    pub(crate) fn is_idle(&self) -> bool {
        self.start.load(Ordering::Acquire) == 0
            && self.finish.load(Ordering::Acquire) == 0
            && self.ack.load(Ordering::Acquire) == 0
    }

    /// Waits until every participant of the previous run has acknowledged
    /// it, unless a new run is already gathering.
    fn wait_for_previous_run(&self) {
        let backoff = Backoff::new();
        while self.ack.load(Ordering::Acquire) != 0 && self.start.load(Ordering::Acquire) == 0 {
            backoff.snooze();
        }
    }
}

/// Entry point when `tc` wants a run, usually because its nursery is full.
pub(crate) fn trigger_from_allocator(tc: &ThreadContext) {
    let instance = tc.instance();
    let coord = &instance.coordinator;
    coord.wait_for_previous_run();

    match tc.cas_status(GcStatus::None, GcStatus::Interrupt) {
        Ok(()) => {
            if coord.start.fetch_add(1, Ordering::AcqRel) == 0 {
                coordinate(tc, &instance);
            } else {
                register_for_gc_run(tc, &instance);
                run_gc(tc, &instance, WhatToDo::NoInstance);
            }
        }
        // Someone signalled us first and counted us in `start`.
        Err(GcStatus::Interrupt) => enter_run(tc, &instance),
        Err(status) => fatal_with(
            GcFatal::InvalidTransition,
            format_args!("thread {} triggering a run from {status:?}", tc.thread_id()),
        ),
    }
}

/// Entry point for a thread that found itself interrupted.
pub(crate) fn trigger_from_interrupt(tc: &ThreadContext) {
    let instance = tc.instance();
    instance.coordinator.wait_for_previous_run();
    enter_run(tc, &instance);
}

fn enter_run(tc: &ThreadContext, instance: &Instance) {
    register_for_gc_run(tc, instance);
    run_gc(tc, instance, WhatToDo::NoInstance);
}

fn coordinate(tc: &ThreadContext, instance: &Instance) {
    let coord = &instance.coordinator;
    coord.ack.fetch_add(1, Ordering::AcqRel);
    let seq = coord.seq.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
    trace_log::log_elected(seq, tc.thread_id());

    let freed = instance.free_deferred_descriptors();
    coord.totals.add_descriptors_freed(freed);

    register_for_gc_run(tc, instance);

    // Spawning threads take the registry lock too, so the snapshot cannot
    // miss a child its parent has not already queued for stealing.
    let registry = instance.registry.lock();
    for other in &registry.threads {
        if ptr::eq(other.as_ref(), tc) || other.stage() == ThreadStage::Destroyed {
            continue;
        }
        if matches!(other.status(), GcStatus::Stolen | GcStatus::Interrupt) {
            continue;
        }
        // Counted before signalling: the target may join before we return.
        coord.start.fetch_add(1, Ordering::AcqRel);
        if !signal_one_thread(tc, other) {
            coord.start.fetch_sub(1, Ordering::AcqRel);
        }
    }
    drop(registry);

    run_gc(tc, instance, WhatToDo::All);
}

/// Interrupts `other`, or steals it if it is blocked. Returns whether it
/// was interrupted and will join the run itself.
fn signal_one_thread(tc: &ThreadContext, other: &Arc<ThreadContext>) -> bool {
    loop {
        if other.cas_status(GcStatus::None, GcStatus::Interrupt).is_ok() {
            trace_log::log_signal(other.thread_id(), false);
            return true;
        }
        match other.cas_status(GcStatus::Unable, GcStatus::Stolen) {
            Ok(()) => {
                add_work(tc, Arc::clone(other));
                return false;
            }
            Err(GcStatus::Stolen | GcStatus::Interrupt) => return false,
            // Changed between the two attempts.
            Err(_) => {}
        }
    }
}

/// Records `victim` (already `Stolen`) as collected by `stealer`, and
/// steals whichever of its pending children are still blocked.
fn add_work(stealer: &ThreadContext, victim: Arc<ThreadContext>) {
    let mut pending = vec![victim];
    while let Some(thread) = pending.pop() {
        thread.set_gc_owner(stealer);
        trace_log::log_signal(thread.thread_id(), true);
        let children = mem::take(&mut *thread.gc_work.lock());
        for child in children {
            if child.cas_status(GcStatus::Unable, GcStatus::Stolen).is_ok() {
                pending.push(child);
            }
        }
        stealer.gc_work.lock().push(thread);
    }
}

fn register_for_gc_run(tc: &ThreadContext, instance: &Instance) {
    let coord = &instance.coordinator;
    tc.set_gc_thread_id(coord.next_worker_id.fetch_add(1, Ordering::AcqRel) + 1);
    tc.set_gc_owner(tc);

    let children = mem::take(&mut *tc.gc_work.lock());
    for child in children {
        if child.cas_status(GcStatus::Unable, GcStatus::Stolen).is_ok() {
            add_work(tc, child);
        }
    }

    coord.finish.fetch_add(1, Ordering::AcqRel);
}

/// Collects `tc` and every thread it stole, then waits for the run to end.
fn run_gc(tc: &ThreadContext, instance: &Instance, what: WhatToDo) {
    let coord = &instance.coordinator;
    let config = tc.config();

    coord.start.fetch_sub(1, Ordering::AcqRel);
    let backoff = Backoff::new();
    while coord.start.load(Ordering::Acquire) != 0 {
        backoff.snooze();
    }
    coord.ack.fetch_add(1, Ordering::AcqRel);

    let started = Instant::now();
    let seq = coord.seq();
    let generation = if seq % config.gen2_ratio.max(1) == 0 {
        Generation::Full
    } else {
        Generation::Nursery
    };
    let _span = trace_log::gc_run(seq, generation.name(), tc.gc_thread_id());

    let stolen: Vec<Arc<ThreadContext>> = tc.gc_work.lock().clone();
    let mut c = Collector::new(tc, seq, generation, config.pass_work_size);
    c.stats.threads_stolen = stolen.len();

    trace_log::log_phase(GcPhase::Roots, tc.thread_id());
    let mut limits = Vec::with_capacity(stolen.len() + 1);
    // SAFETY: we own tc and every stolen thread for this run.
    unsafe {
        limits.push(do_collection(&mut c, tc, instance, what));
        for target in &stolen {
            limits.push(do_collection(&mut c, target, instance, WhatToDo::NoInstance));
        }
    }

    trace_log::log_phase(GcPhase::Trace, tc.thread_id());
    collect_intrays(&mut c, instance);

    trace_log::log_phase(GcPhase::Sweep, tc.thread_id());
    let mut deferred = Vec::new();
    let targets = std::iter::once(tc).chain(stolen.iter().map(|t| &**t));
    for (target, limit) in targets.zip(limits) {
        // SAFETY: the finish barrier has passed and we own target.
        unsafe { finalize(&mut c, target, limit, &mut deferred) };
    }
    if !deferred.is_empty() {
        instance.deferred.lock().append(&mut deferred);
    }

    trace_log::log_phase(GcPhase::Finish, tc.thread_id());
    cleanup(tc, &stolen, instance);

    c.stats.batches_passed = c.router.batches_passed();
    acknowledge_finish(instance, &c.stats, started.elapsed(), generation, seq);
}

/// Swaps `target`'s semispaces and processes all of its roots. Returns the
/// fromspace sweep limit.
///
/// # Safety
///
/// The caller must own `target` for the current run.
unsafe fn do_collection(
    c: &mut Collector<'_>,
    target: &ThreadContext,
    instance: &Instance,
    what: WhatToDo,
) -> *mut u8 {
    // SAFETY: caller owns target.
    let limit = unsafe {
        let heap = target.heap();
        target.drain_remote_roots_into(&mut heap.gen2roots);
        heap.nursery.swap()
    };
    let mut wl = c.worklist();

    // SAFETY: as above, for every step below.
    unsafe {
        target.heap().thread_roots.add_to(&mut wl);
        process_worklist(c, target, &mut wl);

        if ptr::eq(target, c.tc) && what == WhatToDo::All {
            {
                let mut roots = instance.roots.lock();
                roots.add_to(&mut wl);
                process_worklist(c, target, &mut wl);
            }
            instance.permanent_roots.lock().add_to(&mut wl);
            process_worklist(c, target, &mut wl);
        }

        target.heap().temp.add_to(&mut wl);
        process_worklist(c, target, &mut wl);

        if c.generation == Generation::Nursery {
            target.heap().gen2roots.add_nursery_referents(&mut wl);
            process_worklist(c, target, &mut wl);
        }

        if let Some(frame) = target.heap().cur_frame {
            wl.add_frame(frame);
            process_worklist(c, target, &mut wl);
        }
    }

    c.router.flush();
    limit
}

/// Processes passed work until every participant has given up its vote.
fn collect_intrays(c: &mut Collector<'_>, instance: &Instance) {
    let coord = &instance.coordinator;
    let mut holding_vote = true;
    let backoff = Backoff::new();
    loop {
        loop {
            process_in_tray(c, instance, &mut holding_vote);
            c.router.verify();
            if c.router.all_consumed() {
                break;
            }
            if !holding_vote {
                coord.finish.fetch_add(1, Ordering::AcqRel);
                holding_vote = true;
            }
            backoff.snooze();
        }
        if holding_vote {
            coord.finish.fetch_sub(1, Ordering::AcqRel);
            holding_vote = false;
        }
        if coord.finish.load(Ordering::Acquire) == 0 {
            break;
        }
        backoff.snooze();
    }
}

/// Drains the in-tray of `c`'s thread, claiming a finish vote first.
fn process_in_tray(c: &mut Collector<'_>, instance: &Instance, holding_vote: &mut bool) {
    loop {
        let batches = c.tc.in_tray.take_all();
        if batches.is_empty() {
            return;
        }
        if !*holding_vote {
            instance.coordinator.finish.fetch_add(1, Ordering::AcqRel);
            *holding_vote = true;
        }
        trace_log::log_received(c.tc.thread_id(), batches.len());

        let mut items: Vec<*mut Ref> = batches
            .iter()
            .flat_map(|batch| batch.items().iter().copied())
            .collect();
        sort_by_owner(&mut items);
        for (owner, run) in owner_runs(&items) {
            let mut wl = c.worklist();
            for &slot in run {
                wl.push_unchecked(slot);
            }
            // SAFETY: routed slots target threads we collect in this run.
            unsafe { process_worklist(c, &*owner, &mut wl) };
        }

        // Work produced here must be out before the senders may drop
        // their votes.
        c.router.flush();
        for batch in &batches {
            batch.mark_consumed();
        }
    }
}

/// Frees what the run left behind in `target`'s heap.
///
/// # Safety
///
/// The finish barrier must have passed and the caller must own `target`.
unsafe fn finalize(c: &mut Collector<'_>, target: &ThreadContext, limit: *mut u8, deferred: &mut Vec<Ref>) {
    // SAFETY: caller upholds the preconditions.
    let nursery_freed = unsafe { free_nursery_uncopied(target, limit, deferred) };
    // SAFETY: as above.
    let heap = unsafe { target.heap() };
    heap.nursery.zero_free_space();

    let mut gen2_freed = 0;
    if c.generation == Generation::Full {
        heap.gen2roots.remove_dead();
        let swept = heap.gen2.sweep(SweepMode::Run, deferred);
        gen2_freed = swept.freed;
        c.stats.descriptors_freed += swept.descriptors_freed;
    }
    c.stats.freed += nursery_freed + gen2_freed;
    trace_log::log_sweep(target.thread_id(), nursery_freed, gen2_freed);
}

/// Releases stolen threads, destroys exited ones, and resets our status.
fn cleanup(tc: &ThreadContext, stolen: &[Arc<ThreadContext>], instance: &Instance) {
    for target in stolen {
        match target.stage() {
            ThreadStage::ClearingNursery => destroy_thread(tc, target, instance),
            stage => {
                if stage == ThreadStage::Exited {
                    target.set_stage(ThreadStage::ClearingNursery);
                }
                target.set_gc_owner(ptr::null());
                target.set_gc_thread_id(0);
                if let Err(status) = target.cas_status(GcStatus::Stolen, GcStatus::Unable) {
                    fatal_with(
                        GcFatal::InvalidTransition,
                        format_args!("stolen thread {} found {status:?} at cleanup", target.thread_id()),
                    );
                }
            }
        }
    }

    if tc.stage() == ThreadStage::Exited {
        tc.set_stage(ThreadStage::ClearingNursery);
    }
    tc.set_gc_owner(ptr::null());
    tc.set_gc_thread_id(0);
    tc.gc_work.lock().clear();
    if let Err(status) = tc.cas_status(GcStatus::Interrupt, GcStatus::None) {
        fatal_with(
            GcFatal::InvalidTransition,
            format_args!("participant {} found {status:?} at cleanup", tc.thread_id()),
        );
    }
}

/// Moves an exited thread's gen2 heap and roots into `collector` and
/// unregisters it. Its nursery holds nothing live: exited threads are
/// collected with every survivor promoted.
fn destroy_thread(collector: &ThreadContext, target: &ThreadContext, instance: &Instance) {
    // SAFETY: we own both threads until acknowledgement.
    unsafe {
        let from = target.heap();
        let into = collector.heap();
        let gen2 = mem::replace(&mut from.gen2, Gen2Store::new(collector.config().gen2_page_items));
        into.gen2.absorb(gen2, collector);
        into.gen2roots.absorb(&mut from.gen2roots);
        target.drain_remote_roots_into(&mut into.gen2roots);
    }
    target.set_gc_owner(ptr::null());
    target.set_gc_thread_id(0);
    target.set_stage(ThreadStage::Destroyed);
    instance.unregister(target);
    trace_log::log_thread_destroyed(target.thread_id(), collector.thread_id());
}

fn acknowledge_finish(
    instance: &Instance,
    stats: &RunStats,
    elapsed: Duration,
    generation: Generation,
    seq: u32,
) {
    let coord = &instance.coordinator;
    coord.totals.add(stats, elapsed);
    if coord.ack.fetch_sub(1, Ordering::AcqRel) == 2 {
        // Every other participant has acknowledged; only the token is left.
        let freed = instance.free_deferred_descriptors();
        coord.totals.add_descriptors_freed(freed);
        instance.record_run(coord.totals.take(generation.into(), seq));
        coord.next_worker_id.store(0, Ordering::Release);
        coord.ack.fetch_sub(1, Ordering::AcqRel);
    }
}
