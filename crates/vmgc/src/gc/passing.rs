//! Cross-thread work passing.
//!
//! Only the thread collecting an object's owner may copy, promote or mark
//! it. A collector that finds a slot whose referent belongs to another
//! thread adds the slot to a per-target batch; full batches are pushed onto
//! the target collector's in-tray. The sender keeps every dispatched batch
//! until the receiver flags it consumed, and does not give up its finish
//! vote before that.

use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;

use crate::fatal::{fatal_with, GcFatal};
use crate::header::Ref;
use crate::thread::ThreadContext;
use crate::tracing::internal as trace_log;

/// A batch of routed slots.
#[derive(Debug)]
pub(crate) struct PassedWork {
    items: Vec<*mut Ref>,
    consumed: AtomicBool,
}

// SAFETY: the slots are only dereferenced by the receiving collector, which
// is the only thread allowed to process their referents.
unsafe impl Send for PassedWork {}
// SAFETY: see above; `consumed` is the only shared mutable state.
unsafe impl Sync for PassedWork {}

impl PassedWork {
    pub(crate) fn new(items: Vec<*mut Ref>) -> Self {
        Self {
            items,
            consumed: AtomicBool::new(false),
        }
    }

    pub(crate) fn items(&self) -> &[*mut Ref] {
        &self.items
    }

    pub(crate) fn mark_consumed(&self) {
        self.consumed.store(true, Ordering::Release);
    }

    pub(crate) fn is_consumed(&self) -> bool {
        self.consumed.load(Ordering::Acquire)
    }
}

/// Inbound batches of one collector. Many producers, one consumer.
#[derive(Debug, Default)]
pub(crate) struct InTray {
    queue: SegQueue<Arc<PassedWork>>,
}

impl InTray {
    pub(crate) fn new() -> Self {
        Self {
            queue: SegQueue::new(),
        }
    }

    pub(crate) fn push(&self, work: Arc<PassedWork>) {
        self.queue.push(work);
    }

    /// Takes every batch currently queued.
    pub(crate) fn take_all(&self) -> Vec<Arc<PassedWork>> {
        let mut out = Vec::new();
        while let Some(work) = self.queue.pop() {
            out.push(work);
        }
        out
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

struct Outbox {
    collector: *const ThreadContext,
    items: Vec<*mut Ref>,
}

/// Per-participant routing state.
pub(crate) struct WorkRouter {
    outbox: Vec<Option<Outbox>>,
    awaiting: Vec<Arc<PassedWork>>,
    pass_work_size: usize,
    batches_passed: usize,
}

impl WorkRouter {
    pub(crate) fn new(pass_work_size: usize) -> Self {
        Self {
            outbox: Vec::new(),
            awaiting: Vec::new(),
            pass_work_size,
            batches_passed: 0,
        }
    }

    /// Routes `slot` to whichever thread is collecting `owner` in this run.
    ///
    /// # Safety
    ///
    /// `owner` must be a registered thread context.
    pub(crate) unsafe fn route(&mut self, slot: *mut Ref, owner: *const ThreadContext) {
        // SAFETY: caller guarantees owner is live.
        let owner = unsafe { &*owner };
        let collector = owner.gc_owner();
        if collector.is_null() {
            fatal_with(
                GcFatal::MissingGcOwner,
                format_args!("thread {}", owner.thread_id()),
            );
        }
        // SAFETY: gc_owner points at a participant of the current run.
        let index = unsafe { (*collector).gc_thread_id() } as usize;
        if self.outbox.len() <= index {
            self.outbox.resize_with(index + 1, || None);
        }
        let entry = self.outbox[index].get_or_insert_with(|| Outbox {
            collector,
            items: Vec::new(),
        });
        entry.items.push(slot);
        if entry.items.len() >= self.pass_work_size {
            self.dispatch(index);
        }
    }

    fn dispatch(&mut self, index: usize) {
        let Some(entry) = self.outbox.get_mut(index).and_then(Option::as_mut) else {
            return;
        };
        if entry.items.is_empty() {
            return;
        }
        let items = std::mem::take(&mut entry.items);
        // SAFETY: the collector is a participant and outlives the run.
        let collector = unsafe { &*entry.collector };
        trace_log::log_passed(collector.gc_thread_id(), items.len());
        let work = Arc::new(PassedWork::new(items));
        collector.in_tray.push(Arc::clone(&work));
        self.awaiting.push(work);
        self.batches_passed += 1;
    }

    /// Sends every partial batch.
    pub(crate) fn flush(&mut self) {
        for index in 0..self.outbox.len() {
            self.dispatch(index);
        }
    }

    /// Forgets batches the receivers have consumed.
    pub(crate) fn verify(&mut self) {
        self.awaiting.retain(|work| !work.is_consumed());
    }

    /// Whether every dispatched batch has been consumed.
    pub(crate) fn all_consumed(&self) -> bool {
        self.awaiting.is_empty()
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.outbox
            .iter()
            .flatten()
            .any(|entry| !entry.items.is_empty())
    }

    pub(crate) const fn batches_passed(&self) -> usize {
        self.batches_passed
    }
}

/// Orders routed slots by the owner of their current referent.
pub(crate) fn sort_by_owner(items: &mut [*mut Ref]) {
    // SAFETY: routed slots hold live referents until processed.
    items.sort_by_key(|&slot| unsafe { (*slot).owner() } as usize);
}

/// Splits owner-sorted slots into runs sharing one owner.
pub(crate) fn owner_runs(items: &[*mut Ref]) -> impl Iterator<Item = (*const ThreadContext, &[*mut Ref])> {
    // SAFETY: as in `sort_by_owner`.
    let owner_of = |slot: *mut Ref| unsafe { (*slot).owner() };
    items
        .chunk_by(move |&a, &b| ptr::eq(owner_of(a), owner_of(b)))
        .map(move |run| (owner_of(run[0]), run))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_tray_drains_everything() {
        let tray = InTray::new();
        tray.push(Arc::new(PassedWork::new(Vec::new())));
        tray.push(Arc::new(PassedWork::new(Vec::new())));
        assert_eq!(tray.take_all().len(), 2);
        assert!(tray.is_empty());
    }

    #[test]
    fn test_verify_keeps_unconsumed() {
        let mut router = WorkRouter::new(4);
        let a = Arc::new(PassedWork::new(Vec::new()));
        let b = Arc::new(PassedWork::new(Vec::new()));
        router.awaiting.push(a.clone());
        router.awaiting.push(b.clone());
        a.mark_consumed();
        router.verify();
        assert!(!router.all_consumed());
        b.mark_consumed();
        router.verify();
        assert!(router.all_consumed());
    }
}
