//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use vmgc::{Object, Ref, Representation, ThreadContext, Trace, Worklist};

/// Body of every test object.
#[derive(Debug, Default, Trace)]
#[repr(C)]
pub struct Node {
    pub next: Ref,
    pub other: Ref,
    pub id: u64,
}

/// Representation that records every trace and free.
#[derive(Debug, Default)]
pub struct Counting {
    pub traces: AtomicUsize,
    pub frees: AtomicUsize,
    /// `(node id, OS thread name)` per trace.
    pub tracers: Mutex<Vec<(u64, Option<String>)>>,
    pub freed_ids: Mutex<Vec<u64>>,
}

impl Counting {
    pub fn traces(&self) -> usize {
        self.traces.load(Ordering::SeqCst)
    }

    pub fn frees(&self) -> usize {
        self.frees.load(Ordering::SeqCst)
    }

    pub fn traced_by(&self, id: u64) -> Vec<Option<String>> {
        self.tracers
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| *n == id)
            .map(|(_, name)| name.clone())
            .collect()
    }
}

/// Forwards to an `Arc<Counting>` so the test keeps the counters after
/// the descriptor dies.
pub struct CountingRepr(pub Arc<Counting>);

// SAFETY: both slots of the body are traced.
unsafe impl Representation for CountingRepr {
    fn name(&self) -> &'static str {
        "Counting"
    }

    fn trace(&self, object: Ref, worklist: &mut Worklist) {
        let node = unsafe { node(object) };
        self.0.traces.fetch_add(1, Ordering::SeqCst);
        self.0.tracers.lock().unwrap().push((
            node.id,
            std::thread::current().name().map(str::to_owned),
        ));
        node.trace(worklist);
    }

    fn free(&self, object: Ref) {
        let id = unsafe { node(object) }.id;
        self.0.frees.fetch_add(1, Ordering::SeqCst);
        self.0.freed_ids.lock().unwrap().push(id);
    }
}

/// Borrows the body of a node.
///
/// # Safety
///
/// `r` must be a live node.
pub unsafe fn node<'a>(r: Ref) -> &'a mut Node {
    unsafe { &mut *Object::body(r).cast::<Node>() }
}

/// Allocates a counting descriptor on `tc`.
pub fn counting_type(tc: &ThreadContext) -> (Arc<Counting>, Ref) {
    let counting = Arc::new(Counting::default());
    let desc = tc.allocate_descriptor(Arc::new(CountingRepr(Arc::clone(&counting))), "Node");
    (counting, desc)
}

/// Allocates a node with id `id`.
pub fn new_node(tc: &ThreadContext, desc: Ref, id: u64) -> Ref {
    let r = tc.allocate_object(desc, std::mem::size_of::<Node>());
    unsafe { node(r) }.id = id;
    r
}

/// Makes `from.next` point at `to`.
pub fn link(tc: &ThreadContext, from: Ref, to: Ref) {
    unsafe { tc.assign_ref(from, &mut node(from).next, to) };
}
