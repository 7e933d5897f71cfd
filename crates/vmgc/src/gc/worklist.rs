//! Worklists of reference slots.
//!
//! A [`Worklist`] holds the *addresses* of slots whose referents still need
//! to be visited, plus call frames whose registers have not been scanned.
//! Draining is destructive: items are popped as they are processed, and
//! tracing a copied object pushes its own slots onto the same list, so
//! arbitrarily deep graphs never grow the call stack.

use std::ptr::NonNull;

use crate::frame::Frame;
use crate::header::Ref;

/// Slots and frames awaiting processing.
#[derive(Debug)]
pub struct Worklist {
    slots: Vec<*mut Ref>,
    frames: Vec<NonNull<Frame>>,
    include_gen2: bool,
}

impl Worklist {
    /// Creates an empty worklist.
    ///
    /// With `include_gen2` unset, slots whose referent already lives in the
    /// generation-2 store are dropped at insertion time.
    #[must_use]
    pub const fn new(include_gen2: bool) -> Self {
        Self {
            slots: Vec::new(),
            frames: Vec::new(),
            include_gen2,
        }
    }

    /// Enqueues a slot if it holds a reference worth visiting.
    #[inline]
    pub fn add(&mut self, slot: &mut Ref) {
        // SAFETY: a slot reachable through tracing holds either null or a
        // live allocation.
        unsafe { self.add_slot(slot) };
    }

    /// Enqueues a raw slot address.
    ///
    /// # Safety
    ///
    /// `slot` must be valid for reads and writes until the worklist is
    /// drained, and hold null or a live allocation.
    #[inline]
    pub unsafe fn add_slot(&mut self, slot: *mut Ref) {
        // SAFETY: caller guarantees the slot is readable.
        let referent = unsafe { *slot };
        if referent.is_null() {
            return;
        }
        // SAFETY: non-null referents are live.
        if !self.include_gen2 && unsafe { referent.flags() }.contains(crate::Flags::SECOND_GEN) {
            return;
        }
        self.slots.push(slot);
    }

    /// Enqueues a frame whose roots have not been scanned this run.
    pub fn add_frame(&mut self, frame: NonNull<Frame>) {
        self.frames.push(frame);
    }

    /// Whether gen2 referents are kept.
    #[must_use]
    pub const fn include_gen2(&self) -> bool {
        self.include_gen2
    }

    /// Number of queued slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether neither slots nor frames are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty() && self.frames.is_empty()
    }

    pub(crate) fn pop(&mut self) -> Option<*mut Ref> {
        self.slots.pop()
    }

    pub(crate) fn pop_frame(&mut self) -> Option<NonNull<Frame>> {
        self.frames.pop()
    }

    /// Slots pushed after position `start`.
    pub(crate) fn slots_since(&self, start: usize) -> &[*mut Ref] {
        &self.slots[start..]
    }

    /// Pushes a slot without filtering; used when the slot was already
    /// filtered by the sender.
    pub(crate) fn push_unchecked(&mut self, slot: *mut Ref) {
        self.slots.push(slot);
    }

    pub(crate) fn take_frames(&mut self) -> Vec<NonNull<Frame>> {
        std::mem::take(&mut self.frames)
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
        self.frames.clear();
    }
}
