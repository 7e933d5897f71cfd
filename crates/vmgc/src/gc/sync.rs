//! # Lock Ordering Discipline
//!
//! The collector coordinates runs through atomics; only a handful of
//! structures are touched outside the run protocol and therefore sit behind
//! a [`parking_lot::Mutex`]. They must be acquired in increasing level:
//!
//! | Level | Lock                  | Description                               |
//! |-------|-----------------------|-------------------------------------------|
//! | 1     | `Registry`            | Instance thread list and main thread      |
//! | 2     | `ThreadWork`          | Per-thread pending/stolen thread list     |
//! | 3     | `InstanceRoots`       | Compiler registry, symbols, weak handles  |
//! | 4     | `PermanentRoots`      | Process-lifetime root slots               |
//! | 5     | `DeferredDescriptors` | Type descriptors awaiting deletion        |
//! | 6     | `Metrics`             | Last-run metrics snapshot                 |
//!
//! Same-level acquisitions are allowed (two `ThreadWork` locks of different
//! threads), lower-level acquisitions are not.
//!
//! ## Validation
//!
//! Debug builds keep a thread-local stack of held levels and assert on
//! every acquisition through [`OrderedMutex::lock`].

use std::cell::{Cell, RefCell};
use std::ops::{Deref, DerefMut};

use parking_lot::{Mutex, MutexGuard};

const MAX_LOCK_DEPTH: usize = 8;

struct LockOrderState {
    stack: RefCell<Vec<u8>>,
    is_shutdown: Cell<bool>,
}

thread_local!(static LOCK_ORDER_STATE: LockOrderState = LockOrderState {
    stack: RefCell::new(Vec::with_capacity(MAX_LOCK_DEPTH)),
    is_shutdown: Cell::new(false),
});

/// Lock order tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LockOrder {
    /// Thread registry (level 1).
    Registry = 1,
    /// Per-thread work list (level 2).
    ThreadWork = 2,
    /// Instance-wide roots (level 3).
    InstanceRoots = 3,
    /// Permanent roots (level 4).
    PermanentRoots = 4,
    /// Deferred type descriptors (level 5).
    DeferredDescriptors = 5,
    /// Metrics snapshot (level 6).
    Metrics = 6,
}

impl LockOrder {
    /// Acquisition level.
    #[must_use]
    pub const fn level(self) -> u8 {
        self as u8
    }
}

/// RAII record of one held level.
#[must_use]
pub struct LockGuard {
    _tag: LockOrder,
}

impl LockGuard {
    /// Validates `tag` against the levels held by this thread and records it.
    pub fn new(tag: LockOrder) -> Self {
        #[cfg(debug_assertions)]
        {
            validate_lock_order(tag, highest_held_level());
            push_level(tag);
        }
        Self { _tag: tag }
    }
}

#[cfg(debug_assertions)]
impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = LOCK_ORDER_STATE.try_with(|state| {
            if !state.is_shutdown.get() {
                let mut stack = state.stack.borrow_mut();
                if let Some(pos) = stack.iter().rposition(|&l| l == self._tag.level()) {
                    stack.remove(pos);
                }
            }
        });
    }
}

/// Disables tracking for the current thread; called as a thread winds down.
#[inline]
pub fn enter_thread_shutdown() {
    #[cfg(debug_assertions)]
    {
        let _ = LOCK_ORDER_STATE.try_with(|state| state.is_shutdown.set(true));
    }
}

#[cfg(debug_assertions)]
fn validate_lock_order(tag: LockOrder, held: u8) {
    debug_assert!(
        tag.level() >= held,
        "Lock ordering violation: {tag:?} (level {}) acquired while holding level {held}",
        tag.level(),
    );
}

#[cfg(debug_assertions)]
fn push_level(tag: LockOrder) {
    let _ = LOCK_ORDER_STATE.try_with(|state| {
        if !state.is_shutdown.get() {
            state.stack.borrow_mut().push(tag.level());
        }
    });
}

/// Highest level held by this thread, or 0.
#[cfg(debug_assertions)]
#[must_use]
pub fn highest_held_level() -> u8 {
    LOCK_ORDER_STATE
        .try_with(|state| {
            if state.is_shutdown.get() {
                return 0;
            }
            state.stack.borrow().iter().copied().max().unwrap_or(0)
        })
        .unwrap_or(0)
}

/// A mutex tagged with its place in the lock order.
pub struct OrderedMutex<T> {
    order: LockOrder,
    inner: Mutex<T>,
}

impl<T> OrderedMutex<T> {
    /// Wraps `value`.
    pub const fn new(order: LockOrder, value: T) -> Self {
        Self {
            order,
            inner: Mutex::new(value),
        }
    }

    /// Acquires the lock after validating the order.
    pub fn lock(&self) -> OrderedGuard<'_, T> {
        let order = LockGuard::new(self.order);
        OrderedGuard {
            guard: self.inner.lock(),
            _order: order,
        }
    }

    /// Consumes the mutex.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for OrderedMutex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderedMutex")
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}

/// Guard returned by [`OrderedMutex::lock`].
pub struct OrderedGuard<'a, T> {
    // Field order matters: the mutex is released before the level is popped.
    guard: MutexGuard<'a, T>,
    _order: LockGuard,
}

impl<T> Deref for OrderedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for OrderedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
