//! The `Trace` trait for representation bodies.
//!
//! A body type implements `Trace` by handing each of its reference slots to
//! the [`Worklist`]. The collector later rewrites those slots in place, so
//! tracing takes `&mut self`: what is enqueued is the slot's address.

use crate::gc::worklist::Worklist;
use crate::header::Ref;

/// Enqueues the reference slots of a value.
///
/// # Safety
///
/// Implementations must enqueue every [`Ref`] slot the value owns. A missed
/// slot keeps a stale address after its referent moves.
pub unsafe trait Trace {
    /// Adds this value's reference slots to `worklist`.
    fn trace(&mut self, worklist: &mut Worklist);
}

// ============================================================================
// Trace implementation for Ref
// ============================================================================

// SAFETY: a Ref is itself a slot.
unsafe impl Trace for Ref {
    #[inline]
    fn trace(&mut self, worklist: &mut Worklist) {
        worklist.add(self);
    }
}

// ============================================================================
// Trace implementations for primitive types
// ============================================================================

macro_rules! impl_trace_for_primitives {
    ($($t:ty),* $(,)?) => {
        $(
            // SAFETY: Primitive types contain no slots
            unsafe impl Trace for $t {
                #[inline]
                fn trace(&mut self, _worklist: &mut Worklist) {}
            }
        )*
    };
}

impl_trace_for_primitives! {
    i8, i16, i32, i64, i128, isize,
    u8, u16, u32, u64, u128, usize,
    f32, f64,
    bool, char, (),
    String,
    std::time::Duration,
}

// ============================================================================
// Trace implementations for containers
// ============================================================================

// SAFETY: traces the contained value when present
unsafe impl<T: Trace> Trace for Option<T> {
    #[inline]
    fn trace(&mut self, worklist: &mut Worklist) {
        if let Some(value) = self {
            value.trace(worklist);
        }
    }
}

// SAFETY: traces every element
unsafe impl<T: Trace, const N: usize> Trace for [T; N] {
    #[inline]
    fn trace(&mut self, worklist: &mut Worklist) {
        for item in self {
            item.trace(worklist);
        }
    }
}

// SAFETY: traces every element; the buffer is off-heap but its slots are
// stable for the duration of a run since mutators are stopped
unsafe impl<T: Trace> Trace for Vec<T> {
    #[inline]
    fn trace(&mut self, worklist: &mut Worklist) {
        for item in self {
            item.trace(worklist);
        }
    }
}

// SAFETY: traces the boxed value
unsafe impl<T: Trace + ?Sized> Trace for Box<T> {
    #[inline]
    fn trace(&mut self, worklist: &mut Worklist) {
        T::trace(self.as_mut(), worklist);
    }
}
