//! Call frames as seen by the collector.
//!
//! The interpreter owns frames; the collector only needs to find the
//! reference-carrying registers inside them. Each frame carries a run stamp
//! so a frame reachable along several paths (caller chains, closures,
//! continuations) is scanned once per run.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::gc::worklist::Worklist;
use crate::header::Ref;

/// One interpreter register.
#[derive(Clone, Copy)]
#[repr(C)]
pub union Register {
    /// Integer view.
    pub i64: i64,
    /// Floating-point view.
    pub n64: f64,
    /// Reference view (objects and strings).
    pub o: Ref,
}

impl Register {
    /// An integer register.
    #[must_use]
    pub const fn int(value: i64) -> Self {
        Self { i64: value }
    }

    /// A floating-point register.
    #[must_use]
    pub const fn num(value: f64) -> Self {
        Self { n64: value }
    }

    /// A reference register.
    #[must_use]
    pub const fn obj(value: Ref) -> Self {
        Self { o: value }
    }

    /// Reads the reference view.
    ///
    /// # Safety
    ///
    /// The register must have been written as a reference.
    #[must_use]
    pub const unsafe fn as_obj(&self) -> Ref {
        // SAFETY: caller guarantees the active view.
        unsafe { self.o }
    }
}

impl Default for Register {
    fn default() -> Self {
        Self { i64: 0 }
    }
}

impl std::fmt::Debug for Register {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // SAFETY: every view is plain data of the same width.
        write!(f, "Register({:#x})", unsafe { self.i64 })
    }
}

/// Static type of a register, taken from the frame's type map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterKind {
    /// Native integer.
    Int,
    /// Native float.
    Num,
    /// String (a managed reference).
    Str,
    /// Object (a managed reference).
    Obj,
}

impl RegisterKind {
    /// Whether registers of this kind hold a managed reference.
    #[must_use]
    pub const fn is_reference(self) -> bool {
        matches!(self, Self::Str | Self::Obj)
    }
}

/// Flags describing one argument of a callsite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgFlags(u8);

impl ArgFlags {
    /// Object argument.
    pub const OBJ: Self = Self(1 << 0);
    /// Native integer argument.
    pub const INT: Self = Self(1 << 1);
    /// Native float argument.
    pub const NUM: Self = Self(1 << 2);
    /// String argument.
    pub const STR: Self = Self(1 << 3);
    /// Passed by name.
    pub const NAMED: Self = Self(1 << 5);
    /// Flattened positional list.
    pub const FLAT: Self = Self(1 << 6);
    /// Flattened named hash.
    pub const FLAT_NAMED: Self = Self(1 << 7);

    /// Bitwise union.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Whether every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether the argument register holds a managed reference.
    #[must_use]
    pub const fn is_reference(self) -> bool {
        self.0 & (Self::OBJ.0 | Self::STR.0) != 0
    }
}

/// Shape of a call: one flag per argument register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Callsite {
    /// Per-register argument flags.
    pub arg_flags: Vec<ArgFlags>,
    /// Whether any argument was flattened.
    pub has_flattening: bool,
}

impl Callsite {
    /// Builds a callsite, deriving `has_flattening` from the flags.
    #[must_use]
    pub fn new(arg_flags: Vec<ArgFlags>) -> Self {
        let has_flattening = arg_flags
            .iter()
            .any(|f| f.contains(ArgFlags::FLAT) || f.contains(ArgFlags::FLAT_NAMED));
        Self {
            arg_flags,
            has_flattening,
        }
    }
}

/// Arguments received by a frame, kept after flattening expanded them.
#[derive(Debug)]
pub struct Params {
    /// The expanded callsite.
    pub callsite: Arc<Callsite>,
    /// The expanded argument registers.
    pub args: Vec<Register>,
}

/// An interpreter call frame.
#[derive(Debug)]
pub struct Frame {
    /// Calling frame.
    pub caller: Option<NonNull<Frame>>,
    /// Lexically enclosing frame.
    pub outer: Option<NonNull<Frame>>,
    /// Code object being run.
    pub code_ref: Ref,
    /// Static frame metadata object.
    pub static_info: Ref,
    /// Reified context object, if any.
    pub context_object: Ref,
    /// Type map for `work`.
    pub local_types: Arc<[RegisterKind]>,
    /// Local registers.
    pub work: Vec<Register>,
    /// Type map for `env`.
    pub lexical_types: Arc<[RegisterKind]>,
    /// Lexical registers.
    pub env: Vec<Register>,
    /// Outgoing argument buffer.
    pub args: Vec<Register>,
    /// Callsite describing `args`.
    pub cur_args_callsite: Option<Arc<Callsite>>,
    /// Incoming parameters.
    pub params: Option<Params>,
    gc_seq: AtomicU32,
}

// SAFETY: frames are only touched by their thread, or by the collector while
// that thread is stopped.
unsafe impl Send for Frame {}
// SAFETY: see above; the run stamp is atomic.
unsafe impl Sync for Frame {}

impl Frame {
    /// Creates a frame with zeroed registers sized from the type maps.
    #[must_use]
    pub fn new(
        static_info: Ref,
        code_ref: Ref,
        local_types: Arc<[RegisterKind]>,
        lexical_types: Arc<[RegisterKind]>,
    ) -> Self {
        Self {
            caller: None,
            outer: None,
            code_ref,
            static_info,
            context_object: Ref::NULL,
            work: vec![Register::default(); local_types.len()],
            local_types,
            env: vec![Register::default(); lexical_types.len()],
            lexical_types,
            args: Vec::new(),
            cur_args_callsite: None,
            params: None,
            gc_seq: AtomicU32::new(0),
        }
    }

    /// Claims the frame for run `seq`.
    ///
    /// Returns `true` exactly once per run: for the first caller that sees a
    /// stamp other than `seq`.
    pub fn claim_for_run(&self, seq: u32) -> bool {
        let mut current = self.gc_seq.load(Ordering::Acquire);
        loop {
            if current == seq {
                return false;
            }
            match self
                .gc_seq
                .compare_exchange_weak(current, seq, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Whether the frame was already scanned in run `seq`.
    #[must_use]
    pub fn scanned_in(&self, seq: u32) -> bool {
        self.gc_seq.load(Ordering::Acquire) == seq
    }

    /// Enqueues every root held by the frame.
    pub(crate) fn add_roots(&mut self, worklist: &mut Worklist) {
        if let Some(caller) = self.caller {
            worklist.add_frame(caller);
        }
        if let Some(outer) = self.outer {
            worklist.add_frame(outer);
        }
        worklist.add(&mut self.code_ref);
        worklist.add(&mut self.static_info);
        worklist.add(&mut self.context_object);

        add_typed_registers(&self.local_types, &mut self.work, worklist);
        add_typed_registers(&self.lexical_types, &mut self.env, worklist);

        if let Some(callsite) = &self.cur_args_callsite {
            add_flagged_registers(&callsite.arg_flags, &mut self.args, worklist);
        }
        if let Some(params) = &mut self.params {
            if params.callsite.has_flattening {
                add_flagged_registers(&params.callsite.arg_flags, &mut params.args, worklist);
            }
        }
    }
}

fn add_typed_registers(kinds: &[RegisterKind], regs: &mut [Register], worklist: &mut Worklist) {
    for (kind, reg) in kinds.iter().zip(regs.iter_mut()) {
        if kind.is_reference() {
            // SAFETY: the type map says this register holds a reference.
            worklist.add(unsafe { &mut reg.o });
        }
    }
}

fn add_flagged_registers(flags: &[ArgFlags], regs: &mut [Register], worklist: &mut Worklist) {
    for (flag, reg) in flags.iter().zip(regs.iter_mut()) {
        if flag.is_reference() {
            // SAFETY: the callsite says this register holds a reference.
            worklist.add(unsafe { &mut reg.o });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_once_per_run() {
        let frame = Frame::new(Ref::NULL, Ref::NULL, Arc::from([]), Arc::from([]));
        assert!(frame.claim_for_run(1));
        assert!(!frame.claim_for_run(1));
        assert!(frame.scanned_in(1));
        assert!(frame.claim_for_run(2));
    }

    #[test]
    fn test_registers_sized_from_type_maps() {
        let frame = Frame::new(
            Ref::NULL,
            Ref::NULL,
            Arc::from([RegisterKind::Int, RegisterKind::Obj]),
            Arc::from([RegisterKind::Str]),
        );
        assert_eq!(frame.work.len(), 2);
        assert_eq!(frame.env.len(), 1);
    }

    #[test]
    fn test_null_registers_enqueue_nothing() {
        let mut caller = Frame::new(Ref::NULL, Ref::NULL, Arc::from([]), Arc::from([]));
        let mut frame = Frame::new(
            Ref::NULL,
            Ref::NULL,
            Arc::from([RegisterKind::Obj, RegisterKind::Int]),
            Arc::from([]),
        );
        frame.caller = Some(NonNull::from(&mut caller));
        let mut wl = Worklist::new(true);
        frame.add_roots(&mut wl);
        assert_eq!(wl.len(), 0);
        assert_eq!(wl.pop_frame(), Some(NonNull::from(&mut caller)));
    }

    #[test]
    fn test_flattening_detection() {
        let plain = Callsite::new(vec![ArgFlags::OBJ, ArgFlags::INT]);
        assert!(!plain.has_flattening);
        let flat = Callsite::new(vec![ArgFlags::OBJ.union(ArgFlags::FLAT)]);
        assert!(flat.has_flattening);
    }
}
