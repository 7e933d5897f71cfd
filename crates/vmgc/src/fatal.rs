//! Unrecoverable collector failures.
//!
//! Nothing inside a collection run can be retried or unwound: a corrupted
//! slot or a broken status transition may already have damaged another
//! thread's heap. Every detected violation therefore ends the process with a
//! diagnostic. Unit tests build with `cfg(test)`, where the failure panics
//! instead so misuse can be asserted with `#[should_panic]`.

use std::fmt;

/// Kinds of fatal collector failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcFatal {
    /// A slot resolves into the part of a tospace that has not been handed
    /// out yet.
    HeapCorruption,
    /// A header carries both the type-object and type-descriptor bits.
    InvalidFlags,
    /// The temporary root stack was popped while empty.
    TempRootUnderflow,
    /// A live object has no type descriptor.
    NullDescriptor,
    /// A thread status changed in a way the run protocol does not allow.
    InvalidTransition,
    /// A null slot address was registered as a root.
    NullRoot,
    /// Work was routed to a thread that is not part of the current run.
    MissingGcOwner,
    /// Memory for a semispace, a gen2 page or a copy could not be obtained.
    AllocationFailure,
    /// A thread context was used after its instance was dropped.
    InstanceGone,
}

impl fmt::Display for GcFatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::HeapCorruption => "heap corruption: slot points past the copy cursor",
            Self::InvalidFlags => "impossible collectable kind in header flags",
            Self::TempRootUnderflow => "temporary root stack underflow",
            Self::NullDescriptor => "live object has a null type descriptor",
            Self::InvalidTransition => "invalid thread status transition",
            Self::NullRoot => "null address registered as a root",
            Self::MissingGcOwner => "routed work targets a thread outside the run",
            Self::AllocationFailure => "collector memory allocation failed",
            Self::InstanceGone => "thread context outlived its instance",
        };
        f.write_str(msg)
    }
}

/// Aborts with a diagnostic.
#[cold]
#[inline(never)]
#[track_caller]
pub fn fatal(kind: GcFatal) -> ! {
    fatal_with(kind, format_args!(""))
}

/// Aborts with a diagnostic and extra context.
#[cold]
#[inline(never)]
#[track_caller]
pub fn fatal_with(kind: GcFatal, detail: fmt::Arguments<'_>) -> ! {
    let location = std::panic::Location::caller();
    crate::tracing::internal::log_fatal(kind, location);

    #[cfg(test)]
    {
        panic!("vmgc fatal: {kind} {detail} at {location}");
    }

    #[cfg(not(test))]
    {
        eprintln!("vmgc fatal: {kind} {detail} at {location}");
        std::process::abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "temporary root stack underflow")]
    fn test_fatal_panics_under_test() {
        fatal(GcFatal::TempRootUnderflow);
    }

    #[test]
    fn test_messages_are_distinct() {
        let all = [
            GcFatal::HeapCorruption,
            GcFatal::InvalidFlags,
            GcFatal::TempRootUnderflow,
            GcFatal::NullDescriptor,
            GcFatal::InvalidTransition,
            GcFatal::NullRoot,
            GcFatal::MissingGcOwner,
            GcFatal::AllocationFailure,
            GcFatal::InstanceGone,
        ];
        let mut msgs: Vec<String> = all.iter().map(ToString::to_string).collect();
        msgs.sort();
        msgs.dedup();
        assert_eq!(msgs.len(), all.len());
    }
}
