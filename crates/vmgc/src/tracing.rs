//! GC tracing support.
//!
//! With the `tracing` feature enabled this module opens a span per run and
//! emits structured events for elections, stealing, routed work, sweeps and
//! thread teardown. Without it every function is an inlined no-op.

/// High-level phases of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    /// Seeding worklists from roots.
    Roots,
    /// Draining worklists and in-trays.
    Trace,
    /// Nursery and gen2 sweeps.
    Sweep,
    /// Per-thread cleanup and acknowledgement.
    Finish,
}

#[cfg(feature = "tracing")]
pub(crate) mod internal {
    use super::GcPhase;
    use crate::fatal::GcFatal;
    use tracing::{span, Level};

    /// Span covering one participant's part of a run.
    pub fn gc_run(seq: u32, generation: &'static str, worker: u32) -> span::EnteredSpan {
        span!(
            target: "vmgc",
            Level::DEBUG,
            "gc_run",
            seq,
            generation,
            worker
        )
        .entered()
    }

    pub fn log_phase(phase: GcPhase, thread_id: u32) {
        tracing::trace!(target: "vmgc", phase = ?phase, thread_id, "phase");
    }

    pub fn log_elected(seq: u32, thread_id: u32) {
        tracing::debug!(target: "vmgc", seq, thread_id, "coordinator_elected");
    }

    pub fn log_signal(target_id: u32, stolen: bool) {
        tracing::debug!(target: "vmgc", target_id, stolen, "thread_signalled");
    }

    pub fn log_passed(target_id: u32, items: usize) {
        tracing::trace!(target: "vmgc", target_id, items, "work_passed");
    }

    pub fn log_received(thread_id: u32, batches: usize) {
        tracing::trace!(target: "vmgc", thread_id, batches, "work_received");
    }

    pub fn log_sweep(thread_id: u32, nursery_freed: usize, gen2_freed: usize) {
        tracing::debug!(target: "vmgc", thread_id, nursery_freed, gen2_freed, "sweep");
    }

    pub fn log_thread_destroyed(thread_id: u32, by: u32) {
        tracing::debug!(target: "vmgc", thread_id, by, "thread_destroyed");
    }

    pub fn log_fatal(kind: GcFatal, location: &std::panic::Location<'_>) {
        tracing::error!(target: "vmgc", kind = ?kind, %location, "fatal");
    }
}

#[cfg(not(feature = "tracing"))]
#[allow(clippy::missing_const_for_fn)]
pub(crate) mod internal {
    use super::GcPhase;
    use crate::fatal::GcFatal;

    /// Stub span guard when tracing is disabled.
    pub struct NoSpan;

    #[inline]
    pub fn gc_run(_seq: u32, _generation: &'static str, _worker: u32) -> NoSpan {
        NoSpan
    }

    #[inline]
    pub fn log_phase(_phase: GcPhase, _thread_id: u32) {}

    #[inline]
    pub fn log_elected(_seq: u32, _thread_id: u32) {}

    #[inline]
    pub fn log_signal(_target_id: u32, _stolen: bool) {}

    #[inline]
    pub fn log_passed(_target_id: u32, _items: usize) {}

    #[inline]
    pub fn log_received(_thread_id: u32, _batches: usize) {}

    #[inline]
    pub fn log_sweep(_thread_id: u32, _nursery_freed: usize, _gen2_freed: usize) {}

    #[inline]
    pub fn log_thread_destroyed(_thread_id: u32, _by: u32) {}

    #[inline]
    pub fn log_fatal(_kind: GcFatal, _location: &std::panic::Location<'_>) {}
}
