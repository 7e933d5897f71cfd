//! A generational, copying, multi-threaded garbage collector core for
//! language runtimes.
//!
//! `vmgc` manages objects whose layout is defined by an external
//! representation layer. Every thread allocates into its own two-space
//! **nursery**; objects that survive two nursery runs are promoted into a
//! non-moving **gen2** store of size-class bins. Collection is
//! stop-the-world among participating threads, reached through a
//! converging handshake: running threads are interrupted at their next
//! safepoint, blocked threads are stolen and collected on their behalf.
//!
//! Each object is owned by one thread. During a run only the collector of
//! that thread copies, promotes or marks it; references discovered by other
//! participants are routed to it in batches.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use vmgc::{GcConfig, Instance, Ref, StructRepr, Trace};
//!
//! #[derive(Default, Trace)]
//! #[repr(C)]
//! struct Pair {
//!     head: Ref,
//!     tail: Ref,
//! }
//!
//! let instance = Instance::new(GcConfig::default()).unwrap();
//! let tc = instance.main_thread();
//! let desc = tc.allocate_descriptor(Arc::new(StructRepr::<Pair>::new("Pair")), "Pair");
//!
//! let mut pair = tc.allocate_object(desc, StructRepr::<Pair>::body_size());
//! let _scope = tc.root_scope();
//! unsafe { tc.root_push(&mut pair) };
//!
//! tc.collect();
//! assert!(tc.nursery_contains(pair));
//! ```
//!
//! # Threads
//!
//! Threads are started with [`Instance::spawn`]. Code that may block for a
//! long time outside the collector (I/O, joins, native calls) runs inside
//! [`ThreadContext::blocking`] so that runs can proceed without it.
//!
//! # Features
//!
//! - `derive` (default): `#[derive(Trace)]` for body structs.
//! - `tracing`: structured events and spans under the `vmgc` target.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

extern crate self as vmgc;

mod config;
mod descriptor;
mod fatal;
mod frame;
mod gc;
mod gen2;
mod header;
mod instance;
mod metrics;
mod nursery;
mod roots;
mod thread;
mod trace;
mod tracing;

pub use config::{
    ConfigError, GcConfig, DEFAULT_GEN2_PAGE_ITEMS, DEFAULT_GEN2_RATIO, DEFAULT_NURSERY_SIZE,
    DEFAULT_PASS_WORK_SIZE,
};
pub use descriptor::{
    BoolificationSpec, ContainerSpec, InvocationSpec, Representation, StructRepr, TypeDescriptor,
    DESCRIPTOR_SIZE,
};
pub use fatal::{fatal, fatal_with, GcFatal};
pub use frame::{ArgFlags, Callsite, Frame, Params, Register, RegisterKind};
pub use gc::worklist::Worklist;
pub use gc::Generation;
pub use gen2::{bin_for, bin_size, Gen2SweepStats, SweepMode, BINS, MAX_BIN_SIZE};
pub use header::{align_size, Collectable, Flags, Forward, Kind, Object, Ref, OBJECT_BODY_OFFSET};
pub use instance::Instance;
pub use metrics::{CollectionType, GcMetrics, GlobalMetrics};
pub use roots::{InstanceRoots, RootScope, ThreadRoots, WeakHandle};
pub use thread::{GcStatus, ThreadContext, ThreadStage};
pub use trace::Trace;
pub use crate::tracing::GcPhase;

#[cfg(feature = "derive")]
pub use vmgc_derive::Trace;
