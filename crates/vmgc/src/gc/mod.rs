//! Collection runs.
//!
//! - [`worklist`]: slot and frame worklists
//! - [`collect`]: copying, promotion and marking of one thread's heap
//! - [`passing`]: routing of foreign slots between participants
//! - [`orchestrate`]: run election, stealing, barriers and cleanup
//! - [`sync`]: lock ordering for the few structures behind mutexes

pub mod collect;
pub mod orchestrate;
pub mod passing;
pub mod sync;
pub mod worklist;

use crate::metrics::CollectionType;

/// Generations a run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    /// Nursery only; gen2 objects are roots through the gen2 root lists.
    Nursery,
    /// Nursery and gen2.
    Full,
}

impl Generation {
    /// Label used in trace spans.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Nursery => "nursery",
            Self::Full => "full",
        }
    }
}

impl From<Generation> for CollectionType {
    fn from(generation: Generation) -> Self {
        match generation {
            Generation::Nursery => Self::Nursery,
            Generation::Full => Self::Full,
        }
    }
}

/// Root sets a participant processes for its own heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhatToDo {
    /// Instance-wide roots as well; only the coordinator does this.
    All,
    /// Thread roots only.
    NoInstance,
}
