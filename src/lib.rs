//! An incremental, tri-color, mostly-non-moving garbage collector for
//! the Luna runtime.
//!
//! The collector combines:
//! * size-class bitmap arenas for the fixed-slot kinds (strings,
//!   upvalues, functions, tables, userdata) with SIMD mark/sweep,
//! * a freelist allocator for variable-size medium strings and a huge
//!   list for oversized payloads,
//! * a blob region for GC-managed variable-size buffers owned by GC
//!   objects, with usage-driven one-shot compaction,
//! * a string-interning table with a primary/secondary layout,
//! * a write-barrier protocol, weak-table clearing with an ephemeron
//!   fixpoint, a finalizer pipeline, and
//! * an allocation-debt-paced scheduler interleaving mark, sweep and
//!   finalizer work with mutator execution.
//!
//! Everything hangs off a [`GlobalState`] bound to one host through the
//! [`vm::VMBinding`] trait; hosts drive the collector through
//! [`memory_manager`].

// The arena/mark/sweep code indexes through raw pointers to bitmap
// fields (`(*a).mark[w]`); this is a deliberate unsafe-pointer access
// pattern, not an accidental aliasing hazard, so the lint is silenced
// crate-wide rather than rewritten call-by-call.
#![allow(dangerous_implicit_autorefs)]

#[macro_use]
extern crate log;

pub mod finalize;
pub mod global;
pub mod mark;
pub mod memory_manager;
pub mod object;
pub mod plan;
pub mod policy;
pub mod strtab;
pub mod sweep;
pub mod util;
pub mod vm;

pub use crate::global::{GcPhase, GlobalState};
pub use crate::plan::StepResult;
pub use crate::util::options::GcOptions;

/// Errors the collector can surface to the host. Every failing
/// operation leaves the pre-existing structures consistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcError {
    /// The allocator or page provider returned nothing for a nonzero
    /// request.
    OutOfMemory,
    /// A table array part exceeded the representable size.
    TableOverflow,
}

impl std::fmt::Display for GcError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            GcError::OutOfMemory => write!(f, "not enough memory"),
            GcError::TableOverflow => write!(f, "table overflow"),
        }
    }
}

impl std::error::Error for GcError {}
