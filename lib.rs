//! Insertion of garbage-collection safepoints into a typed, SSA-form IR.
//!
//! The crate is organized as a small compiler middle-end:
//!
//! - [ir] defines the IR itself (types, values, instructions, functions,
//!   modules) along with its textual format and the structural services the
//!   safepoint pass relies on: dominator trees, natural-loop detection with
//!   trip counts, call-site inlining, and promotion of memory slots to SSA
//!   registers.
//!
//! - [analysis] contains the control-flow graph abstraction and the
//!   liveness engine for GC-pointer values.
//!
//! - [safepoints] is the pass: poll-site selection, poll inlining,
//!   base-pointer resolution, statepoint materialization, and relocation
//!   rewriting.

pub mod commons;

pub mod analysis;
pub mod ir;
pub mod safepoints;
