//! Shared types for the Cadence job-processing core.
//!
//! Task envelopes, options, state snapshots and the common error type live
//! here so that producers and the dispatcher agree on one vocabulary without
//! depending on the runtime crate.

pub mod error;
pub mod prelude;
pub mod task;
pub mod types;

// vim: ts=4
