//! The batched run engine.
//!
//! `flow` executes a list of declarative steps under one shared CDP
//! session and returns a single compact report; `run` is the public
//! wrapper that adds the reliability policy, the irreversible guard, and
//! transparent resume after CDP-brick recovery.

pub mod classify;
pub mod conditions;
pub mod engine;
pub mod interpolate;
pub mod internal;
pub mod proof;
pub mod run;
pub mod timeouts;
pub mod types;
pub mod watchdog;

pub use engine::FlowEngine;
pub use timeouts::{TimeoutDefaults, TimeoutProfile};

/// Global cap on the expanded step list, nested macros and repeats
/// included.
pub const MAX_TOTAL_STEPS: usize = 2000;

/// Macro include nesting limit.
pub const MAX_INCLUDE_DEPTH: usize = 10;
