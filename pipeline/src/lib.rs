//! Pipeline Executor
//!
//! Runs an ordered list of stages, each routed independently with the
//! capability it needs; a stage's output becomes the next stage's input.
//! A stage failure aborts the pipeline and surfaces the partial trace.

pub mod executor;

pub use executor::*;
