//! The collection plan: write barriers and the incremental schedule.

pub mod barriers;
pub mod schedule;

pub use schedule::{fullgc, step, step_fixtop, step_jit, StepResult};
