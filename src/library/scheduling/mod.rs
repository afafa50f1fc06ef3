//! Structures to schedule and keep track of background work
//!
//! - [`IntervalTimer`] runs a callback periodically without ever overlapping two invocations
//! - [`RunningTaskRegistry`] keeps count of in-flight tasks so that shutdown can wait for them

mod interval_timer;
mod running_tasks;

pub use interval_timer::*;
pub use running_tasks::*;
