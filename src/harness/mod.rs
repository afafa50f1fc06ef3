//! Process level wiring
//!
//! Installs logging and keeps a set of consumers running until the process is asked to stop.

mod heart;
mod host;
pub mod logging;

pub use heart::*;
pub use host::*;
