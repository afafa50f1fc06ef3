//! Synchronisation primitives that never block an executor thread

mod mutex;

pub use mutex::*;
