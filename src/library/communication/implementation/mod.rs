//! Implementations of the broker seams of this module
//!
//! Adapters for concrete broker clients implement [`Transport`](super::Transport) and live next
//! to the in-memory doubles below.

pub mod mock;
