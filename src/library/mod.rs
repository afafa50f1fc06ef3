//! Independent and broker agnostic libraries
//!
//! Nothing in here knows about a concrete broker. Transports, message distribution and telemetry
//! backends are injected through traits so that each submodule can be tested in isolation using
//! the mock implementations in [`communication::implementation::mock`].

pub mod communication;
pub mod helpers;
pub mod scheduling;
pub mod sync;
pub mod telemetry;

/// Generic error type
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result with no value and a [`BoxedError`]
pub type EmptyResult = Result<(), BoxedError>;
