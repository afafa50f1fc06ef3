//! Observability seams of the consumer
//!
//! Metrics and traces are recorded through the [`MetricsRecorder`] and [`TraceFactory`] traits.
//! Both are constructed once and injected, nothing in here reaches for global state.

mod metrics;
mod trace;

pub use metrics::*;
pub use trace::*;
