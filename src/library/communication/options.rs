//! Tunables of the consumer and its acknowledgement strategies
//!
//! The structs can be flattened into the options of a binary. Every setting may also be provided
//! through the environment.

use super::ConfigurationError;
use crate::library::helpers::{parse_millis, parse_seconds};
use std::time::Duration;
use structopt::StructOpt;

/// Options of the multi-ack batching strategy
#[derive(Debug, Clone, PartialEq, Eq, StructOpt)]
pub struct AckOptions {
    /// Pending acknowledgements older than this many milliseconds are flushed individually
    #[structopt(long, env, default_value = "1000", parse(try_from_str = parse_millis))]
    pub multi_ack_staleness: Duration,

    /// Milliseconds between two checks for stale acknowledgements
    #[structopt(long, env, default_value = "2000", parse(try_from_str = parse_millis))]
    pub multi_ack_flush_interval: Duration,

    /// Number of out-of-order deliveries waiting for a gap to close before a warning is logged.
    /// Zero disables the warning.
    #[structopt(long, env, default_value = "10000")]
    pub out_of_order_warning: usize,
}

impl Default for AckOptions {
    fn default() -> Self {
        Self {
            multi_ack_staleness: Duration::from_millis(1000),
            multi_ack_flush_interval: Duration::from_millis(2000),
            out_of_order_warning: 10_000,
        }
    }
}

/// Options of a queue consumer
#[derive(Debug, Clone, PartialEq, Eq, StructOpt)]
pub struct ConsumerOptions {
    /// Name of the queue to consume
    #[structopt(long, env)]
    pub queue: String,

    /// Maximum number of unacknowledged deliveries the broker sends ahead
    #[structopt(long, env, default_value = "50")]
    pub prefetch: u16,

    /// Deliveries per acknowledgement. 0 lets the broker acknowledge on delivery,
    /// 1 acknowledges every delivery on its own, larger values batch acknowledgements.
    #[structopt(long, env, default_value = "1")]
    pub ack_count: u16,

    /// Maximum number of deliveries processed concurrently
    #[structopt(long, env, default_value = "50")]
    pub dispatch_concurrency: usize,

    /// Milliseconds after which message processing is asked to cancel
    #[structopt(long, env, default_value = "30000", parse(try_from_str = parse_millis))]
    pub processing_timeout: Duration,

    /// Milliseconds to wait after a lost connection before reconnecting
    #[structopt(long, env, default_value = "5000", parse(try_from_str = parse_millis))]
    pub network_recovery_interval: Duration,

    /// Seconds to wait for in-flight deliveries when consumption stops
    #[structopt(long, env, default_value = "30", parse(try_from_str = parse_seconds))]
    pub shutdown_timeout: Duration,

    #[allow(missing_docs)]
    #[structopt(flatten)]
    pub ack: AckOptions,
}

impl ConsumerOptions {
    /// Default options for the given queue
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            prefetch: 50,
            ack_count: 1,
            dispatch_concurrency: 50,
            processing_timeout: Duration::from_secs(30),
            network_recovery_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
            ack: AckOptions::default(),
        }
    }

    /// Rejects combinations of settings the consumer can not operate with
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.queue.trim().is_empty() {
            return Err(ConfigurationError::MissingQueue);
        }

        if self.ack_count > 0 && self.prefetch == 0 {
            return Err(ConfigurationError::ZeroPrefetch);
        }

        if self.dispatch_concurrency == 0 {
            return Err(ConfigurationError::ZeroConcurrency);
        }

        let durations = [
            ("processing timeout", self.processing_timeout),
            ("network recovery interval", self.network_recovery_interval),
            ("multi-ack staleness", self.ack.multi_ack_staleness),
            ("multi-ack flush interval", self.ack.multi_ack_flush_interval),
        ];

        for (name, duration) in durations {
            if duration.is_zero() {
                return Err(ConfigurationError::ZeroDuration(name));
            }
        }

        Ok(())
    }
}
