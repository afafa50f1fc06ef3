//! Reliable message consumption for AMQP-style brokers.
//!
//! The crate is split in two layers. The low-level [`library`] contains broker-agnostic building
//! blocks (an async mutex, a non-overlapping interval timer, a registry of in-flight tasks, the
//! acknowledgement strategies and the consumer lifecycle). The [`harness`] wires them into a
//! process by installing logging and keeping consumers alive until the process is terminated.
//!
//! Broker transports, message distribution (handler lookup, middleware, deserialization) and
//! telemetry backends are collaborators that plug in through the traits in
//! [`library::communication`] and [`library::telemetry`].

#![deny(missing_docs)]

pub mod harness;
pub mod library;
