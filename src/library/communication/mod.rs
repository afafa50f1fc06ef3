//! Reliable consumption of messages from an AMQP-style broker
//!
//! A [`Consumer`](consumer::Consumer) owns one broker channel at a time. Every delivery it
//! receives is processed as an independent task which asks the [`MessageDistributor`] for a
//! [`DeliveryOutcome`]. The outcome is then handed to an [`AckStrategy`](ack::AckStrategy) which
//! decides when and how the broker learns about it:
//!
//! 1. **Auto** lets the broker acknowledge on delivery and only logs failures
//! 2. **Single** settles every delivery with its own broker call
//! 3. **Multi** batches contiguous acknowledgements into cumulative multi-acks
//!
//! Handler tasks complete out of order while the broker expects settlements that respect its
//! ordered, cumulative protocol. The multi-ack strategy reconciles the two and guarantees that
//! every delivery tag is settled exactly once.
//!
//! Channels are lost from time to time. The consumer notices this through the channel's close
//! notification, tears everything down, waits for the network to recover and starts over with a
//! fresh channel. Unsettled deliveries of the lost channel are redelivered by the broker which
//! makes the whole system at-least-once.

mod channel;
mod delivery;
mod distribution;
mod error;
mod options;
mod topology;

pub mod ack;
pub mod consumer;
pub mod implementation;

pub use channel::*;
pub use delivery::*;
pub use distribution::*;
pub use error::*;
pub use options::*;
pub use topology::*;
