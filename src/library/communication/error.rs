use thiserror::Error;

/// Invalid combination of settings, detected when a component is constructed
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    /// Multi-ack batching needs at least two deliveries per batch, use single acks instead
    #[error("multi-ack requires a multiple count of at least 2, got {0}")]
    MultipleCountTooSmall(u16),
    /// Manual acknowledgement without prefetch limit would let the broker flood the consumer
    #[error("prefetch must be positive when deliveries are acknowledged manually")]
    ZeroPrefetch,
    /// At least one delivery has to be processed at a time
    #[error("dispatch concurrency must be positive")]
    ZeroConcurrency,
    /// A duration setting is zero
    #[error("{0} must be longer than zero")]
    ZeroDuration(&'static str),
    /// Queue name is missing
    #[error("queue name must not be empty")]
    MissingQueue,
}
