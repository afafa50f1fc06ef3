use crate::library::communication::{Delivery, DeliveryOutcome};
use opentelemetry::global::{BoxedSpan, BoxedTracer};
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::sdk::propagation::TraceContextPropagator;
use opentelemetry::trace::{Span, StatusCode, Tracer};
use opentelemetry::{Context, KeyValue};
use std::collections::HashMap;

/// Header carrying a JSON serialized map of propagation fields
pub const TRACE_CONTEXT_HEADER: &str = "trace-context";

/// Trace of processing a single delivery, ended when dropped
pub trait TraceScope: Send {
    /// Attaches the final outcome
    fn record_outcome(&mut self, outcome: DeliveryOutcome);

    /// Marks the trace as failed
    fn record_error(&mut self, error: &str);
}

/// Creates a [`TraceScope`] for each delivery
pub trait TraceFactory: Send + Sync {
    /// Starts a trace, continuing one propagated through the delivery headers if present
    fn start(&self, delivery: &Delivery) -> Box<dyn TraceScope>;
}

/// Factory whose traces record nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTraceFactory;

struct NoopScope;

impl TraceScope for NoopScope {
    fn record_outcome(&mut self, _outcome: DeliveryOutcome) {}
    fn record_error(&mut self, _error: &str) {}
}

impl TraceFactory for NoopTraceFactory {
    fn start(&self, _delivery: &Delivery) -> Box<dyn TraceScope> {
        Box::new(NoopScope)
    }
}

/// Creates OpenTelemetry spans that continue W3C trace contexts found in delivery headers
///
/// Publishers either send the `traceparent`/`tracestate` headers directly or a single
/// [`TRACE_CONTEXT_HEADER`] containing them as a JSON object (see
/// [`serialize`](PropagatingTraceFactory::serialize)).
pub struct PropagatingTraceFactory {
    tracer: BoxedTracer,
    propagator: TraceContextPropagator,
    span_name: String,
}

impl PropagatingTraceFactory {
    /// Creates spans named `consume` using the given tracer
    pub fn new(tracer: BoxedTracer) -> Self {
        Self {
            tracer,
            propagator: TraceContextPropagator::new(),
            span_name: "consume".to_owned(),
        }
    }

    /// Overrides the name of created spans
    pub fn with_span_name(mut self, name: impl Into<String>) -> Self {
        self.span_name = name.into();
        self
    }

    /// Serializes the given context into a value for the [`TRACE_CONTEXT_HEADER`]
    pub fn serialize(&self, context: &Context) -> Result<String, serde_json::Error> {
        let mut map = HashMap::new();
        self.propagator.inject_context(context, &mut map);
        serde_json::to_string(&map)
    }

    fn parent_context(&self, delivery: &Delivery) -> Context {
        self.propagator.extract(&carrier(delivery))
    }
}

impl TraceFactory for PropagatingTraceFactory {
    fn start(&self, delivery: &Delivery) -> Box<dyn TraceScope> {
        let parent = self.parent_context(delivery);
        let mut span = self
            .tracer
            .start_with_context(self.span_name.clone(), parent);

        span.set_attribute(KeyValue::new("messaging.delivery_tag", delivery.tag as i64));
        span.set_attribute(KeyValue::new(
            "messaging.message_type",
            delivery.message_type().to_owned(),
        ));
        span.set_attribute(KeyValue::new(
            "messaging.message_id",
            delivery.message_id().to_owned(),
        ));
        span.set_attribute(KeyValue::new("messaging.redelivered", delivery.redelivered));

        Box::new(OtelScope { span })
    }
}

struct OtelScope {
    span: BoxedSpan,
}

impl TraceScope for OtelScope {
    fn record_outcome(&mut self, outcome: DeliveryOutcome) {
        self.span
            .set_attribute(KeyValue::new("messaging.outcome", outcome.as_str()));
    }

    fn record_error(&mut self, error: &str) {
        self.span.set_status(StatusCode::Error, error.to_owned());
    }
}

impl Drop for OtelScope {
    fn drop(&mut self) {
        self.span.end();
    }
}

/// Merges plain headers with the fields of a serialized trace context header
fn carrier(delivery: &Delivery) -> HashMap<String, String> {
    let headers = &delivery.properties.headers;
    let mut carrier = headers.clone();

    if let Some(serialized) = headers.get(TRACE_CONTEXT_HEADER) {
        if let Ok(fields) = serde_json::from_str::<HashMap<String, String>>(serialized) {
            carrier.extend(fields);
        }
    }

    carrier
}
