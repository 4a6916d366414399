//! # Trace Context Propagation
//!
//! W3C trace context travels in message headers. Publishers inject the
//! current context; the dispatcher extracts it and runs the handler inside a
//! consumer span parented to the producer, so events emitted by the handler
//! continue the same trace.

use std::sync::OnceLock;

use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::{SpanKind, TraceContextExt, Tracer};
use opentelemetry::{global, Context, KeyValue};
use opentelemetry_sdk::propagation::TraceContextPropagator;

use crate::messaging::{EventEnvelope, Headers};

pub const TRACER_NAME: &str = "papa-events";

static PROPAGATOR_INSTALLED: OnceLock<()> = OnceLock::new();

/// Install the W3C trace-context propagator as the global propagator.
/// Idempotent.
pub fn install_trace_propagator() {
    PROPAGATOR_INSTALLED.get_or_init(|| {
        global::set_text_map_propagator(TraceContextPropagator::new());
    });
}

pub fn inject_context(cx: &Context) -> Headers {
    let mut headers = Headers::new();
    global::get_text_map_propagator(|propagator| propagator.inject_context(cx, &mut headers));
    headers
}

/// Trace headers for the caller's current context
pub fn current_trace_headers() -> Headers {
    inject_context(&Context::current())
}

pub fn extract_context(headers: &Headers) -> Context {
    global::get_text_map_propagator(|propagator| propagator.extract(headers))
}

/// Context holding a consumer span for one delivery, parented to the
/// producer's context carried in the envelope
pub fn consumer_context(use_case: &str, envelope: &EventEnvelope) -> Context {
    let parent = extract_context(&envelope.trace_context);
    let tracer = global::tracer(TRACER_NAME);
    let span = tracer
        .span_builder(format!("{} process", envelope.event_name))
        .with_kind(SpanKind::Consumer)
        .with_attributes([
            KeyValue::new("messaging.system", "rabbitmq"),
            KeyValue::new("messaging.destination.name", use_case.to_string()),
            KeyValue::new("messaging.message.id", envelope.message_id.to_string()),
            KeyValue::new("papa_events.retry_count", i64::from(envelope.retry_count)),
        ])
        .start_with_context(&tracer, &parent);
    parent.with_span(span)
}

/// Standalone W3C propagator, independent of the global one
pub fn trace_context_propagator() -> impl TextMapPropagator {
    TraceContextPropagator::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::{SpanContext, SpanId, TraceFlags, TraceId, TraceState};

    fn remote_context() -> Context {
        let span_context = SpanContext::new(
            TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap(),
            SpanId::from_hex("00f067aa0ba902b7").unwrap(),
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        );
        Context::new().with_remote_span_context(span_context)
    }

    #[test]
    fn test_inject_and_extract_traceparent() {
        install_trace_propagator();
        let headers = inject_context(&remote_context());
        let traceparent = headers.get("traceparent").unwrap();
        assert!(traceparent.contains("4bf92f3577b34da6a3ce929d0e0e4736"));

        let extracted = extract_context(&headers);
        assert_eq!(
            extracted.span().span_context().trace_id(),
            remote_context().span().span_context().trace_id()
        );
    }

    #[test]
    fn test_consumer_context_keeps_trace_id() {
        install_trace_propagator();
        let envelope = EventEnvelope::new("user.created", b"{}".to_vec())
            .with_trace_context(inject_context(&remote_context()));

        let cx = consumer_context("send_welcome_email", &envelope);
        let headers = inject_context(&cx);
        assert!(headers
            .get("traceparent")
            .is_some_and(|tp| tp.contains("4bf92f3577b34da6a3ce929d0e0e4736")));
    }

    #[test]
    fn test_empty_context_injects_nothing() {
        let propagator = trace_context_propagator();
        let mut headers = Headers::new();
        propagator.inject_context(&Context::new(), &mut headers);
        assert!(headers.is_empty());
    }
}
