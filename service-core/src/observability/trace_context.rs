//! Trace propagation for calls between nodes.
//!
//! A forwarded call carries the W3C `traceparent`/`tracestate` of the current
//! span and the caller's `x-request-id`, so the standby hop and the active hop
//! land in the same trace.

use opentelemetry::trace::{SpanContext, TraceContextExt};
use reqwest::RequestBuilder;
use reqwest::header::{HeaderMap, HeaderValue};
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;

pub const TRACEPARENT_HEADER: &str = "traceparent";
pub const TRACESTATE_HEADER: &str = "tracestate";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

fn traceparent(ctx: &SpanContext) -> String {
    format!(
        "00-{}-{}-{:02x}",
        ctx.trace_id(),
        ctx.span_id(),
        ctx.trace_flags().to_u8()
    )
}

/// Headers describing the current span plus the request id.
///
/// Without an OTLP exporter the span context is invalid and only the request
/// id is set.
pub fn propagation_headers(request_id: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();

    let context = Span::current().context();
    let span = context.span();
    let span_context = span.span_context();
    if span_context.is_valid() {
        if let Ok(value) = HeaderValue::from_str(&traceparent(span_context)) {
            headers.insert(TRACEPARENT_HEADER, value);
        }
        let state = span_context.trace_state().header();
        if !state.is_empty()
            && let Ok(value) = HeaderValue::from_str(&state)
        {
            headers.insert(TRACESTATE_HEADER, value);
        }
    }

    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
    headers
}

/// Attaches [`propagation_headers`] to an outgoing peer call.
pub trait PropagateTrace {
    fn propagate_trace(self, request_id: &str) -> Self;
}

impl PropagateTrace for RequestBuilder {
    fn propagate_trace(self, request_id: &str) -> Self {
        self.headers(propagation_headers(request_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_is_sent_without_an_active_trace() {
        let headers = propagation_headers("req-42");
        assert!(headers.get(TRACEPARENT_HEADER).is_none());
        assert_eq!(headers.get(REQUEST_ID_HEADER).unwrap(), "req-42");
    }

    #[test]
    fn invalid_request_id_is_dropped() {
        let headers = propagation_headers("bad\nid");
        assert!(headers.get(REQUEST_ID_HEADER).is_none());
    }
}
