//! W3C Trace Context propagation across suspensions.
//!
//! A flow may be started by one request and resumed hours later by another,
//! possibly in another process. The context of the span that started the
//! flow is captured into [`FlowRecord::trace_context`](crate::FlowRecord)
//! and restored as the parent of every later resume span, so one trace
//! covers the whole flow.
//!
//! Format: `traceparent: 00-{trace_id}-{span_id}-{flags}`.

use opentelemetry::Context;
use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use std::collections::HashMap;
use tracing_opentelemetry::OpenTelemetrySpanExt;

struct HeaderInjector<'a>(&'a mut HashMap<String, String>);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_string(), value);
    }
}

struct HeaderExtractor<'a>(&'a HashMap<String, String>);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|s| s.as_str())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|k| k.as_str()).collect()
    }
}

/// Capture the current span's trace context.
///
/// Returns `None` when there is no active context worth storing.
///
/// # Example
///
/// ```ignore
/// record.trace_context = inject_trace_context();
/// // Some({"traceparent": "00-...-...-01"})
/// ```
pub fn inject_trace_context() -> Option<HashMap<String, String>> {
    let propagator = TraceContextPropagator::new();
    let cx = tracing::Span::current().context();

    let mut headers = HashMap::new();
    propagator.inject_context(&cx, &mut HeaderInjector(&mut headers));
    (!headers.is_empty()).then_some(headers)
}

/// Restore a context captured by [`inject_trace_context`].
///
/// # Example
///
/// ```ignore
/// if let Some(headers) = &record.trace_context {
///     tracing::Span::current().set_parent(extract_trace_context(headers));
/// }
/// ```
pub fn extract_trace_context(headers: &HashMap<String, String>) -> Context {
    TraceContextPropagator::new().extract(&HeaderExtractor(headers))
}
