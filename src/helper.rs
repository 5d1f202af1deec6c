use http::HeaderMap;
use opentelemetry::{
    propagation::{text_map_propagator::FieldIter, Extractor, Injector, TextMapPropagator},
    Context,
};
use opentelemetry_http::HeaderInjector;

/// Propagator delegating to the one registered with
/// [`opentelemetry::global::set_text_map_propagator`] at the time it is used.
///
/// This is the default of [`crate::Config`] when no propagator option is given.
#[derive(Debug, Default, Clone, Copy)]
pub struct GlobalPropagator;

impl TextMapPropagator for GlobalPropagator {
    fn inject_context(&self, cx: &Context, injector: &mut dyn Injector) {
        opentelemetry::global::get_text_map_propagator(|propagator| {
            propagator.inject_context(cx, injector)
        });
    }

    fn extract_with_context(&self, cx: &Context, extractor: &dyn Extractor) -> Context {
        // The noop propagator returns the current context, so make it the given one
        let _guard = cx.clone().attach();
        opentelemetry::global::get_text_map_propagator(|propagator| {
            propagator.extract_with_context(cx, extractor)
        })
    }

    /// The global propagator can be swapped at any time so its fields can't be borrowed.
    fn fields(&self) -> FieldIter<'_> {
        FieldIter::new(&[])
    }
}

/// Inject OTEL information into the headers
///
/// Can be use to propagate the trace between distributed services, for example on
/// the response sent back to the caller or on an outgoing request.
pub fn inject_trace_context(
    cx: &Context,
    propagator: &dyn TextMapPropagator,
    headers: &mut HeaderMap,
) {
    let mut injector = HeaderInjector(headers);
    propagator.inject_context(cx, &mut injector);
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::{
        SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState,
    };
    use opentelemetry_http::HeaderExtractor;
    use opentelemetry_sdk::propagation::TraceContextPropagator;

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
    fn test_inject_trace_context() {
        let mut headers = HeaderMap::new();
        inject_trace_context(
            &remote_context(),
            &TraceContextPropagator::new(),
            &mut headers,
        );

        assert_eq!(
            headers.get("traceparent").unwrap(),
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"
        );
    }

    #[test]
    fn test_inject_invalid_context_is_a_noop() {
        let mut headers = HeaderMap::new();
        inject_trace_context(&Context::new(), &TraceContextPropagator::new(), &mut headers);

        assert!(headers.is_empty());
    }

    #[test]
    fn test_global_propagator_without_registration_extracts_nothing() {
        let mut headers = HeaderMap::new();
        inject_trace_context(
            &remote_context(),
            &TraceContextPropagator::new(),
            &mut headers,
        );

        // No propagator has been registered in this process for unit tests.
        let cx = GlobalPropagator.extract(&HeaderExtractor(&headers));
        assert!(!cx.span().span_context().is_valid());
        assert_eq!(GlobalPropagator.fields().count(), 0);
    }

    #[test]
    fn test_global_propagator_without_registration_keeps_given_context() {
        let parent = remote_context();
        let headers = HeaderMap::new();

        let cx = GlobalPropagator.extract_with_context(&parent, &HeaderExtractor(&headers));
        assert_eq!(
            cx.span().span_context().span_id(),
            SpanId::from_hex("00f067aa0ba902b7").unwrap()
        );
        // The given context is only current during the extraction
        assert!(!Context::current().span().span_context().is_valid());
    }
}
