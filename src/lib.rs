//! # OTEL server traces for tower and axum
//!
//! This crate provides an OpenTelemetry (OTEL) tracing middleware for HTTP servers built on
//! [tower](https://docs.rs/tower/latest/tower/), such as [axum](https://docs.rs/axum/latest/axum/).
//!
//! ## Overview
//! Every incoming request gets a server span:
//!
//! - the parent trace context is extracted from the request headers with the configured propagator,
//!   a request without one starts a new trace
//! - the span is started with the attributes of the
//!   [HTTP server semantic conventions](https://opentelemetry.io/docs/specs/semconv/http/http-spans/#http-server)
//! - the downstream services run with the span as the current [`opentelemetry::Context`], which is
//!   also available in the request extensions
//! - the response status code sets the final attributes and the span status, then the span ends
//!
//! ## Configuration
//! The tracer provider and the propagator default to the ones registered in
//! [`opentelemetry::global`]. They can be replaced per layer with [`with_tracer_provider`]
//! and [`with_propagators`], which makes it easy to run the same middleware against an
//! in-memory exporter in tests.
//!
//! ## Implementation Details
//! The middleware talks to the OpenTelemetry API directly instead of going through
//! `tracing-opentelemetry`, so that each layer can use its own tracer provider. `tracing`
//! spans created by the handlers still become children of the server span when a
//! `tracing-opentelemetry` layer is installed, because the server span is the current context
//! while they are created.
//!
//! ## Inspiration
//! This project follows a similar approach to the OpenTelemetry Go instrumentation for common services:
//! [opentelemetry-go-contrib](https://github.com/open-telemetry/opentelemetry-go-contrib/tree/main/instrumentation).

mod config;
mod helper;
pub mod traces;

pub use config::{
    resolve, with_filter, with_propagators, with_span_attributes, with_tracer_provider, Config,
    Filter, ServerTracer, ServerTracerProvider, SharedPropagator, SharedTracerProvider,
    SpanAttributes, TraceOption,
};
pub use helper::{inject_trace_context, GlobalPropagator};
pub use traces::http::{OtelTrace, OtelTraceLayer, ResponseFuture};

use opentelemetry::trace::TraceContextExt;

/// Extract the current OTEL trace id. This can be used to report the trace id to clients
/// to better trace further problems for specifics requests encounterd by your API consumers
pub fn get_current_otel_trace_id() -> Option<String> {
    let context = opentelemetry::Context::current();
    let span = context.span();
    let span_context = span.span_context();
    span_context
        .is_valid()
        .then(|| span_context.trace_id().to_string())
}
