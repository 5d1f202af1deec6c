use super::extractors::{
    end_user_attributes_from_request, http_attributes_from_status_code,
    http_server_attributes_from_request, matched_route, net_attributes_from_request,
    span_name_from_request, span_status_from_status_code,
};
use crate::config::{Config, ServerTracer, TraceOption};
use crate::helper::inject_trace_context;
use core::fmt;
use http::{Request, Response};
use opentelemetry::{
    trace::{SpanBuilder, SpanKind, Status, TraceContextExt},
    Context as OtelContext, ContextGuard, InstrumentationScope, KeyValue,
};
use opentelemetry_http::HeaderExtractor;
use opentelemetry_semantic_conventions::trace::ERROR_TYPE;
use pin_project_lite::pin_project;
use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
};
use tower::{Layer, Service};
use tracing::{debug, trace};

/// Name of the instrumentation scope of every span created by [`OtelTrace`].
pub const INSTRUMENTATION_NAME: &str = env!("CARGO_PKG_NAME");
/// Version of the instrumentation scope of every span created by [`OtelTrace`].
pub const INSTRUMENTATION_VERSION: &str = env!("CARGO_PKG_VERSION");

struct Instrumentation {
    service_name: String,
    config: Config,
    tracer: Box<dyn ServerTracer>,
}

impl fmt::Debug for Instrumentation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instrumentation")
            .field("service_name", &self.service_name)
            .field("config", &self.config)
            .field("tracer", &"<tracer>")
            .finish()
    }
}

/// Add OTEL traces instrumentation to your axum app.
/// It extract informations from the incoming HTTP request to create a server span according to the
/// [OTEL specification](https://opentelemetry.io/docs/specs/semconv/http/http-spans/#http-server)
///
/// The tracer and the propagator are resolved once, when the layer is built:
///
/// ```no_run
/// use axum::{routing::get, Router};
/// use opentelemetry_sdk::{propagation::TraceContextPropagator, trace::SdkTracerProvider};
/// use tower_otel_trace::{with_propagators, with_tracer_provider, OtelTraceLayer};
///
/// let provider = SdkTracerProvider::builder().build();
/// let app: Router = Router::new()
///     .route("/user/{id}", get(|| async { "ok" }))
///     .layer(OtelTraceLayer::new(
///         "users",
///         [
///             with_tracer_provider(provider),
///             with_propagators(TraceContextPropagator::new()),
///         ],
///     ));
/// ```
///
/// Fields populated by default:
///
/// - network.transport
/// - network.protocol.name
/// - network.protocol.version
/// - server.address
/// - server.port
/// - client.address
/// - client.port
/// - enduser.id
/// - http.server_name
/// - http.request.method
/// - http.route
/// - url.scheme
/// - url.path
/// - url.query
/// - user_agent.original
/// - http.response.status_code
/// - error.type
#[derive(Clone, Debug)]
pub struct OtelTraceLayer {
    instrumentation: Arc<Instrumentation>,
}

impl OtelTraceLayer {
    pub fn new(
        service_name: impl Into<String>,
        options: impl IntoIterator<Item = TraceOption>,
    ) -> Self {
        Self::from_config(service_name, Config::new(options))
    }

    /// Build the layer from an already resolved [`Config`], see [`crate::resolve`].
    pub fn from_config(service_name: impl Into<String>, config: Config) -> Self {
        let scope = InstrumentationScope::builder(INSTRUMENTATION_NAME)
            .with_version(INSTRUMENTATION_VERSION)
            .build();
        let tracer = config.tracer_provider.server_tracer(scope);

        OtelTraceLayer {
            instrumentation: Arc::new(Instrumentation {
                service_name: service_name.into(),
                config,
                tracer,
            }),
        }
    }
}

impl<S> Layer<S> for OtelTraceLayer {
    type Service = OtelTrace<S>;
    fn layer(&self, inner: S) -> Self::Service {
        OtelTrace {
            inner,
            instrumentation: self.instrumentation.clone(),
        }
    }
}

/// Service created by [`OtelTraceLayer`], one server span per traced request.
#[derive(Clone, Debug)]
pub struct OtelTrace<S> {
    inner: S,
    instrumentation: Arc<Instrumentation>,
}

impl<S> OtelTrace<S> {
    pub fn new(
        inner: S,
        service_name: impl Into<String>,
        options: impl IntoIterator<Item = TraceOption>,
    ) -> Self {
        OtelTraceLayer::new(service_name, options).layer(inner)
    }
}

impl<S, B, B2> Service<Request<B>> for OtelTrace<S>
where
    S: Service<Request<B>, Response = Response<B2>>,
    S::Error: fmt::Display,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        let (mut parts, body) = request.into_parts();
        let instrumentation = &self.instrumentation;
        let config = &instrumentation.config;

        if !(config.filter)(&parts) {
            debug!(method = %parts.method, uri = %parts.uri, "request not traced");
            return ResponseFuture {
                inner: self.inner.call(Request::from_parts(parts, body)),
                span: None,
                instrumentation: instrumentation.clone(),
            };
        }

        // An outer layer may already have placed a context in the request
        let saved_context = parts
            .extensions
            .get::<OtelContext>()
            .cloned()
            .unwrap_or_else(OtelContext::current);
        let parent_context = config
            .propagator
            .extract_with_context(&saved_context, &HeaderExtractor(&parts.headers));

        let route = matched_route(&parts).unwrap_or_default();
        let mut attributes = net_attributes_from_request("tcp", &parts);
        attributes.extend(end_user_attributes_from_request(&parts));
        attributes.extend(http_server_attributes_from_request(
            &instrumentation.service_name,
            route,
            &parts,
        ));
        attributes.extend(
            (config.span_attributes)(&parts)
                .into_iter()
                .map(|(key, value)| KeyValue::new(key, value)),
        );

        let span_name = span_name_from_request(&parts);
        trace!(span.name = %span_name, "starting server span");
        let builder = SpanBuilder::from_name(span_name)
            .with_kind(SpanKind::Server)
            .with_attributes(attributes);
        let span = SpanGuard::new(
            instrumentation
                .tracer
                .start_with_context(builder, &parent_context),
        );

        // The downstream handlers see the new span both in the extensions and as current context
        parts.extensions.insert(span.context().clone());
        let inner = {
            let _entered = span.enter();
            self.inner.call(Request::from_parts(parts, body))
        };

        ResponseFuture {
            inner,
            span: Some(span),
            instrumentation: instrumentation.clone(),
        }
    }
}

pin_project! {
    /// [`OtelTrace`] response future
    ///
    /// [`OtelTrace`]: crate::traces::http::OtelTrace
    #[derive(Debug)]
    pub struct ResponseFuture<F> {
        #[pin]
        inner: F,
        span: Option<SpanGuard>,
        instrumentation: Arc<Instrumentation>,
    }
}

impl<F, B, E> Future for ResponseFuture<F>
where
    F: Future<Output = Result<Response<B>, E>>,
    E: fmt::Display,
{
    type Output = Result<Response<B>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        let mut result = {
            let _entered = this.span.as_ref().map(SpanGuard::enter);
            ready!(this.inner.poll(cx))
        };

        // Dropping the guard at the end of this scope ends the span
        if let Some(span) = this.span.take() {
            match &mut result {
                Ok(response) => {
                    span.record_response(response, &this.instrumentation.config);
                }
                Err(err) => span.record_error(&*err),
            }
        }

        Poll::Ready(result)
    }
}

/// Owns the context carrying the server span and ends the span when dropped,
/// whatever the way the request finished (response, error, panic or cancellation).
/// A panic of the downstream service is recorded by [`Entered`].
#[derive(Debug)]
struct SpanGuard {
    cx: OtelContext,
}

impl SpanGuard {
    fn new(cx: OtelContext) -> Self {
        SpanGuard { cx }
    }

    fn context(&self) -> &OtelContext {
        &self.cx
    }

    /// Attach the span context as the current one until the returned value is dropped.
    fn enter(&self) -> Entered<'_> {
        Entered {
            cx: &self.cx,
            _guard: self.cx.clone().attach(),
        }
    }

    fn record_response<B>(&self, response: &mut Response<B>, config: &Config) {
        let span = self.cx.span();
        let status_code = response.status().as_u16();
        span.set_attributes(http_attributes_from_status_code(status_code));
        span.set_status(span_status_from_status_code(status_code));

        inject_trace_context(&self.cx, config.propagator(), response.headers_mut());
    }

    fn record_error(&self, error: &impl fmt::Display) {
        let span = self.cx.span();
        span.set_attribute(KeyValue::new(ERROR_TYPE, "_OTHER"));
        span.set_status(Status::error(error.to_string()));
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        self.cx.span().end();
        trace!("server span ended");
    }
}

/// Scope during which the server span context is the current one.
/// The previous context is restored on drop, including while unwinding.
struct Entered<'a> {
    cx: &'a OtelContext,
    _guard: ContextGuard,
}

impl Drop for Entered<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.cx.span().set_status(Status::error("panicked"));
        }
    }
}
