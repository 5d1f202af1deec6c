use crate::helper::GlobalPropagator;
use core::fmt;
use http::request::Parts;
use opentelemetry::{
    propagation::TextMapPropagator,
    trace::{SpanBuilder, TraceContextExt, Tracer, TracerProvider},
    Context, InstrumentationScope,
};
use std::sync::Arc;

pub type SpanAttributes = fn(&Parts) -> Vec<(&'static str, &'static str)>;
pub type Filter = fn(&Parts) -> bool;
pub type SharedPropagator = Arc<dyn TextMapPropagator + Send + Sync>;
pub type SharedTracerProvider = Arc<dyn ServerTracerProvider>;

/// Object safe view of an OpenTelemetry [`Tracer`].
///
/// The span created is returned inside a new [`Context`] built on top of the parent one,
/// so callers only ever handle it through [`TraceContextExt::span`].
pub trait ServerTracer: Send + Sync {
    fn start_with_context(&self, builder: SpanBuilder, parent_cx: &Context) -> Context;
}

impl<T> ServerTracer for T
where
    T: Tracer + Send + Sync,
    T::Span: Send + Sync + 'static,
{
    fn start_with_context(&self, builder: SpanBuilder, parent_cx: &Context) -> Context {
        let span = self.build_with_context(builder, parent_cx);
        parent_cx.with_span(span)
    }
}

/// Object safe view of an OpenTelemetry [`TracerProvider`].
///
/// Implemented for every provider whose tracers and spans can be shared between threads,
/// which covers `opentelemetry_sdk::trace::SdkTracerProvider` and the global provider.
pub trait ServerTracerProvider: Send + Sync {
    fn server_tracer(&self, scope: InstrumentationScope) -> Box<dyn ServerTracer>;
}

impl<P> ServerTracerProvider for P
where
    P: TracerProvider + Send + Sync,
    P::Tracer: Send + Sync + 'static,
    <P::Tracer as Tracer>::Span: Send + Sync + 'static,
{
    fn server_tracer(&self, scope: InstrumentationScope) -> Box<dyn ServerTracer> {
        Box::new(self.tracer_with_scope(scope))
    }
}

/// Settings frozen when the layer is built.
#[derive(Clone)]
pub struct Config {
    pub(crate) tracer_provider: SharedTracerProvider,
    pub(crate) propagator: SharedPropagator,
    pub(crate) filter: Filter,
    pub(crate) span_attributes: SpanAttributes,
}

impl Config {
    /// Resolve the options against the process wide tracer provider and propagator.
    pub fn new(options: impl IntoIterator<Item = TraceOption>) -> Self {
        resolve(
            Arc::new(opentelemetry::global::tracer_provider()),
            Arc::new(GlobalPropagator),
            options,
        )
    }

    pub fn propagator(&self) -> &(dyn TextMapPropagator + Send + Sync) {
        self.propagator.as_ref()
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("tracer_provider", &"<provider>")
            .field("propagator", &self.propagator)
            .field("filter", &"<fn>")
            .field("span_attributes", &"<fn>")
            .finish()
    }
}

/// Build a [`Config`] by applying `options` in order on top of the given defaults.
///
/// The last option touching a field wins.
pub fn resolve(
    default_tracer_provider: SharedTracerProvider,
    default_propagator: SharedPropagator,
    options: impl IntoIterator<Item = TraceOption>,
) -> Config {
    let config = Config {
        tracer_provider: default_tracer_provider,
        propagator: default_propagator,
        filter: |_req: &Parts| true,
        span_attributes: |_req: &Parts| Vec::new(),
    };
    options
        .into_iter()
        .fold(config, |config, option| option.apply(config))
}

/// A deferred change to a [`Config`].
#[derive(Clone)]
pub enum TraceOption {
    TracerProvider(SharedTracerProvider),
    Propagators(SharedPropagator),
    /// Choose to record or not the incoming HTTP request based on his [`http::request::Parts`].
    Filter(Filter),
    /// Additional static attributes recorded on the server span at its creation.
    SpanAttributes(SpanAttributes),
}

impl TraceOption {
    pub fn apply(self, config: Config) -> Config {
        match self {
            TraceOption::TracerProvider(tracer_provider) => Config {
                tracer_provider,
                ..config
            },
            TraceOption::Propagators(propagator) => Config {
                propagator,
                ..config
            },
            TraceOption::Filter(filter) => Config { filter, ..config },
            TraceOption::SpanAttributes(span_attributes) => Config {
                span_attributes,
                ..config
            },
        }
    }
}

impl fmt::Debug for TraceOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceOption::TracerProvider(_) => f.write_str("TracerProvider(<provider>)"),
            TraceOption::Propagators(propagator) => {
                f.debug_tuple("Propagators").field(propagator).finish()
            }
            TraceOption::Filter(_) => f.write_str("Filter(<fn>)"),
            TraceOption::SpanAttributes(_) => f.write_str("SpanAttributes(<fn>)"),
        }
    }
}

/// Use this tracer provider instead of the global one when creating the tracer.
pub fn with_tracer_provider<P>(tracer_provider: P) -> TraceOption
where
    P: ServerTracerProvider + 'static,
{
    TraceOption::TracerProvider(Arc::new(tracer_provider))
}

/// Use this propagator instead of the global one when extracting and injecting
/// trace context from HTTP headers.
pub fn with_propagators<P>(propagator: P) -> TraceOption
where
    P: TextMapPropagator + Send + Sync + 'static,
{
    TraceOption::Propagators(Arc::new(propagator))
}

pub fn with_filter(filter: Filter) -> TraceOption {
    TraceOption::Filter(filter)
}

pub fn with_span_attributes(span_attributes: SpanAttributes) -> TraceOption {
    TraceOption::SpanAttributes(span_attributes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;
    use opentelemetry::propagation::TextMapCompositePropagator;
    use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};

    fn parts(uri: &str) -> Parts {
        Request::builder().uri(uri).body(()).unwrap().into_parts().0
    }

    fn fields(config: &Config) -> Vec<String> {
        config.propagator().fields().map(ToOwned::to_owned).collect()
    }

    #[test]
    fn test_defaults_are_kept_without_options() {
        let config = Config::new(Vec::new());

        assert!((config.filter)(&parts("/health")));
        assert!((config.span_attributes)(&parts("/health")).is_empty());
        assert!(format!("{config:?}").contains("GlobalPropagator"));
    }

    #[test]
    fn test_propagator_option_overrides_default() {
        let config = Config::new([with_propagators(TraceContextPropagator::new())]);

        assert_eq!(fields(&config), vec!["traceparent", "tracestate"]);
    }

    #[test]
    fn test_last_option_wins() {
        let composite = TextMapCompositePropagator::new(vec![
            Box::new(BaggagePropagator::new()),
            Box::new(TraceContextPropagator::new()),
        ]);
        let config = Config::new([
            with_propagators(composite),
            with_filter(|_req: &Parts| false),
            with_propagators(BaggagePropagator::new()),
            with_filter(|req: &Parts| req.uri.path() != "/health"),
        ]);

        assert_eq!(fields(&config), vec!["baggage"]);
        assert!(!(config.filter)(&parts("/health")));
        assert!((config.filter)(&parts("/user/123")));
    }

    #[test]
    fn test_options_touch_only_their_field() {
        let config = resolve(
            Arc::new(opentelemetry::global::tracer_provider()),
            Arc::new(TraceContextPropagator::new()),
            [with_span_attributes(|_req: &Parts| vec![("team", "search")])],
        );

        assert_eq!(fields(&config), vec!["traceparent", "tracestate"]);
        assert_eq!(
            (config.span_attributes)(&parts("/")),
            vec![("team", "search")]
        );
        assert!((config.filter)(&parts("/")));
    }
}
