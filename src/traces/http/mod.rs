pub mod extractors;
mod service;

pub use service::{
    OtelTrace, OtelTraceLayer, ResponseFuture, INSTRUMENTATION_NAME, INSTRUMENTATION_VERSION,
};
