use axum::{extract::Path, http::request::Parts, routing::get, Router};
use opentelemetry::{trace::TracerProvider, KeyValue};
use opentelemetry_sdk::{propagation::TraceContextPropagator, trace::SdkTracerProvider, Resource};
use std::{error::Error, net::SocketAddr};
use tokio::net::TcpListener;
use tower_otel_trace::{
    get_current_otel_trace_id, with_filter, with_propagators, with_tracer_provider,
    OtelTraceLayer,
};
use tracing::{info, instrument};
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync + 'static>> {
    let provider = SdkTracerProvider::builder()
        .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
        .with_resource(
            Resource::builder()
                .with_attribute(KeyValue::new("service.name", "users"))
                .build(),
        )
        .build();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let otel_layer = tracing_opentelemetry::layer().with_tracer(provider.tracer("users"));
    let subscriber = Registry::default()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(otel_layer);
    tracing::subscriber::set_global_default(subscriber)?;

    let app = Router::new()
        .route("/user/{id}", get(user))
        .route("/health", get(|| async { "ok" }))
        .layer(OtelTraceLayer::new(
            "users",
            [
                with_tracer_provider(provider.clone()),
                with_propagators(TraceContextPropagator::new()),
                with_filter(|req: &Parts| req.uri.path() != "/health"),
            ],
        ));

    let addr: SocketAddr = ([127, 0, 0, 1], 3000).into();
    let listener = TcpListener::bind(addr).await?;
    info!("Axum listening on {:?}", listener.local_addr()?);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;

    provider.shutdown()?;
    Ok(())
}

async fn user(Path(id): Path<String>) -> String {
    let name = load_user(&id).await;
    format!("Hello {name}, trace {:?}", get_current_otel_trace_id())
}

#[instrument]
async fn load_user(id: &str) -> String {
    info!("loading user");
    format!("user-{id}")
}
