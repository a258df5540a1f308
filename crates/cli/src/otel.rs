use opentelemetry::{
    KeyValue, global,
    propagation::TextMapCompositePropagator,
    trace::{Tracer, TracerProvider, noop::NoopTracer},
};
use opentelemetry_otlp::{
    OTEL_EXPORTER_OTLP_ENDPOINT, OTEL_EXPORTER_OTLP_PROTOCOL, OTEL_EXPORTER_OTLP_TRACES_ENDPOINT,
    WithExportConfig,
};
use opentelemetry_sdk::{
    Resource,
    propagation::{BaggagePropagator, TraceContextPropagator},
    runtime,
    trace::{RandomIdGenerator, Sampler, span_processor_with_async_runtime::BatchSpanProcessor},
};
use opentelemetry_semantic_conventions::resource;
use tracing::{Level, Subscriber, level_filters::LevelFilter};
use tracing_subscriber::{
    Layer, filter::FilterFn, layer::SubscriberExt, registry::LookupSpan, util::SubscriberInitExt,
};

const SERVICE_NAME: &str = "agora";

fn get_env_var(names: &[&'static str]) -> Option<String> {
    names.iter().find_map(|name| std::env::var(name).ok())
}

pub fn init_tracing() -> anyhow::Result<ProviderGuard> {
    let provider = if get_env_var(&[
        OTEL_EXPORTER_OTLP_TRACES_ENDPOINT,
        OTEL_EXPORTER_OTLP_ENDPOINT,
    ])
    .is_some()
    {
        global::set_text_map_propagator(TextMapCompositePropagator::new(vec![
            Box::new(TraceContextPropagator::new()),
            Box::new(BaggagePropagator::new()),
        ]));

        let protocol = get_env_var(&[
            "OTEL_EXPORTER_OTLP_TRACES_PROTOCOL",
            OTEL_EXPORTER_OTLP_PROTOCOL,
        ])
        .unwrap_or_default();

        let exporter = match protocol.as_str() {
            "http/json" => opentelemetry_otlp::SpanExporter::builder()
                .with_http()
                .with_protocol(opentelemetry_otlp::Protocol::HttpJson)
                .build(),
            _ => opentelemetry_otlp::SpanExporter::builder()
                .with_http()
                .with_protocol(opentelemetry_otlp::Protocol::HttpBinary)
                .build(),
        }?;

        let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
            .with_span_processor(BatchSpanProcessor::builder(exporter, runtime::Tokio).build())
            .with_sampler(Sampler::ParentBased(Box::new(Sampler::AlwaysOn)))
            .with_id_generator(RandomIdGenerator::default())
            .with_resource(
                Resource::builder()
                    .with_attribute(KeyValue::new(resource::SERVICE_NAME, SERVICE_NAME))
                    .build(),
            )
            .build();

        global::set_tracer_provider(provider.clone());
        Some(provider)
    } else {
        None
    };

    let envfilter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env()?
        .add_directive("hyper_util=warn".parse()?)
        .add_directive("reqwest=warn".parse()?);

    let registry = tracing_subscriber::Registry::default().with(
        tracing_subscriber::fmt::Layer::default()
            .with_writer(std::io::stderr)
            .with_filter(envfilter),
    );

    match &provider {
        Some(provider) => registry
            .with(otel_layer(provider.tracer(SERVICE_NAME)))
            .init(),
        None => registry.with(otel_layer(NoopTracer::new())).init(),
    }

    Ok(ProviderGuard(provider))
}

fn otel_layer<S, T>(tracer: T) -> impl Layer<S>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
    T: Tracer + 'static,
    T::Span: Send + Sync,
{
    tracing_opentelemetry::OpenTelemetryLayer::new(tracer)
        .with_location(false)
        .with_tracked_inactivity(false)
        .with_threads(false)
        .with_filter(FilterFn::new(|metadata| {
            *metadata.level() <= LevelFilter::INFO && metadata.target().starts_with("agora::")
        }))
}

pub struct ProviderGuard(Option<opentelemetry_sdk::trace::SdkTracerProvider>);

impl Drop for ProviderGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.0.take() {
            let _ = provider.shutdown();
        }
    }
}
