//! Provides helper functions for initializing telemetry collection and publication.
use anyhow::{anyhow, Result};
use clap::ValueEnum;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace, Resource};
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter, Layer, Registry};

/// Output format of the log lines written by the fmt layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Single line, human readable
    #[default]
    Compact,
    /// One JSON object per line
    Json,
}

fn env_filter() -> Result<EnvFilter> {
    // Default to INFO if no env is specified
    Ok(EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?)
}

fn hostname() -> Result<String> {
    gethostname::gethostname()
        .into_string()
        .map_err(|name| anyhow!("hostname is not valid utf-8: {name:?}"))
}

/// Initialize tracing.
///
/// Log lines always go to stdout. When an OTLP endpoint is given, spans are also exported to
/// it in batches on the tokio runtime.
pub async fn init(otlp_endpoint: Option<String>, format: LogFormat) -> Result<()> {
    let logger = match format {
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .with_ansi(true)
            .compact()
            .with_filter(env_filter()?)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_filter(env_filter()?)
            .boxed(),
    };

    let telemetry = match otlp_endpoint {
        Some(endpoint) => {
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .tonic()
                        .with_endpoint(endpoint),
                )
                .with_trace_config(trace::config().with_resource(Resource::new(vec![
                    KeyValue::new("hostname", hostname()?),
                    KeyValue::new("service.name", "rook"),
                ])))
                .install_batch(runtime::Tokio)?;
            Some(
                tracing_opentelemetry::layer()
                    .with_tracer(tracer)
                    .with_filter(env_filter()?),
            )
        }
        None => None,
    };

    let collector = Registry::default().with(telemetry).with(logger);

    #[cfg(feature = "tokio-console")]
    let collector = {
        let console_filter = EnvFilter::builder().parse("tokio=trace,runtime=trace")?;
        let console_layer = console_subscriber::spawn().with_filter(console_filter);
        collector.with(console_layer)
    };

    // Also installs the bridge for crates that still emit through `log`.
    collector.try_init()?;

    Ok(())
}

/// Initialize logging for short lived processes whose stdout is reserved for their result.
///
/// Everything is written to stderr and nothing is exported.
pub fn init_stderr() -> Result<()> {
    let logger = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .compact()
        .with_writer(std::io::stderr)
        .with_filter(env_filter()?);
    Registry::default().with(logger).try_init()?;
    Ok(())
}

/// Flush any spans that are still buffered for export.
pub fn shutdown() {
    opentelemetry::global::shutdown_tracer_provider();
}
