//! Global subscriber setup for the Loomflow binaries: an env-filtered fmt
//! layer, optionally bridged to an OpenTelemetry stdout exporter.
//!
//! # Usage
//!
//! ```no_run
//! use loomflow_observe::{TracingOptions, init_tracing};
//!
//! // Human-readable logs at `warn`
//! init_tracing(&TracingOptions::default()).unwrap();
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use std::sync::OnceLock;

/// Kept so `shutdown_tracing` can flush spans before the process exits.
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// How the global subscriber is assembled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingOptions {
    /// Filter used when `RUST_LOG` is unset, e.g. `loomflow_core=debug`.
    pub default_directive: String,
    /// One JSON object per event instead of the pretty format.
    pub json: bool,
    /// Bridge spans to OpenTelemetry with a stdout exporter.
    pub otel: bool,
}

impl Default for TracingOptions {
    fn default() -> Self {
        Self::from_verbosity(0)
    }
}

impl TracingOptions {
    /// Map `-v` counts to a default filter: 0 = warn, 1 = info, 2 = debug,
    /// 3+ = trace. Engine crates are raised, dependencies stay at `warn`.
    pub fn from_verbosity(verbose: u8) -> Self {
        let level = match verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        Self {
            default_directive: format!("warn,loomflow_core={level},loomflow_cli={level}"),
            json: false,
            otel: false,
        }
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    pub fn with_otel(mut self, otel: bool) -> Self {
        self.otel = otel;
        self
    }

    /// `RUST_LOG` wins over `default_directive`.
    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_directive))
    }
}

/// Install the process-wide subscriber described by `options`.
///
/// - Always installs a `fmt` layer on stderr (pretty or JSON) with span
///   close timing.
/// - When `otel` is set, additionally bridges tracing spans to
///   OpenTelemetry using a stdout exporter.
///
/// # Errors
///
/// Returns an error if the global subscriber has already been set.
pub fn init_tracing(options: &TracingOptions) -> Result<(), Box<dyn std::error::Error>> {
    let otel_layer = options.otel.then(|| {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer("loomflow");

        // Keep a handle for shutdown, then make it the global provider.
        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);
        tracing_opentelemetry::layer().with_tracer(tracer)
    });

    let registry = tracing_subscriber::registry()
        .with(options.env_filter())
        .with(otel_layer);

    if options.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()?;
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_writer(std::io::stderr)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()?;
    }

    Ok(())
}

/// Flush and stop the span exporter. Does nothing unless `otel` was set.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("warning: failed to flush OpenTelemetry spans: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(
            TracingOptions::default().default_directive,
            "warn,loomflow_core=warn,loomflow_cli=warn"
        );
        assert!(TracingOptions::from_verbosity(2).default_directive.contains("loomflow_core=debug"));
        assert!(TracingOptions::from_verbosity(9).default_directive.ends_with("loomflow_cli=trace"));
    }

    #[test]
    fn test_builders() {
        let options = TracingOptions::from_verbosity(1).with_json(true).with_otel(false);
        assert!(options.json);
        assert!(!options.otel);
    }
}
