use crate::{
    agent::client::ClientError,
    config::AgentConfig,
};
use opentelemetry::{
    KeyValue,
    trace::TracerProvider,
};
use opentelemetry_otlp::{
    WithExportConfig,
    WithHttpConfig,
};
use opentelemetry_sdk::{
    Resource,
    trace::{
        Sampler,
        SdkTracerProvider,
        SpanExporter,
        Tracer,
    },
};
use opentelemetry_semantic_conventions::{
    SCHEMA_URL,
    attribute::{
        DEPLOYMENT_ENVIRONMENT_NAME,
        SERVICE_NAME,
        SERVICE_VERSION,
    },
};
use std::{
    collections::HashMap,
    sync::atomic::{
        AtomicBool,
        Ordering,
    },
};
use url::Url;

/// Path under the server URL that accepts OTLP/HTTP traces.
const TRACES_PATH: &str = "v1/traces";

/// Drop guard for the tracer provider. Shuts the provider down when dropped,
/// unless [`OtelGuard::shutdown`] already did.
#[derive(Debug)]
pub struct OtelGuard {
    provider: SdkTracerProvider,
    closed: AtomicBool,
}

impl OtelGuard {
    /// Wrap an already configured provider.
    pub const fn new(provider: SdkTracerProvider) -> Self {
        Self {
            provider,
            closed: AtomicBool::new(false),
        }
    }

    /// Build the provider for `config`, exporting over OTLP/HTTP in batches.
    ///
    /// When the config is inactive no exporter is installed and nothing is
    /// sampled.
    pub fn install(config: &AgentConfig) -> Result<Self, ClientError> {
        let builder = SdkTracerProvider::builder()
            .with_resource(resource(config))
            .with_sampler(sampler(config));

        if !config.active {
            return Ok(Self::new(builder.build()));
        }

        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(traces_endpoint(&config.server_url)?.as_str())
            .with_timeout(config.server_timeout)
            .with_headers(auth_headers(config))
            .build()?;

        Ok(Self::new(builder.with_batch_exporter(exporter).build()))
    }

    /// Build a provider for `config` that hands every finished span to
    /// `exporter` synchronously.
    pub fn with_exporter<E>(config: &AgentConfig, exporter: E) -> Self
    where
        E: SpanExporter + 'static,
    {
        let provider = SdkTracerProvider::builder()
            .with_resource(resource(config))
            .with_sampler(sampler(config))
            .with_simple_exporter(exporter)
            .build();
        Self::new(provider)
    }

    /// Get a tracer from the provider.
    pub fn tracer(&self) -> Tracer {
        self.provider.tracer(env!("CARGO_PKG_NAME"))
    }

    /// Whether [`OtelGuard::shutdown`] has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Export everything buffered so far.
    pub fn flush(&self) -> Result<(), ClientError> {
        self.provider.force_flush().map_err(ClientError::Flush)
    }

    /// Flush and shut the provider down. Later calls do nothing.
    pub fn shutdown(&self) -> Result<(), ClientError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.provider.shutdown().map_err(ClientError::Shutdown)
    }
}

impl Drop for OtelGuard {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            eprintln!("{err:?}");
        }
    }
}

/// The OTLP/HTTP traces endpoint under the APM server URL.
pub fn traces_endpoint(server_url: &Url) -> Result<Url, url::ParseError> {
    if server_url.path().ends_with('/') {
        server_url.join(TRACES_PATH)
    } else {
        let mut base = server_url.clone();
        base.set_path(&format!("{}/", server_url.path()));
        base.join(TRACES_PATH)
    }
}

fn auth_headers(config: &AgentConfig) -> HashMap<String, String> {
    config
        .secret_token
        .iter()
        .map(|token| ("Authorization".to_string(), format!("Bearer {token}")))
        .collect()
}

fn sampler(config: &AgentConfig) -> Sampler {
    if config.active {
        Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
            config.transaction_sample_rate,
        )))
    } else {
        Sampler::AlwaysOff
    }
}

/// Detected resource overlaid with the configured service. Detected values
/// take precedence in `with_schema_url`, so the service name is set after it.
fn resource(config: &AgentConfig) -> Resource {
    Resource::builder()
        .with_schema_url(
            [
                KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
                KeyValue::new(DEPLOYMENT_ENVIRONMENT_NAME, config.environment.clone()),
            ],
            SCHEMA_URL,
        )
        .with_service_name(config.service_name.clone())
        .build()
}
