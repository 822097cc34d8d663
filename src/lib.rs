//! # `apm-smoke`
//!
//! Drives a tracing client through a fixed, observable scenario: a successful
//! transaction with a database span, a transaction that captures an error, a
//! request transaction with an outbound HTTP span, and a round of custom
//! context and labels. Then it waits for the data to drain and exits.
//!
//! The client is explicit. [`agent::otel::OtelClient`] ships everything to an
//! APM server over OTLP; [`agent::memory::MemoryClient`] records calls so a
//! harness can assert on them.
//!
//! ```no_run
//! use apm_smoke::{
//!     agent::otel::OtelClient,
//!     config::DemoConfig,
//!     runner::DemoRunner,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DemoConfig::default();
//! let client = OtelClient::new(&config.agent)?;
//! let outcome = DemoRunner::new(&client, config.pacing).run().await;
//! assert!(outcome.is_completed());
//! # Ok(())
//! # }
//! ```

#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    unreachable_pub,
    clippy::missing_const_for_fn,
    rustdoc::all
)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

/// Tracing client abstraction and backends.
pub mod agent {
    /// [`TracingClient`](client::TracingClient) and the handle traits.
    pub mod client;

    /// Custom context and labels.
    pub mod context;

    pub mod memory;

    pub mod otel;
}

/// Environment configuration.
pub mod config;

pub mod runner;

pub mod scenario;

/// Shared utilities.
pub mod utils {
    /// Prometheus metrics utilities.
    pub mod metrics;

    /// OpenTelemetry provider utilities.
    pub mod otlp;

    /// [`FromEnv`], [`FromEnvVar`] traits and related utilities.
    ///
    /// [`FromEnv`]: from_env::FromEnv
    /// [`FromEnvVar`]: from_env::FromEnvVar
    pub mod from_env;

    /// Console logging utilities.
    pub mod tracing;
}

/// Re-exports of common dependencies.
pub mod deps {
    pub use metrics;
    pub use opentelemetry;
    pub use opentelemetry_otlp;
    pub use opentelemetry_sdk;
    pub use tracing;
    pub use tracing_subscriber;
}

use crate::{
    agent::{
        client::ClientError,
        otel::OtelClient,
    },
    config::DemoConfig,
    utils::metrics::MetricsConfig,
};

/// Init logging and metrics, and build the OTLP tracing client.
///
/// This will perform the following:
/// - Install a global console subscriber at the configured log level, also
///   writing to journald with the `journald` feature
/// - Install a Prometheus recorder if `TRACING_METRICS_PORT` is set
/// - Build an [`OtelClient`] for `config.agent`
///
/// See [`init_tracing`] and [`init_metrics`] for the env vars read.
///
/// # Panics
///
/// If a global tracing subscriber has already been set, or, with the
/// `journald` feature, if the journald socket cannot be opened.
///
/// [`init_tracing`]: utils::tracing::init_tracing
/// [`init_metrics`]: utils::metrics::init_metrics
pub fn trace(config: &DemoConfig) -> Result<OtelClient, ClientError> {
    #[cfg(not(feature = "journald"))]
    utils::tracing::init_tracing(config.agent.log_level);
    #[cfg(feature = "journald")]
    utils::tracing::init_tracing_with_journald(config.agent.log_level);

    if let Some(metrics) = MetricsConfig::load() {
        match utils::metrics::init_metrics(metrics) {
            Ok(()) => ::tracing::info!(port = metrics.port, "serving Prometheus metrics"),
            Err(err) => ::tracing::warn!(%err, "failed to install Prometheus exporter"),
        }
    }

    OtelClient::new(&config.agent)
}
