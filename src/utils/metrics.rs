use crate::utils::from_env::{
    EnvItemInfo,
    FromEnv,
    FromEnvErr,
    FromEnvVar,
};
use metrics_exporter_prometheus::{
    BuildError,
    PrometheusBuilder,
};
use tracing::warn;

/// Metrics port env var
const TRACING_METRICS_PORT: &str = "TRACING_METRICS_PORT";

/// Prometheus exporter configuration.
///
/// The exporter is opt-in: a smoke run is short-lived, so nothing is served
/// unless `TRACING_METRICS_PORT` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct MetricsConfig {
    /// `TRACING_METRICS_PORT` - The port on which to bind the metrics server.
    pub port: u16,
}

impl From<u16> for MetricsConfig {
    fn from(port: u16) -> Self {
        Self { port }
    }
}

impl FromEnv for MetricsConfig {
    type Error = std::num::ParseIntError;

    fn inventory() -> Vec<&'static EnvItemInfo> {
        vec![&EnvItemInfo {
            var: TRACING_METRICS_PORT,
            description: "Port on which to serve Prometheus metrics, u16. Unset disables the exporter",
            optional: true,
        }]
    }

    fn from_env() -> Result<Self, FromEnvErr<Self::Error>> {
        u16::from_env_var(TRACING_METRICS_PORT).map(Self::from)
    }
}

impl MetricsConfig {
    /// Load from env vars. [`None`] if the port is unset. A malformed port
    /// is logged and also disables the exporter.
    pub fn load() -> Option<Self> {
        match Self::from_env() {
            Ok(cfg) => Some(cfg),
            Err(err) if err.is_absent() => None,
            Err(err) => {
                warn!(%err, var = TRACING_METRICS_PORT, "metrics exporter disabled");
                None
            }
        }
    }
}

/// Install a [`metrics_exporter_prometheus`] recorder serving on
/// `0.0.0.0:<port>`.
pub fn init_metrics(cfg: MetricsConfig) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], cfg.port))
        .install()
}

#[cfg(test)]
mod test {
    use super::*;
    use std::{
        io,
        sync::{
            Arc,
            Mutex,
        },
    };

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn load_logged() -> (Option<MetricsConfig>, String) {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let cfg = tracing::subscriber::with_default(subscriber, MetricsConfig::load);
        let logs = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        (cfg, logs)
    }

    #[test]
    #[serial_test::serial]
    fn disabled_without_port() {
        unsafe { std::env::remove_var(TRACING_METRICS_PORT) };
        assert!(MetricsConfig::load().is_none());
    }

    #[test]
    #[serial_test::serial]
    fn reads_port() {
        unsafe { std::env::set_var(TRACING_METRICS_PORT, "9464") };
        let cfg = MetricsConfig::load();
        unsafe { std::env::remove_var(TRACING_METRICS_PORT) };
        assert_eq!(cfg, Some(MetricsConfig { port: 9464 }));
    }

    #[test]
    #[serial_test::serial]
    fn malformed_port_is_logged() {
        unsafe { std::env::set_var(TRACING_METRICS_PORT, "ninety") };
        let (cfg, logs) = load_logged();
        unsafe { std::env::remove_var(TRACING_METRICS_PORT) };

        assert!(cfg.is_none());
        assert!(logs.contains("WARN"), "{logs}");
        assert!(logs.contains("metrics exporter disabled"), "{logs}");

        unsafe { std::env::remove_var(TRACING_METRICS_PORT) };
        let (cfg, logs) = load_logged();
        assert!(cfg.is_none());
        assert!(logs.is_empty(), "{logs}");
    }
}
