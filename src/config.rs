use crate::utils::from_env::{
    EnvItemInfo,
    FromEnv,
    FromEnvErr,
    FromEnvVar,
    parse_env_if_present,
};
use std::{
    num::{
        ParseFloatError,
        ParseIntError,
    },
    str::{
        FromStr,
        ParseBoolError,
    },
    time::Duration,
};
use tracing::level_filters::LevelFilter;
use url::Url;

const SERVICE_NAME: &str = "ELASTIC_APM_SERVICE_NAME";
const SECRET_TOKEN: &str = "ELASTIC_APM_SECRET_TOKEN";
const SERVER_URL: &str = "ELASTIC_APM_SERVER_URL";
const ENVIRONMENT: &str = "ELASTIC_APM_ENVIRONMENT";
const ACTIVE: &str = "ELASTIC_APM_ACTIVE";
const CAPTURE_BODY: &str = "ELASTIC_APM_CAPTURE_BODY";
const CAPTURE_HEADERS: &str = "ELASTIC_APM_CAPTURE_HEADERS";
const LOG_LEVEL: &str = "ELASTIC_APM_LOG_LEVEL";
const SAMPLE_RATE: &str = "ELASTIC_APM_TRANSACTION_SAMPLE_RATE";
const SERVER_TIMEOUT: &str = "ELASTIC_APM_SERVER_TIMEOUT";

const DASHBOARD_URL: &str = "APM_DEMO_DASHBOARD_URL";
const STRICT_EXIT: &str = "APM_DEMO_STRICT_EXIT";

const DEFAULT_SERVICE_NAME: &str = "test-app";
const DEFAULT_SERVER_URL: &str = "http://localhost:8200";
const DEFAULT_ENVIRONMENT: &str = "test";
const DEFAULT_DASHBOARD_URL: &str = "http://localhost:5601/app/apm";

/// Configuration errors. Variables that are unset or empty fall back to their
/// defaults, so these only report malformed values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A URL variable could not be parsed.
    #[error("invalid URL in {var}: {source}")]
    Url {
        /// Variable name.
        var: &'static str,
        /// Parse failure.
        source: url::ParseError,
    },

    /// A flag variable was not a recognised boolean.
    #[error("invalid flag in {var}: {source}")]
    Flag {
        /// Variable name.
        var: &'static str,
        /// Parse failure.
        source: ParseBoolError,
    },

    /// A millisecond value could not be parsed.
    #[error("invalid duration in {var}: {source}")]
    Millis {
        /// Variable name.
        var: &'static str,
        /// Parse failure.
        source: ParseIntError,
    },

    /// The sample rate could not be parsed.
    #[error("invalid transaction sample rate: {0}")]
    SampleRate(#[from] ParseFloatError),

    /// The sample rate parsed, but lies outside `[0, 1]`.
    #[error("transaction sample rate must be within 0.0 and 1.0, got {0}")]
    SampleRateRange(String),

    /// Unknown body capture policy.
    #[error(transparent)]
    CaptureBody(#[from] UnknownCaptureBody),

    /// Unknown log level.
    #[error("unknown log level {0:?}")]
    LogLevel(String),

    /// A pacing override was malformed.
    #[error(transparent)]
    Pacing(#[from] PacingOverridesEnvError),
}

/// When request bodies are recorded on transactions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CaptureBody {
    /// Never record bodies.
    Off,
    /// Record bodies only for transactions that captured an error.
    #[default]
    Errors,
    /// Record bodies only for transactions without errors.
    Transactions,
    /// Always record bodies.
    All,
}

impl CaptureBody {
    /// Whether a body should be recorded for a transaction.
    pub const fn records(self, errored: bool) -> bool {
        match self {
            Self::Off => false,
            Self::Errors => errored,
            Self::Transactions => !errored,
            Self::All => true,
        }
    }
}

/// Unknown [`CaptureBody`] policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown body capture policy {0:?}, expected one of off, errors, transactions, all")]
pub struct UnknownCaptureBody(String);

impl FromStr for CaptureBody {
    type Err = UnknownCaptureBody;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "errors" => Ok(Self::Errors),
            "transactions" => Ok(Self::Transactions),
            "all" => Ok(Self::All),
            _ => Err(UnknownCaptureBody(s.to_string())),
        }
    }
}

impl FromEnvVar for CaptureBody {
    type Error = UnknownCaptureBody;

    fn from_env_var(env_var: &str) -> Result<Self, FromEnvErr<Self::Error>> {
        parse_env_if_present(env_var)
    }
}

/// Parse a log level, accepting the `warning` and `fatal` spellings used by
/// the APM agents next to the usual `tracing` names.
pub fn parse_log_level(s: &str) -> Result<LevelFilter, ConfigError> {
    match s.trim().to_ascii_lowercase().as_str() {
        "warning" => Ok(LevelFilter::WARN),
        "fatal" | "critical" => Ok(LevelFilter::ERROR),
        other => other
            .parse()
            .map_err(|_| ConfigError::LogLevel(s.to_string())),
    }
}

/// Tracing client configuration, read from the `ELASTIC_APM_*` variables.
///
/// | Variable | Default |
/// |---|---|
/// | `ELASTIC_APM_SERVICE_NAME` | `test-app` |
/// | `ELASTIC_APM_SECRET_TOKEN` | unset |
/// | `ELASTIC_APM_SERVER_URL` | `http://localhost:8200` |
/// | `ELASTIC_APM_ENVIRONMENT` | `test` |
/// | `ELASTIC_APM_ACTIVE` | `true` |
/// | `ELASTIC_APM_CAPTURE_BODY` | `errors` |
/// | `ELASTIC_APM_CAPTURE_HEADERS` | `true` |
/// | `ELASTIC_APM_LOG_LEVEL` | `info` |
/// | `ELASTIC_APM_TRANSACTION_SAMPLE_RATE` | `1.0` |
/// | `ELASTIC_APM_SERVER_TIMEOUT` | `10000` (ms) |
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub struct AgentConfig {
    /// Reported as `service.name`.
    pub service_name: String,
    /// Sent as a bearer token to the collector, if set.
    pub secret_token: Option<String>,
    /// Collector base URL.
    pub server_url: Url,
    /// Reported as `deployment.environment.name`.
    pub environment: String,
    /// When false, nothing is sampled or exported.
    pub active: bool,
    /// Request body capture policy.
    pub capture_body: CaptureBody,
    /// Whether request headers are recorded.
    pub capture_headers: bool,
    /// Console verbosity.
    pub log_level: LevelFilter,
    /// Ratio of transactions sampled, within `[0, 1]`.
    pub transaction_sample_rate: f64,
    /// Exporter request timeout.
    pub server_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            secret_token: None,
            server_url: Url::parse(DEFAULT_SERVER_URL).expect("default server url is valid"),
            environment: DEFAULT_ENVIRONMENT.to_string(),
            active: true,
            capture_body: CaptureBody::default(),
            capture_headers: true,
            log_level: LevelFilter::INFO,
            transaction_sample_rate: 1.0,
            server_timeout: Duration::from_millis(10_000),
        }
    }
}

impl AgentConfig {
    /// Set the service name.
    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    /// Enable or disable the client.
    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    /// Set the body capture policy.
    pub fn with_capture_body(mut self, capture_body: CaptureBody) -> Self {
        self.capture_body = capture_body;
        self
    }

    /// Enable or disable header capture.
    pub fn with_capture_headers(mut self, capture_headers: bool) -> Self {
        self.capture_headers = capture_headers;
        self
    }
}

fn flag(var: &'static str, default: bool) -> Result<bool, FromEnvErr<ConfigError>> {
    bool::from_env_var_or(var, default).map_err(|e| e.map(|source| ConfigError::Flag { var, source }))
}

fn url(var: &'static str, default: &str) -> Result<Url, FromEnvErr<ConfigError>> {
    let map = |source| ConfigError::Url { var, source };
    match Url::from_env_var(var) {
        Ok(url) => Ok(url),
        Err(e) if e.is_absent() => Url::parse(default).map_err(|e| FromEnvErr::parse_error(map(e))),
        Err(e) => Err(e.map(map)),
    }
}

fn millis(var: &'static str, default: Duration) -> Result<Duration, FromEnvErr<ConfigError>> {
    Duration::from_env_var_or(var, default)
        .map_err(|e| e.map(|source| ConfigError::Millis { var, source }))
}

fn text(var: &'static str, default: &str) -> Result<String, FromEnvErr<ConfigError>> {
    String::from_env_var_or_else(var, || default.to_string()).map_err(FromEnvErr::infallible_into)
}

impl FromEnv for AgentConfig {
    type Error = ConfigError;

    fn inventory() -> Vec<&'static EnvItemInfo> {
        vec![
            &EnvItemInfo {
                var: SERVICE_NAME,
                description: "Service name reported with every event, defaults to test-app",
                optional: true,
            },
            &EnvItemInfo {
                var: SECRET_TOKEN,
                description: "Secret token sent as a bearer token to the APM server",
                optional: true,
            },
            &EnvItemInfo {
                var: SERVER_URL,
                description: "APM server URL, defaults to http://localhost:8200",
                optional: true,
            },
            &EnvItemInfo {
                var: ENVIRONMENT,
                description: "Deployment environment tag, defaults to test",
                optional: true,
            },
            &EnvItemInfo {
                var: ACTIVE,
                description: "Whether the client samples and exports at all, defaults to true",
                optional: true,
            },
            &EnvItemInfo {
                var: CAPTURE_BODY,
                description: "Request body capture: off, errors, transactions or all. Defaults to errors",
                optional: true,
            },
            &EnvItemInfo {
                var: CAPTURE_HEADERS,
                description: "Whether request headers are recorded, defaults to true",
                optional: true,
            },
            &EnvItemInfo {
                var: LOG_LEVEL,
                description: "Console log level, defaults to info. RUST_LOG takes precedence",
                optional: true,
            },
            &EnvItemInfo {
                var: SAMPLE_RATE,
                description: "Ratio of transactions sampled, 0.0 to 1.0, defaults to 1.0",
                optional: true,
            },
            &EnvItemInfo {
                var: SERVER_TIMEOUT,
                description: "Exporter request timeout in milliseconds, defaults to 10000",
                optional: true,
            },
        ]
    }

    fn from_env() -> Result<Self, FromEnvErr<Self::Error>> {
        let defaults = Self::default();

        let secret_token = Option::<String>::from_env_var(SECRET_TOKEN)
            .map_err(FromEnvErr::infallible_into)?;

        let capture_body = CaptureBody::from_env_var_or(CAPTURE_BODY, defaults.capture_body)
            .map_err(|e| e.map(ConfigError::from))?;

        let log_level = match String::from_env_var(LOG_LEVEL) {
            Ok(raw) => parse_log_level(&raw).map_err(FromEnvErr::parse_error)?,
            Err(e) if e.is_absent() => defaults.log_level,
            Err(e) => return Err(e.infallible_into()),
        };

        let transaction_sample_rate =
            f64::from_env_var_or(SAMPLE_RATE, defaults.transaction_sample_rate)
                .map_err(|e| e.map(ConfigError::from))?;
        if !(0.0..=1.0).contains(&transaction_sample_rate) {
            return Err(FromEnvErr::parse_error(ConfigError::SampleRateRange(
                transaction_sample_rate.to_string(),
            )));
        }

        Ok(Self {
            service_name: text(SERVICE_NAME, DEFAULT_SERVICE_NAME)?,
            secret_token,
            server_url: url(SERVER_URL, DEFAULT_SERVER_URL)?,
            environment: text(ENVIRONMENT, DEFAULT_ENVIRONMENT)?,
            active: flag(ACTIVE, defaults.active)?,
            capture_body,
            capture_headers: flag(CAPTURE_HEADERS, defaults.capture_headers)?,
            log_level,
            transaction_sample_rate,
            server_timeout: millis(SERVER_TIMEOUT, defaults.server_timeout)?,
        })
    }
}

/// Optional pacing overrides, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, init4_from_env_derive::FromEnv)]
#[from_env(crate)]
pub struct PacingOverrides {
    /// Simulated database work in the success scenario.
    #[from_env(
        var = "APM_DEMO_SUCCESS_WORK_MS",
        desc = "Simulated database work in the success scenario, defaults to 100",
        optional
    )]
    pub success_work: Option<Duration>,

    /// Simulated outbound call in the HTTP scenario.
    #[from_env(
        var = "APM_DEMO_HTTP_WORK_MS",
        desc = "Simulated outbound call in the HTTP scenario, defaults to 200",
        optional
    )]
    pub http_work: Option<Duration>,

    /// Pause after each scenario.
    #[from_env(
        var = "APM_DEMO_STEP_DELAY_MS",
        desc = "Pause after each scenario, defaults to 500",
        optional
    )]
    pub step_delay: Option<Duration>,

    /// Wait before exiting so buffered data can be sent.
    #[from_env(
        var = "APM_DEMO_DRAIN_MS",
        desc = "Wait before exiting so buffered data can be sent, defaults to 2000",
        optional
    )]
    pub drain: Option<Duration>,
}

/// Fixed delays of the scenario sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    /// Simulated database work in the success scenario.
    pub success_work: Duration,
    /// Simulated outbound call in the HTTP scenario.
    pub http_work: Duration,
    /// Pause after each scenario.
    pub step_delay: Duration,
    /// Wait before exiting.
    pub drain: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            success_work: Duration::from_millis(100),
            http_work: Duration::from_millis(200),
            step_delay: Duration::from_millis(500),
            drain: Duration::from_millis(2000),
        }
    }
}

impl From<PacingOverrides> for Pacing {
    fn from(overrides: PacingOverrides) -> Self {
        let defaults = Self::default();
        Self {
            success_work: overrides.success_work.unwrap_or(defaults.success_work),
            http_work: overrides.http_work.unwrap_or(defaults.http_work),
            step_delay: overrides.step_delay.unwrap_or(defaults.step_delay),
            drain: overrides.drain.unwrap_or(defaults.drain),
        }
    }
}

impl Pacing {
    /// Total wall time of an uninterrupted run.
    pub fn total(&self) -> Duration {
        self.success_work + self.http_work + self.step_delay * 4 + self.drain
    }
}

/// Everything the `apm-smoke` binary reads at startup.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub struct DemoConfig {
    /// Tracing client settings.
    pub agent: AgentConfig,
    /// Scenario delays.
    pub pacing: Pacing,
    /// Where the operator should look for results.
    pub dashboard_url: Url,
    /// Exit non-zero when the sequence fails. Off by default: a failed run is
    /// reported to the collector and the process still exits 0.
    pub strict_exit: bool,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            agent: AgentConfig::default(),
            pacing: Pacing::default(),
            dashboard_url: Url::parse(DEFAULT_DASHBOARD_URL).expect("default dashboard url is valid"),
            strict_exit: false,
        }
    }
}

impl FromEnv for DemoConfig {
    type Error = ConfigError;

    fn inventory() -> Vec<&'static EnvItemInfo> {
        let mut items = AgentConfig::inventory();
        items.extend(PacingOverrides::inventory());
        items.push(&EnvItemInfo {
            var: DASHBOARD_URL,
            description: "Dashboard URL printed when the run completes",
            optional: true,
        });
        items.push(&EnvItemInfo {
            var: STRICT_EXIT,
            description: "Exit with status 1 when the scenario sequence fails, defaults to false",
            optional: true,
        });
        items
    }

    fn from_env() -> Result<Self, FromEnvErr<Self::Error>> {
        Ok(Self {
            agent: AgentConfig::from_env()?,
            pacing: PacingOverrides::from_env()
                .map_err(|e| e.map(ConfigError::from))?
                .into(),
            dashboard_url: url(DASHBOARD_URL, DEFAULT_DASHBOARD_URL)?,
            strict_exit: flag(STRICT_EXIT, false)?,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const ALL: &[&str] = &[
        SERVICE_NAME,
        SECRET_TOKEN,
        SERVER_URL,
        ENVIRONMENT,
        ACTIVE,
        CAPTURE_BODY,
        CAPTURE_HEADERS,
        LOG_LEVEL,
        SAMPLE_RATE,
        SERVER_TIMEOUT,
        DASHBOARD_URL,
        STRICT_EXIT,
        "APM_DEMO_SUCCESS_WORK_MS",
        "APM_DEMO_HTTP_WORK_MS",
        "APM_DEMO_STEP_DELAY_MS",
        "APM_DEMO_DRAIN_MS",
    ];

    fn run_clear_env<F>(f: F)
    where
        F: FnOnce(),
    {
        f();
        for var in ALL {
            unsafe { std::env::remove_var(var) };
        }
    }

    fn set(var: &str, val: &str) {
        unsafe { std::env::set_var(var, val) };
    }

    #[test]
    #[serial_test::serial]
    fn defaults_match_demo_agent() {
        run_clear_env(|| {
            let cfg = DemoConfig::from_env().unwrap();
            assert_eq!(cfg, DemoConfig::default());
            assert_eq!(cfg.agent.service_name, "test-app");
            assert_eq!(cfg.agent.server_url.as_str(), "http://localhost:8200/");
            assert_eq!(cfg.agent.environment, "test");
            assert!(cfg.agent.active);
            assert_eq!(cfg.agent.capture_body, CaptureBody::Errors);
            assert!(cfg.agent.capture_headers);
            assert_eq!(cfg.agent.log_level, LevelFilter::INFO);
            assert!(cfg.agent.secret_token.is_none());
            assert_eq!(cfg.pacing.total(), Duration::from_millis(4300));
            assert!(!cfg.strict_exit);
        })
    }

    #[test]
    #[serial_test::serial]
    fn reads_overrides() {
        run_clear_env(|| {
            set(SERVICE_NAME, "checkout");
            set(SECRET_TOKEN, "s3cr3t");
            set(SERVER_URL, "https://apm.internal:8200");
            set(ACTIVE, "false");
            set(CAPTURE_BODY, "ALL");
            set(CAPTURE_HEADERS, "0");
            set(LOG_LEVEL, "warning");
            set(SAMPLE_RATE, "0.5");
            set(SERVER_TIMEOUT, "2500");
            set(STRICT_EXIT, "yes");
            set("APM_DEMO_DRAIN_MS", "10");

            let cfg = DemoConfig::from_env().unwrap();
            assert_eq!(cfg.agent.service_name, "checkout");
            assert_eq!(cfg.agent.secret_token.as_deref(), Some("s3cr3t"));
            assert_eq!(cfg.agent.server_url.host_str(), Some("apm.internal"));
            assert!(!cfg.agent.active);
            assert_eq!(cfg.agent.capture_body, CaptureBody::All);
            assert!(!cfg.agent.capture_headers);
            assert_eq!(cfg.agent.log_level, LevelFilter::WARN);
            assert_eq!(cfg.agent.transaction_sample_rate, 0.5);
            assert_eq!(cfg.agent.server_timeout, Duration::from_millis(2500));
            assert!(cfg.strict_exit);
            assert_eq!(cfg.pacing.drain, Duration::from_millis(10));
            assert_eq!(cfg.pacing.step_delay, Duration::from_millis(500));
        })
    }

    #[test]
    #[serial_test::serial]
    fn empty_token_is_unset() {
        run_clear_env(|| {
            set(SECRET_TOKEN, "");
            let cfg = AgentConfig::from_env().unwrap();
            assert!(cfg.secret_token.is_none());
        })
    }

    #[test]
    #[serial_test::serial]
    fn rejects_out_of_range_sample_rate() {
        run_clear_env(|| {
            set(SAMPLE_RATE, "1.5");
            let err = AgentConfig::from_env().unwrap_err();
            assert_eq!(
                err,
                FromEnvErr::parse_error(ConfigError::SampleRateRange("1.5".into()))
            );
        })
    }

    #[test]
    #[serial_test::serial]
    fn rejects_malformed_values() {
        run_clear_env(|| {
            set(SERVER_URL, "not a url");
            assert!(matches!(
                AgentConfig::from_env(),
                Err(FromEnvErr::ParseError(ConfigError::Url { var: SERVER_URL, .. }))
            ));
        });

        run_clear_env(|| {
            set(CAPTURE_BODY, "sometimes");
            assert!(matches!(
                AgentConfig::from_env(),
                Err(FromEnvErr::ParseError(ConfigError::CaptureBody(_)))
            ));
        });

        run_clear_env(|| {
            set("APM_DEMO_STEP_DELAY_MS", "half a second");
            assert!(matches!(
                DemoConfig::from_env(),
                Err(FromEnvErr::ParseError(ConfigError::Pacing(_)))
            ));
        });
    }

    #[cfg(unix)]
    #[test]
    #[serial_test::serial]
    fn non_unicode_service_name_is_an_error() {
        use std::{
            ffi::OsString,
            os::unix::ffi::OsStringExt,
        };

        run_clear_env(|| {
            unsafe { std::env::set_var(SERVICE_NAME, OsString::from_vec(vec![0x61, 0xfe])) };
            assert!(matches!(
                AgentConfig::from_env(),
                Err(FromEnvErr::EnvError(var, std::env::VarError::NotUnicode(_))) if var == SERVICE_NAME
            ));
        });
    }

    #[test]
    fn log_level_aliases() {
        assert_eq!(parse_log_level("fatal").unwrap(), LevelFilter::ERROR);
        assert_eq!(parse_log_level("Warning").unwrap(), LevelFilter::WARN);
        assert_eq!(parse_log_level("debug").unwrap(), LevelFilter::DEBUG);
        assert_eq!(parse_log_level("off").unwrap(), LevelFilter::OFF);
        assert!(parse_log_level("loud").is_err());
    }

    #[test]
    fn capture_body_policy() {
        assert!(!CaptureBody::Off.records(true));
        assert!(CaptureBody::Errors.records(true));
        assert!(!CaptureBody::Errors.records(false));
        assert!(CaptureBody::Transactions.records(false));
        assert!(!CaptureBody::Transactions.records(true));
        assert!(CaptureBody::All.records(false));
    }

    #[test]
    fn inventory_lists_every_variable() {
        let inventory = DemoConfig::inventory();
        for var in ALL {
            assert!(inventory.iter().any(|item| item.var == *var), "{var} missing");
        }
        assert!(inventory.iter().all(|item| item.optional));
        assert!(DemoConfig::check_inventory().is_ok());
    }
}
