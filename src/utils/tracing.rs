use crate::utils::from_env::FromEnvVar;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    Layer,
    filter::EnvFilter,
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

const TRACING_LOG_JSON: &str = "TRACING_LOG_JSON";

/// Install a format layer based on the `TRACING_LOG_JSON` environment
/// variable, and then install the registry.
macro_rules! install_fmt {
    (json @ $registry:ident, $filter:ident) => {{
        let fmt = tracing_subscriber::fmt::layer().json().with_filter($filter);
        $registry.with(fmt).init();
    }};
    (log @ $registry:ident, $filter:ident) => {{
        let fmt = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_filter($filter);
        $registry.with(fmt).init();
    }};
    ($registry:ident, $level:expr) => {{
        let json = bool::from_env_var(TRACING_LOG_JSON).unwrap_or(false);
        let filter = console_filter($level);
        if json {
            install_fmt!(json @ $registry, filter);
        } else {
            install_fmt!(log @ $registry, filter);
        }
    }};
}

/// Console filter: `RUST_LOG` if set, otherwise `level`.
pub fn console_filter(level: LevelFilter) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy()
}

/// Install the global console subscriber.
///
/// ## Env Reads
///
/// - `RUST_LOG` - overrides `level` when set.
/// - `TRACING_LOG_JSON` - if truthy, log lines are written as JSON.
///
/// ## Panics
///
/// This function will panic if a global subscriber has already been set.
pub fn init_tracing(level: LevelFilter) {
    let registry = tracing_subscriber::registry();
    install_fmt!(registry, level);
}

/// As [`init_tracing`], additionally sending events to journald.
///
/// ## Panics
///
/// This function will panic if a global subscriber has already been set, or
/// if the journald socket cannot be opened.
#[cfg(feature = "journald")]
pub fn init_tracing_with_journald(level: LevelFilter) {
    let registry = tracing_subscriber::registry()
        .with(tracing_journald::layer().expect("failed to create journald layer"));
    install_fmt!(registry, level);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    #[serial_test::serial]
    fn filter_defaults_to_level() {
        unsafe { std::env::remove_var("RUST_LOG") };
        assert_eq!(console_filter(LevelFilter::WARN).max_level_hint(), Some(LevelFilter::WARN));
    }

    #[test]
    #[serial_test::serial]
    fn rust_log_wins() {
        unsafe { std::env::set_var("RUST_LOG", "debug") };
        let filter = console_filter(LevelFilter::ERROR);
        unsafe { std::env::remove_var("RUST_LOG") };
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::DEBUG));
    }
}
