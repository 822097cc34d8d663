use apm_smoke::{
    agent::client::TracingClient,
    config::{
        AgentConfig,
        DemoConfig,
    },
};

// Installs the global subscriber, so it needs a test binary of its own.
#[test]
fn trace_installs_console_logging_and_builds_client() {
    unsafe { std::env::remove_var("TRACING_METRICS_PORT") };
    let mut config = DemoConfig::default();
    config.agent = AgentConfig::default().with_active(false);

    assert!(!tracing::dispatcher::has_been_set());
    let client = apm_smoke::trace(&config).unwrap();
    assert!(tracing::dispatcher::has_been_set());

    client.close().unwrap();
}
