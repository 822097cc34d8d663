use apm_smoke::{
    config::DemoConfig,
    runner::DemoRunner,
    utils::from_env::FromEnv,
};
use std::process::ExitCode;
use tracing::{
    debug,
    error,
    info,
};

/// Resolves on Ctrl-C. Never resolves if the signal handler cannot be
/// installed.
async fn interrupt() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "cannot listen for interrupts");
        std::future::pending::<()>().await;
    }
}

fn main() -> ExitCode {
    let config = match DemoConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            for item in DemoConfig::inventory() {
                eprintln!("  {}: {}", item.var, item.description);
            }
            return ExitCode::FAILURE;
        }
    };

    // Built before the runtime: the blocking OTLP client must not be created
    // from async context.
    let client = match apm_smoke::trace(&config) {
        Ok(client) => client,
        Err(err) => {
            error!(%err, "failed to start tracing client");
            return ExitCode::FAILURE;
        }
    };

    for item in DemoConfig::inventory() {
        debug!(var = item.var, "{}", item.description);
    }
    info!(
        service = %config.agent.service_name,
        server = %config.agent.server_url,
        environment = %config.agent.environment,
        active = config.agent.active,
        "starting APM smoke test"
    );

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(%err, "failed to build async runtime");
            return ExitCode::FAILURE;
        }
    };

    let outcome = runtime.block_on(async {
        DemoRunner::new(&client, config.pacing)
            .with_summary(config.agent.service_name.clone(), config.dashboard_url.clone())
            .run_until(interrupt())
            .await
    });

    ExitCode::from(outcome.exit_status(config.strict_exit))
}
