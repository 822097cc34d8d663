//! Drives the fixed scenario sequence against a [`TracingClient`].

use crate::{
    agent::client::{
        ClientError,
        TracingClient,
    },
    config::Pacing,
    scenario::{
        self,
        RunId,
    },
};
use std::future::Future;
use tokio::time::sleep;
use tracing::{
    debug,
    error,
    info,
    warn,
};
use url::Url;

/// Where a run is in its linear lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    /// Nothing has happened yet.
    #[default]
    NotStarted,
    /// Success scenario.
    Success,
    /// Error scenario.
    Error,
    /// HTTP scenario.
    Http,
    /// Metadata scenario.
    Metadata,
    /// Waiting for buffered telemetry to be sent.
    Draining,
    /// Done.
    Exited,
}

impl core::fmt::Display for Stage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Self::NotStarted => "not-started",
            Self::Success => "success",
            Self::Error => "error",
            Self::Http => "http",
            Self::Metadata => "metadata",
            Self::Draining => "draining",
            Self::Exited => "exited",
        })
    }
}

/// A scenario failed unexpectedly.
#[derive(Debug, thiserror::Error)]
#[error("{stage} scenario failed: {source}")]
pub struct RunError {
    /// Stage that failed.
    pub stage: Stage,
    /// Underlying client error.
    #[source]
    pub source: ClientError,
}

/// How a run ended.
#[derive(Debug)]
pub enum Outcome {
    /// Every scenario ran.
    Completed,
    /// A scenario failed. The failure was logged and reported to the client.
    Failed(RunError),
    /// An interrupt arrived. The client was flushed.
    Interrupted,
}

impl Outcome {
    /// Process exit status for this outcome.
    ///
    /// Failures exit 0 unless `strict` is set: the failure has already been
    /// reported to the collector.
    pub const fn exit_status(&self, strict: bool) -> u8 {
        match self {
            Self::Failed(_) if strict => 1,
            _ => 0,
        }
    }

    /// True if every scenario ran.
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Runs the success, error, HTTP and metadata scenarios in order, then
/// drains and closes the client.
#[derive(Debug)]
pub struct DemoRunner<'a, C> {
    client: &'a C,
    pacing: Pacing,
    service_name: String,
    dashboard_url: Option<Url>,
    stage: Stage,
    run_id: Option<RunId>,
}

impl<'a, C: TracingClient> DemoRunner<'a, C> {
    /// A runner over `client` with the given delays.
    pub fn new(client: &'a C, pacing: Pacing) -> Self {
        Self {
            client,
            pacing,
            service_name: String::new(),
            dashboard_url: None,
            stage: Stage::NotStarted,
            run_id: None,
        }
    }

    /// Set the service name and dashboard printed in the completion summary.
    pub fn with_summary(mut self, service_name: impl Into<String>, dashboard_url: Url) -> Self {
        self.service_name = service_name.into();
        self.dashboard_url = Some(dashboard_url);
        self
    }

    /// Current stage.
    pub const fn stage(&self) -> Stage {
        self.stage
    }

    /// Run id attached by the metadata scenario, once it has run.
    pub const fn run_id(&self) -> Option<RunId> {
        self.run_id
    }

    fn enter(&mut self, stage: Stage) {
        debug!(from = %self.stage, to = %stage, "stage transition");
        self.stage = stage;
    }

    async fn pause(&self) {
        sleep(self.pacing.step_delay).await;
    }

    async fn scenarios(&mut self) -> Result<(), RunError> {
        self.enter(Stage::Success);
        scenario::success(self.client, self.pacing.success_work).await;
        self.pause().await;

        self.enter(Stage::Error);
        scenario::error(self.client);
        self.pause().await;

        self.enter(Stage::Http);
        scenario::http(self.client, self.pacing.http_work).await;
        self.pause().await;

        self.enter(Stage::Metadata);
        let run_id = RunId::generate();
        self.run_id = Some(run_id);
        scenario::metadata(self.client, run_id).map_err(|source| RunError {
            stage: Stage::Metadata,
            source,
        })?;
        self.pause().await;

        Ok(())
    }

    fn summary(&self) {
        info!("all scenarios completed");
        if let Some(dashboard) = &self.dashboard_url {
            info!(
                %dashboard,
                service = %self.service_name,
                "check the APM dashboard, data should appear within 30-60 seconds"
            );
        }
    }

    /// Run the whole sequence, then drain and close the client.
    ///
    /// A failing scenario stops the sequence; the error is logged and
    /// reported to the client, and the run still drains and closes.
    pub async fn run(&mut self) -> Outcome {
        info!("APM smoke test suite starting");

        let outcome = match self.scenarios().await {
            Ok(()) => {
                self.summary();
                Outcome::Completed
            }
            Err(err) => {
                error!(%err, "smoke test execution failed");
                self.client.capture_error(&err, None);
                Outcome::Failed(err)
            }
        };

        self.enter(Stage::Draining);
        sleep(self.pacing.drain).await;
        if let Err(err) = self.client.close() {
            error!(%err, "failed to close tracing client");
        }
        self.enter(Stage::Exited);
        info!("smoke test completed, exiting");

        outcome
    }

    /// As [`DemoRunner::run`], stopping early when `shutdown` resolves. An
    /// interrupted run flushes the client before returning.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Outcome
    where
        F: Future<Output = ()>,
    {
        let finished = tokio::select! {
            outcome = self.run() => Some(outcome),
            () = shutdown => None,
        };

        match finished {
            Some(outcome) => outcome,
            None => {
                warn!(stage = %self.stage, "received interrupt, shutting down gracefully");
                if let Err(err) = self.client.flush() {
                    error!(%err, "failed to flush tracing client");
                }
                self.enter(Stage::Exited);
                Outcome::Interrupted
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::agent::memory::MemoryClient;

    #[test]
    fn exit_status() {
        let failed = Outcome::Failed(RunError {
            stage: Stage::Metadata,
            source: ClientError::Closed,
        });
        assert_eq!(failed.exit_status(false), 0);
        assert_eq!(failed.exit_status(true), 1);
        assert_eq!(Outcome::Completed.exit_status(true), 0);
        assert_eq!(Outcome::Interrupted.exit_status(true), 0);
    }

    #[test]
    fn run_error_names_stage() {
        let err = RunError {
            stage: Stage::Metadata,
            source: ClientError::Closed,
        };
        assert_eq!(
            err.to_string(),
            "metadata scenario failed: tracing client is closed"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stages_advance_to_exited() {
        let client = MemoryClient::new();
        let mut runner = DemoRunner::new(&client, Pacing::default());
        assert_eq!(runner.stage(), Stage::NotStarted);

        let outcome = runner.run().await;
        assert!(outcome.is_completed());
        assert_eq!(runner.stage(), Stage::Exited);
        assert!(runner.run_id().is_some());
        assert!(client.is_closed());
    }
}
