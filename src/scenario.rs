//! The four fixed scenarios of a smoke run.
//!
//! Each scenario takes the client explicitly and leaves no handle open: every
//! span is ended before its transaction, and every transaction is ended.

use crate::agent::{
    client::{
        ClientError,
        RequestInfo,
        SpanHandle,
        SpanSpec,
        TracingClient,
        TransactionHandle,
    },
    context::{
        CustomContext,
        Labels,
        UserContext,
    },
};
use std::{
    sync::atomic::{
        AtomicU64,
        Ordering,
    },
    time::{
        Duration,
        SystemTime,
        UNIX_EPOCH,
    },
};
use tracing::info;

/// Result recorded on the success transaction.
pub const RESULT_SUCCESS: &str = "success";
/// Result recorded on the error transaction.
pub const RESULT_ERROR: &str = "error";
/// Result recorded on the HTTP transaction.
pub const RESULT_HTTP: &str = "HTTP/2.0 200 OK";
/// Label carrying the [`RunId`].
pub const RUN_ID_LABEL: &str = "test_run";

/// The error raised on purpose by the error scenario.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, thiserror::Error)]
#[error("Test error for APM monitoring")]
pub struct SyntheticError;

fn fail() -> Result<(), SyntheticError> {
    Err(SyntheticError)
}

/// Identifier of one smoke run: milliseconds since the Unix epoch, bumped
/// when needed so that no two runs in a process share an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunId(u64);

static LAST_RUN_ID: AtomicU64 = AtomicU64::new(0);

impl RunId {
    /// A fresh id derived from the current time.
    pub fn generate() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default();
        let (Ok(prev) | Err(prev)) =
            LAST_RUN_ID.fetch_update(Ordering::AcqRel, Ordering::Acquire, |prev| {
                Some(now.max(prev + 1))
            });
        Self(now.max(prev + 1))
    }

    /// The raw millisecond value.
    pub const fn as_millis(self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for RunId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.0.fmt(f)
    }
}

/// Custom context attached by the metadata scenario.
pub fn custom_context() -> CustomContext {
    CustomContext::new()
        .with_user(UserContext {
            id: Some("test-user-123".into()),
            username: Some("testuser".into()),
            email: Some("test@example.com".into()),
        })
        .with_field("environment", "test")
        .with_field("version", "1.0.0")
        .with_field("feature_flags", ["flag_a", "flag_b"])
}

/// Labels attached by the metadata scenario.
pub fn labels(run_id: RunId) -> Labels {
    Labels::new()
        .with("service_tier", "premium")
        .with("region", "us-west-1")
        .with(RUN_ID_LABEL, run_id.as_millis() as i64)
}

/// Request described by the HTTP scenario.
pub fn http_request() -> RequestInfo {
    RequestInfo {
        method: "GET".into(),
        url: "http://localhost/api/health".into(),
        headers: vec![
            ("Accept".into(), "application/json".into()),
            ("User-Agent".into(), concat!("apm-smoke/", env!("CARGO_PKG_VERSION")).into()),
        ],
        body: None,
    }
}

/// A transaction with a database span around `work`, ending as `success`.
pub async fn success<C: TracingClient>(client: &C, work: Duration) {
    let mut transaction = client.start_transaction("test-success", "custom");
    info!("running successful transaction");

    let span = transaction.start_span(
        SpanSpec::new("database-query", "db")
            .subtype("postgresql")
            .action("query"),
    );
    tokio::time::sleep(work).await;
    if let Some(span) = span {
        span.end();
    }

    transaction.set_result(RESULT_SUCCESS);
    transaction.end();
    info!("transaction completed successfully");
}

/// A transaction that raises a [`SyntheticError`], reports it, and ends as
/// `error`.
pub fn error<C: TracingClient>(client: &C) {
    let mut transaction = client.start_transaction("test-error", "custom");
    info!("running error transaction");

    if let Err(err) = fail() {
        client.capture_error(&err, Some(&transaction));
        info!(%err, "error captured");
    }

    transaction.set_result(RESULT_ERROR);
    transaction.end();
}

/// A request transaction with an outbound HTTP span around `work`, ending
/// with a status line.
pub async fn http<C: TracingClient>(client: &C, work: Duration) {
    let mut transaction = client.start_transaction("http-request", "request");
    info!("running HTTP simulation");

    let span = transaction.start_span(SpanSpec::new("external-http", "external").subtype("http"));
    tokio::time::sleep(work).await;
    if let Some(span) = span {
        span.end();
    }

    transaction.set_request(http_request());
    transaction.set_result(RESULT_HTTP);
    transaction.end();
    info!("HTTP transaction completed");
}

/// Attach the fixed custom context and labels to the ambient context. No
/// transaction is opened.
pub fn metadata<C: TracingClient>(client: &C, run_id: RunId) -> Result<(), ClientError> {
    info!(%run_id, "sending custom metadata");
    client.set_custom_context(custom_context())?;
    client.add_labels(labels(run_id))?;
    info!("custom metadata sent");
    Ok(())
}
