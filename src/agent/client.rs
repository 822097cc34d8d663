use crate::agent::context::{
    CustomContext,
    Labels,
};

/// Errors returned by a [`TracingClient`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The client has been closed and no longer accepts data.
    #[error("tracing client is closed")]
    Closed,

    /// The OTLP exporter could not be built.
    #[error("failed to build OTLP exporter: {0}")]
    Exporter(#[from] opentelemetry_otlp::ExporterBuildError),

    /// The collector endpoint could not be derived from the server URL.
    #[error("invalid collector endpoint: {0}")]
    Endpoint(#[from] url::ParseError),

    /// Buffered data could not be flushed.
    #[error("flush failed: {0}")]
    Flush(#[source] opentelemetry_sdk::error::OTelSdkError),

    /// The provider failed to shut down cleanly.
    #[error("shutdown failed: {0}")]
    Shutdown(#[source] opentelemetry_sdk::error::OTelSdkError),
}

/// Describes a span to open under a transaction, as
/// `(name, type, subtype, action)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanSpec<'a> {
    /// Span name.
    pub name: &'a str,
    /// Broad category, e.g. `db` or `external`.
    pub kind: &'a str,
    /// Technology, e.g. `postgresql` or `http`.
    pub subtype: Option<&'a str>,
    /// Operation, e.g. `query`.
    pub action: Option<&'a str>,
}

impl<'a> SpanSpec<'a> {
    /// A span with a name and type only.
    pub const fn new(name: &'a str, kind: &'a str) -> Self {
        Self {
            name,
            kind,
            subtype: None,
            action: None,
        }
    }

    /// Set the subtype.
    pub const fn subtype(mut self, subtype: &'a str) -> Self {
        self.subtype = Some(subtype);
        self
    }

    /// Set the action.
    pub const fn action(mut self, action: &'a str) -> Self {
        self.action = Some(action);
        self
    }
}

/// Request metadata for request-type transactions. Whether headers and body
/// reach the collector depends on the client's capture settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestInfo {
    /// HTTP method.
    pub method: String,
    /// Full request URL.
    pub url: String,
    /// Request headers.
    pub headers: Vec<(String, String)>,
    /// Request body, if any.
    pub body: Option<String>,
}

/// A tracing client: the agent that owns transaction and span lifecycles and
/// ships them to a collector.
///
/// The client is constructed explicitly and passed to whatever produces
/// telemetry. [`TracingClient::close`] flushes and releases it; every
/// implementation also closes on drop.
pub trait TracingClient {
    /// Handle for an open transaction.
    type Transaction: TransactionHandle;

    /// Begin a transaction, a named unit of work with an outcome.
    fn start_transaction(&self, name: &str, kind: &str) -> Self::Transaction;

    /// Report an error, attached to `transaction` if given.
    fn capture_error(
        &self,
        error: &(dyn core::error::Error + 'static),
        transaction: Option<&Self::Transaction>,
    );

    /// Merge custom metadata into the ambient context.
    fn set_custom_context(&self, context: CustomContext) -> Result<(), ClientError>;

    /// Merge labels into the ambient context.
    fn add_labels(&self, labels: Labels) -> Result<(), ClientError>;

    /// Send buffered data now.
    fn flush(&self) -> Result<(), ClientError>;

    /// Flush and shut down. Calling this more than once is a no-op.
    fn close(&self) -> Result<(), ClientError>;
}

/// An open transaction. Ending consumes the handle, so a transaction is ended
/// at most once.
pub trait TransactionHandle {
    /// Handle for an open span.
    type Span: SpanHandle;

    /// Open a child span. Returns [`None`] if the client declines, e.g. when
    /// the transaction is not sampled.
    fn start_span(&self, spec: SpanSpec<'_>) -> Option<Self::Span>;

    /// Set the outcome, e.g. `success` or a status line.
    fn set_result(&mut self, result: &str);

    /// Attach request metadata.
    fn set_request(&mut self, request: RequestInfo);

    /// End the transaction.
    fn end(self);
}

/// An open span.
pub trait SpanHandle {
    /// End the span.
    fn end(self);
}
