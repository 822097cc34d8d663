//! [`TracingClient`] backed by the OpenTelemetry SDK.
//!
//! Transactions map to root spans and spans to their children. Errors are
//! recorded as `exception` events and mark the owning span as failed.

use crate::{
    agent::{
        client::{
            ClientError,
            RequestInfo,
            SpanHandle,
            SpanSpec,
            TracingClient,
            TransactionHandle,
        },
        context::{
            ContextValue,
            CustomContext,
            LabelValue,
            Labels,
        },
    },
    config::{
        AgentConfig,
        CaptureBody,
    },
    utils::otlp::OtelGuard,
};
use opentelemetry::{
    Array,
    Context,
    KeyValue,
    StringValue,
    Value,
    trace::{
        Span as _,
        SpanKind,
        Status,
        TraceContextExt,
        Tracer as _,
    },
};
use opentelemetry_sdk::trace::{
    Span,
    SpanExporter,
    Tracer,
};
use std::sync::{
    Mutex,
    PoisonError,
    atomic::{
        AtomicBool,
        Ordering,
    },
};

/// Attribute keys written by [`OtelClient`].
pub mod keys {
    /// Transaction category.
    pub const TRANSACTION_TYPE: &str = "transaction.type";
    /// Transaction outcome.
    pub const TRANSACTION_RESULT: &str = "transaction.result";
    /// Span category.
    pub const SPAN_TYPE: &str = "span.type";
    /// Span technology.
    pub const SPAN_SUBTYPE: &str = "span.subtype";
    /// Span operation.
    pub const SPAN_ACTION: &str = "span.action";
    /// Request method.
    pub const HTTP_METHOD: &str = "http.request.method";
    /// Request URL.
    pub const URL_FULL: &str = "url.full";
    /// Prefix of recorded request headers.
    pub const HTTP_HEADER_PREFIX: &str = "http.request.header.";
    /// Recorded request body.
    pub const HTTP_BODY: &str = "http.request.body.content";
    /// Prefix of labels.
    pub const LABEL_PREFIX: &str = "labels.";
    /// Prefix of custom context fields.
    pub const CUSTOM_PREFIX: &str = "custom.";
    /// User id.
    pub const USER_ID: &str = "user.id";
    /// User name.
    pub const USER_NAME: &str = "user.name";
    /// User email.
    pub const USER_EMAIL: &str = "user.email";
}

#[derive(Debug, Clone, Copy)]
struct CaptureSettings {
    body: CaptureBody,
    headers: bool,
}

#[derive(Debug, Default)]
struct Ambient {
    custom: CustomContext,
    labels: Labels,
}

impl Ambient {
    fn attributes(&self) -> Vec<KeyValue> {
        let mut attrs = Vec::new();
        if let Some(user) = &self.custom.user {
            let fields = [
                (keys::USER_ID, &user.id),
                (keys::USER_NAME, &user.username),
                (keys::USER_EMAIL, &user.email),
            ];
            for (key, value) in fields {
                if let Some(value) = value {
                    attrs.push(KeyValue::new(key, value.clone()));
                }
            }
        }
        for (key, value) in &self.custom.custom {
            attrs.push(KeyValue::new(
                format!("{}{key}", keys::CUSTOM_PREFIX),
                context_value(value),
            ));
        }
        for (key, value) in self.labels.iter() {
            attrs.push(KeyValue::new(
                format!("{}{key}", keys::LABEL_PREFIX),
                label_value(value),
            ));
        }
        attrs
    }
}

fn label_value(value: &LabelValue) -> Value {
    match value {
        LabelValue::Str(s) => Value::from(s.clone()),
        LabelValue::Int(i) => Value::I64(*i),
        LabelValue::Float(v) => Value::F64(*v),
        LabelValue::Bool(b) => Value::Bool(*b),
    }
}

fn context_value(value: &ContextValue) -> Value {
    match value {
        ContextValue::Scalar(scalar) => label_value(scalar),
        ContextValue::List(items) => Value::Array(Array::String(
            items.iter().cloned().map(StringValue::from).collect(),
        )),
    }
}

fn transaction_kind(kind: &str) -> SpanKind {
    match kind {
        "request" => SpanKind::Server,
        "messaging" => SpanKind::Consumer,
        _ => SpanKind::Internal,
    }
}

fn span_kind(kind: &str) -> SpanKind {
    match kind {
        "db" | "external" | "cache" | "storage" => SpanKind::Client,
        "messaging" => SpanKind::Producer,
        _ => SpanKind::Internal,
    }
}

/// OpenTelemetry tracing client.
///
/// Holds the tracer provider for its whole lifetime; dropping the client
/// flushes and shuts the provider down.
#[derive(Debug)]
pub struct OtelClient {
    guard: OtelGuard,
    tracer: Tracer,
    capture: CaptureSettings,
    ambient: Mutex<Ambient>,
}

impl OtelClient {
    /// Build a client exporting to the APM server in `config`.
    pub fn new(config: &AgentConfig) -> Result<Self, ClientError> {
        OtelGuard::install(config).map(|guard| Self::from_guard(config, guard))
    }

    /// Build a client that hands finished spans to `exporter` synchronously.
    pub fn with_exporter<E>(config: &AgentConfig, exporter: E) -> Self
    where
        E: SpanExporter + 'static,
    {
        Self::from_guard(config, OtelGuard::with_exporter(config, exporter))
    }

    fn from_guard(config: &AgentConfig, guard: OtelGuard) -> Self {
        Self {
            tracer: guard.tracer(),
            guard,
            capture: CaptureSettings {
                body: config.capture_body,
                headers: config.capture_headers,
            },
            ambient: Default::default(),
        }
    }

    fn ambient_attributes(&self) -> Vec<KeyValue> {
        self.ambient
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .attributes()
    }

    fn update_ambient(&self, f: impl FnOnce(&mut Ambient)) -> Result<(), ClientError> {
        if self.guard.is_closed() {
            return Err(ClientError::Closed);
        }
        f(&mut self.ambient.lock().unwrap_or_else(PoisonError::into_inner));
        Ok(())
    }
}

impl TracingClient for OtelClient {
    type Transaction = OtelTransaction;

    fn start_transaction(&self, name: &str, kind: &str) -> Self::Transaction {
        let mut attributes = vec![KeyValue::new(keys::TRANSACTION_TYPE, kind.to_string())];
        attributes.extend(self.ambient_attributes());

        let span = self
            .tracer
            .span_builder(name.to_string())
            .with_kind(transaction_kind(kind))
            .with_attributes(attributes)
            .start_with_context(&self.tracer, &Context::new());

        metrics::counter!("apm_smoke_transactions_total", "type" => kind.to_string())
            .increment(1);
        tracing::debug!(transaction = name, kind, "transaction started");

        OtelTransaction {
            cx: Context::new().with_span(span),
            tracer: self.tracer.clone(),
            capture: self.capture,
            result: None,
            request: None,
            errored: AtomicBool::new(false),
        }
    }

    fn capture_error(
        &self,
        error: &(dyn core::error::Error + 'static),
        transaction: Option<&Self::Transaction>,
    ) {
        metrics::counter!("apm_smoke_errors_total").increment(1);
        tracing::debug!(%error, attached = transaction.is_some(), "error captured");

        if let Some(transaction) = transaction {
            transaction.record_error(error);
            return;
        }

        let mut span = self
            .tracer
            .span_builder("error")
            .with_attributes(self.ambient_attributes())
            .start_with_context(&self.tracer, &Context::new());
        span.record_error(error);
        span.set_status(Status::error(error.to_string()));
        span.end();
    }

    fn set_custom_context(&self, context: CustomContext) -> Result<(), ClientError> {
        self.update_ambient(|ambient| ambient.custom.merge(context))
    }

    fn add_labels(&self, labels: Labels) -> Result<(), ClientError> {
        self.update_ambient(|ambient| ambient.labels.merge(labels))
    }

    fn flush(&self) -> Result<(), ClientError> {
        self.guard.flush()
    }

    fn close(&self) -> Result<(), ClientError> {
        self.guard.shutdown()
    }
}

/// Transaction opened by [`OtelClient`].
#[derive(Debug)]
pub struct OtelTransaction {
    cx: Context,
    tracer: Tracer,
    capture: CaptureSettings,
    result: Option<String>,
    request: Option<RequestInfo>,
    errored: AtomicBool,
}

impl OtelTransaction {
    fn record_error(&self, error: &(dyn core::error::Error + 'static)) {
        let span = self.cx.span();
        span.record_error(error);
        span.set_status(Status::error(error.to_string()));
        self.errored.store(true, Ordering::Release);
    }

    fn request_attributes(&self, request: &RequestInfo) -> Vec<KeyValue> {
        let mut attrs = vec![
            KeyValue::new(keys::HTTP_METHOD, request.method.clone()),
            KeyValue::new(keys::URL_FULL, request.url.clone()),
        ];
        if self.capture.headers {
            attrs.extend(request.headers.iter().map(|(name, value)| {
                KeyValue::new(
                    format!("{}{}", keys::HTTP_HEADER_PREFIX, name.to_ascii_lowercase()),
                    value.clone(),
                )
            }));
        }
        let errored = self.errored.load(Ordering::Acquire);
        if let Some(body) = request.body.as_ref().filter(|_| self.capture.body.records(errored)) {
            attrs.push(KeyValue::new(keys::HTTP_BODY, body.clone()));
        }
        attrs
    }
}

impl TransactionHandle for OtelTransaction {
    type Span = OtelSpan;

    fn start_span(&self, spec: SpanSpec<'_>) -> Option<Self::Span> {
        if !self.cx.span().span_context().is_sampled() {
            return None;
        }

        let mut attributes = vec![KeyValue::new(keys::SPAN_TYPE, spec.kind.to_string())];
        if let Some(subtype) = spec.subtype {
            attributes.push(KeyValue::new(keys::SPAN_SUBTYPE, subtype.to_string()));
        }
        if let Some(action) = spec.action {
            attributes.push(KeyValue::new(keys::SPAN_ACTION, action.to_string()));
        }

        let span = self
            .tracer
            .span_builder(spec.name.to_string())
            .with_kind(span_kind(spec.kind))
            .with_attributes(attributes)
            .start_with_context(&self.tracer, &self.cx);

        metrics::counter!("apm_smoke_spans_total", "type" => spec.kind.to_string()).increment(1);
        Some(OtelSpan(span))
    }

    fn set_result(&mut self, result: &str) {
        self.result = Some(result.to_string());
    }

    fn set_request(&mut self, request: RequestInfo) {
        self.request = Some(request);
    }

    fn end(self) {
        let span = self.cx.span();
        if let Some(request) = &self.request {
            span.set_attributes(self.request_attributes(request));
        }
        if let Some(result) = &self.result {
            span.set_attribute(KeyValue::new(keys::TRANSACTION_RESULT, result.clone()));
        }
        if !self.errored.load(Ordering::Acquire) {
            span.set_status(Status::Ok);
        }
        span.end();
    }
}

/// Span opened by [`OtelTransaction`].
#[derive(Debug)]
pub struct OtelSpan(Span);

impl SpanHandle for OtelSpan {
    fn end(mut self) {
        self.0.end();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::agent::context::UserContext;
    use opentelemetry::trace::SpanId;
    use opentelemetry_sdk::trace::{
        InMemorySpanExporter,
        SpanData,
    };

    fn client(config: &AgentConfig) -> (OtelClient, InMemorySpanExporter) {
        let exporter = InMemorySpanExporter::default();
        (OtelClient::with_exporter(config, exporter.clone()), exporter)
    }

    fn attr<'a>(span: &'a SpanData, key: &str) -> Option<&'a Value> {
        span.attributes
            .iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| &kv.value)
    }

    fn finished(exporter: &InMemorySpanExporter, name: &str) -> SpanData {
        exporter
            .get_finished_spans()
            .unwrap()
            .into_iter()
            .find(|span| span.name == name)
            .unwrap_or_else(|| panic!("no finished span named {name}"))
    }

    #[test]
    fn span_is_child_of_transaction() {
        let (client, exporter) = client(&AgentConfig::default());

        let mut tx = client.start_transaction("test-success", "custom");
        let span = tx
            .start_span(SpanSpec::new("database-query", "db").subtype("postgresql").action("query"))
            .expect("sampled transaction opens spans");
        span.end();
        tx.set_result("success");
        tx.end();

        let tx = finished(&exporter, "test-success");
        let span = finished(&exporter, "database-query");

        assert_eq!(tx.parent_span_id, SpanId::INVALID);
        assert_eq!(span.parent_span_id, tx.span_context.span_id());
        assert_eq!(span.span_context.trace_id(), tx.span_context.trace_id());
        assert_eq!(span.span_kind, SpanKind::Client);
        assert_eq!(attr(&span, keys::SPAN_SUBTYPE), Some(&Value::from("postgresql")));
        assert_eq!(attr(&span, keys::SPAN_ACTION), Some(&Value::from("query")));
        assert_eq!(attr(&tx, keys::TRANSACTION_TYPE), Some(&Value::from("custom")));
        assert_eq!(attr(&tx, keys::TRANSACTION_RESULT), Some(&Value::from("success")));
        assert_eq!(tx.status, Status::Ok);
        assert!(span.end_time <= tx.end_time);
    }

    #[test]
    fn error_is_recorded_on_transaction() {
        let (client, exporter) = client(&AgentConfig::default());

        let mut tx = client.start_transaction("test-error", "custom");
        let err = std::io::Error::other("boom");
        client.capture_error(&err, Some(&tx));
        tx.set_result("error");
        tx.end();

        let tx = finished(&exporter, "test-error");
        assert!(matches!(tx.status, Status::Error { .. }));
        assert_eq!(tx.events.events.len(), 1);
        assert_eq!(tx.events.events[0].name, "exception");
        assert_eq!(attr(&tx, keys::TRANSACTION_RESULT), Some(&Value::from("error")));
    }

    #[test]
    fn detached_error_gets_its_own_span() {
        let (client, exporter) = client(&AgentConfig::default());
        client
            .add_labels(Labels::new().with("region", "us-west-1"))
            .unwrap();

        client.capture_error(&std::io::Error::other("top level"), None);

        let span = finished(&exporter, "error");
        assert!(matches!(span.status, Status::Error { .. }));
        assert_eq!(attr(&span, "labels.region"), Some(&Value::from("us-west-1")));
    }

    #[test]
    fn inactive_client_opens_no_spans() {
        let (client, exporter) = client(&AgentConfig::default().with_active(false));

        let tx = client.start_transaction("test-success", "custom");
        assert!(tx.start_span(SpanSpec::new("database-query", "db")).is_none());
        tx.end();

        assert!(exporter.get_finished_spans().unwrap().is_empty());
    }

    #[test]
    fn ambient_context_reaches_later_transactions() {
        let (client, exporter) = client(&AgentConfig::default());
        client
            .set_custom_context(
                CustomContext::new()
                    .with_user(UserContext {
                        id: Some("test-user-123".into()),
                        ..Default::default()
                    })
                    .with_field("feature_flags", ["flag_a", "flag_b"]),
            )
            .unwrap();
        client
            .add_labels(Labels::new().with("test_run", 42i64))
            .unwrap();

        client.start_transaction("later", "custom").end();

        let tx = finished(&exporter, "later");
        assert_eq!(attr(&tx, keys::USER_ID), Some(&Value::from("test-user-123")));
        assert_eq!(attr(&tx, "labels.test_run"), Some(&Value::I64(42)));
        assert_eq!(
            attr(&tx, "custom.feature_flags"),
            Some(&Value::Array(Array::String(vec![
                StringValue::from("flag_a"),
                StringValue::from("flag_b"),
            ])))
        );
    }

    fn request() -> RequestInfo {
        RequestInfo {
            method: "GET".into(),
            url: "http://localhost/demo".into(),
            headers: vec![("User-Agent".into(), "apm-smoke".into())],
            body: Some("ping".into()),
        }
    }

    #[test]
    fn request_capture_follows_settings() {
        let config = AgentConfig::default();
        let (client, exporter) = client(&config);

        let mut tx = client.start_transaction("http-request", "request");
        tx.set_request(request());
        tx.end();

        let tx = finished(&exporter, "http-request");
        assert_eq!(tx.span_kind, SpanKind::Server);
        assert_eq!(attr(&tx, keys::HTTP_METHOD), Some(&Value::from("GET")));
        assert_eq!(
            attr(&tx, "http.request.header.user-agent"),
            Some(&Value::from("apm-smoke"))
        );
        // bodies are only kept for failed transactions by default
        assert!(attr(&tx, keys::HTTP_BODY).is_none());

        let config = config.with_capture_headers(false).with_capture_body(CaptureBody::All);
        let (client, exporter) = self::client(&config);
        let mut tx = client.start_transaction("http-request", "request");
        tx.set_request(request());
        tx.end();

        let tx = finished(&exporter, "http-request");
        assert!(attr(&tx, "http.request.header.user-agent").is_none());
        assert_eq!(attr(&tx, keys::HTTP_BODY), Some(&Value::from("ping")));
    }

    #[test]
    fn closed_client_rejects_metadata() {
        let (client, _exporter) = client(&AgentConfig::default());
        client.close().unwrap();
        client.close().unwrap();

        assert!(matches!(
            client.add_labels(Labels::new().with("a", 1i64)),
            Err(ClientError::Closed)
        ));
        assert!(matches!(
            client.set_custom_context(CustomContext::new()),
            Err(ClientError::Closed)
        ));
    }
}
