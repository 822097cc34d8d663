//! In-memory [`TracingClient`] that records every call as an [`Event`].
//!
//! Used by the test suite and by harnesses that want to assert on what a
//! telemetry producer did without running a collector.

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
    },
};
use std::sync::{
    Arc,
    Mutex,
    PoisonError,
    atomic::{
        AtomicBool,
        AtomicU64,
        Ordering,
    },
};

/// A call observed by [`MemoryClient`].
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A transaction was opened.
    TransactionStarted {
        /// Transaction id.
        id: u64,
        /// Transaction name.
        name: String,
        /// Transaction type.
        kind: String,
    },
    /// A span was opened.
    SpanStarted {
        /// Span id.
        id: u64,
        /// Owning transaction.
        transaction: u64,
        /// Span name.
        name: String,
        /// Span type.
        kind: String,
        /// Span subtype.
        subtype: Option<String>,
        /// Span action.
        action: Option<String>,
    },
    /// A span was ended.
    SpanEnded {
        /// Span id.
        id: u64,
    },
    /// Request metadata was attached.
    RequestSet {
        /// Owning transaction.
        transaction: u64,
        /// The request.
        request: RequestInfo,
    },
    /// A transaction was ended.
    TransactionEnded {
        /// Transaction id.
        id: u64,
        /// Result at the time of ending.
        result: Option<String>,
    },
    /// An error was captured.
    ErrorCaptured {
        /// Display form of the error.
        message: String,
        /// Transaction the error was attached to.
        transaction: Option<u64>,
    },
    /// Custom context was merged into the ambient context.
    CustomContextSet(CustomContext),
    /// Labels were merged into the ambient context.
    LabelsAdded(Labels),
    /// The client was flushed.
    Flushed,
    /// The client was closed.
    Closed,
}

#[derive(Debug, Default)]
struct Inner {
    events: Mutex<Vec<Event>>,
    next_id: AtomicU64,
    spans_disabled: bool,
    closed: AtomicBool,
}

impl Inner {
    fn record(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Recording tracing client. Clones share the same event log.
#[derive(Debug, Clone, Default)]
pub struct MemoryClient {
    inner: Arc<Inner>,
}

impl MemoryClient {
    /// A client that opens every span it is asked for.
    pub fn new() -> Self {
        Self::default()
    }

    /// A client that declines every span, as an unsampled agent would.
    pub fn without_spans() -> Self {
        Self {
            inner: Arc::new(Inner {
                spans_disabled: true,
                ..Default::default()
            }),
        }
    }

    /// Snapshot of every event so far, in call order.
    pub fn events(&self) -> Vec<Event> {
        self.inner
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether [`TracingClient::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.is_closed() {
            Err(ClientError::Closed)
        } else {
            Ok(())
        }
    }
}

impl TracingClient for MemoryClient {
    type Transaction = MemoryTransaction;

    fn start_transaction(&self, name: &str, kind: &str) -> Self::Transaction {
        let id = self.inner.next_id();
        self.inner.record(Event::TransactionStarted {
            id,
            name: name.to_string(),
            kind: kind.to_string(),
        });
        MemoryTransaction {
            id,
            inner: Arc::clone(&self.inner),
            result: None,
        }
    }

    fn capture_error(
        &self,
        error: &(dyn core::error::Error + 'static),
        transaction: Option<&Self::Transaction>,
    ) {
        self.inner.record(Event::ErrorCaptured {
            message: error.to_string(),
            transaction: transaction.map(MemoryTransaction::id),
        });
    }

    fn set_custom_context(&self, context: CustomContext) -> Result<(), ClientError> {
        self.ensure_open()?;
        self.inner.record(Event::CustomContextSet(context));
        Ok(())
    }

    fn add_labels(&self, labels: Labels) -> Result<(), ClientError> {
        self.ensure_open()?;
        self.inner.record(Event::LabelsAdded(labels));
        Ok(())
    }

    fn flush(&self) -> Result<(), ClientError> {
        self.inner.record(Event::Flushed);
        Ok(())
    }

    fn close(&self) -> Result<(), ClientError> {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            self.inner.record(Event::Closed);
        }
        Ok(())
    }
}

/// Transaction opened by [`MemoryClient`]. Dropping an open transaction ends
/// it, as the OpenTelemetry SDK does for its spans.
#[derive(Debug)]
pub struct MemoryTransaction {
    id: u64,
    inner: Arc<Inner>,
    result: Option<String>,
}

impl MemoryTransaction {
    /// The id used in [`Event`]s.
    pub const fn id(&self) -> u64 {
        self.id
    }
}

impl TransactionHandle for MemoryTransaction {
    type Span = MemorySpan;

    fn start_span(&self, spec: SpanSpec<'_>) -> Option<Self::Span> {
        if self.inner.spans_disabled {
            return None;
        }
        let id = self.inner.next_id();
        self.inner.record(Event::SpanStarted {
            id,
            transaction: self.id,
            name: spec.name.to_string(),
            kind: spec.kind.to_string(),
            subtype: spec.subtype.map(str::to_string),
            action: spec.action.map(str::to_string),
        });
        Some(MemorySpan {
            id,
            inner: Arc::clone(&self.inner),
        })
    }

    fn set_result(&mut self, result: &str) {
        self.result = Some(result.to_string());
    }

    fn set_request(&mut self, request: RequestInfo) {
        self.inner.record(Event::RequestSet {
            transaction: self.id,
            request,
        });
    }

    fn end(self) {
        drop(self);
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.inner.record(Event::TransactionEnded {
            id: self.id,
            result: self.result.take(),
        });
    }
}

/// Span opened by [`MemoryTransaction`]. Ends on drop.
#[derive(Debug)]
pub struct MemorySpan {
    id: u64,
    inner: Arc<Inner>,
}

impl SpanHandle for MemorySpan {
    fn end(self) {
        drop(self);
    }
}

impl Drop for MemorySpan {
    fn drop(&mut self) {
        self.inner.record(Event::SpanEnded { id: self.id });
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn records_in_call_order() {
        let client = MemoryClient::new();

        let mut tx = client.start_transaction("t", "custom");
        let span = tx.start_span(SpanSpec::new("s", "db").subtype("postgresql")).unwrap();
        span.end();
        tx.set_result("success");
        tx.end();

        assert_eq!(
            client.events(),
            vec![
                Event::TransactionStarted {
                    id: 1,
                    name: "t".into(),
                    kind: "custom".into()
                },
                Event::SpanStarted {
                    id: 2,
                    transaction: 1,
                    name: "s".into(),
                    kind: "db".into(),
                    subtype: Some("postgresql".into()),
                    action: None,
                },
                Event::SpanEnded { id: 2 },
                Event::TransactionEnded {
                    id: 1,
                    result: Some("success".into())
                },
            ]
        );
    }

    #[test]
    fn without_spans_declines() {
        let client = MemoryClient::without_spans();
        let tx = client.start_transaction("t", "custom");
        assert!(tx.start_span(SpanSpec::new("s", "db")).is_none());
    }

    #[test]
    fn dropped_handles_are_ended() {
        let client = MemoryClient::new();

        let mut tx = client.start_transaction("t", "request");
        let span = tx.start_span(SpanSpec::new("s", "external"));
        tx.set_result("partial");
        drop(span);
        drop(tx);

        assert_eq!(
            &client.events()[2..],
            &[
                Event::SpanEnded { id: 2 },
                Event::TransactionEnded {
                    id: 1,
                    result: Some("partial".into())
                },
            ]
        );
    }

    #[test]
    fn close_is_recorded_once() {
        let client = MemoryClient::new();
        client.close().unwrap();
        client.close().unwrap();

        assert_eq!(client.events(), vec![Event::Closed]);
        assert!(matches!(
            client.add_labels(Labels::new()),
            Err(ClientError::Closed)
        ));
    }
}
