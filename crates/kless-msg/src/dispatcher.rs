//! ---
//! kless_section: "02-messaging-ipc"
//! kless_subsection: "module"
//! kless_type: "source"
//! kless_scope: "code"
//! kless_description: "Typed payloads, envelopes and dispatch between wallet contexts."
//! kless_version: "v0.0.0-prealpha"
//! kless_owner: "tbd"
//! ---
//! Request/response state machine of one wallet context.
//!
//! Outbound requests park a [`PendingCall`] keyed by correlation id until the
//! matching reply arrives, the caller's deadline passes, or the call is
//! cancelled. Inbound envelopes that match no call are narrowed through the
//! registry and routed to the single handler registered for their
//! discriminant.
//!
//! Handlers are either immediate closures or futures awaited by the receive
//! path. The dispatcher never spawns tasks; an awaited handler holds up the
//! frames queued behind it. Locks are never held across an await or while a
//! handler runs.
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value as JsonValue;
use tokio::sync::oneshot;
use tracing::debug;

use crate::diagnostics::{Diagnostic, DiagnosticKind, DiagnosticSink, TracingSink};
use crate::envelope::{wire_id, CorrelationId, Envelope};
use crate::logging::{log_envelope, MessageDirection, MessagingMetricsExporter};
use crate::registry::PayloadRegistry;
use crate::transport::{InboundFrames, Transport};
use crate::types::{Payload, PayloadKind, PayloadStyle};
use crate::{MessagingError, Result};

/// Terminal call ids remembered for late/duplicate reply detection.
pub const DEFAULT_SETTLED_HISTORY: usize = 1024;

/// Failure reported by a payload handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    /// Optional machine readable error code.
    pub code: Option<String>,
    /// Human readable failure description.
    pub message: String,
}

impl HandlerError {
    /// Error carrying a machine readable code.
    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// Handler received a payload it was not registered for.
    pub fn unexpected(kind: PayloadKind) -> Self {
        Self::with_code("unexpected-payload", format!("unexpected payload `{kind}`"))
    }
}

/// Outcome of a handler. `Ok(None)` on a request is answered with `done`.
pub type HandlerResult = std::result::Result<Option<Payload>, HandlerError>;

#[derive(Clone)]
enum Handler {
    Immediate(Arc<dyn Fn(&Payload) -> HandlerResult + Send + Sync>),
    Deferred(Arc<dyn Fn(Payload) -> BoxFuture<'static, HandlerResult> + Send + Sync>),
}

impl Handler {
    async fn call(&self, payload: &Payload) -> HandlerResult {
        match self {
            Handler::Immediate(handler) => handler(payload),
            Handler::Deferred(handler) => handler(payload.clone()).await,
        }
    }
}

/// Why a call ended without a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallFailure {
    /// Deadline elapsed.
    Timeout,
    /// Caller withdrew interest.
    Cancelled,
}

/// Lifecycle of an outbound call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Awaiting a reply.
    Pending,
    /// Matched with a reply.
    Resolved,
    /// Ended without a reply.
    Failed(CallFailure),
}

/// Snapshot of dispatcher counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherMetrics {
    /// Envelopes handed to the transport (requests, notifications and replies).
    pub sent: u64,
    /// Frames received from the transport.
    pub received: u64,
    /// Calls resolved by a matching reply.
    pub replies: u64,
    /// Inbound payloads without a handler.
    pub unhandled: u64,
    /// Inbound frames that failed validation.
    pub malformed: u64,
    /// Calls that timed out.
    pub timeouts: u64,
    /// Calls that were cancelled.
    pub cancelled: u64,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    replies: AtomicU64,
    unhandled: AtomicU64,
    malformed: AtomicU64,
    timeouts: AtomicU64,
    cancelled: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DispatcherMetrics {
        DispatcherMetrics {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            replies: self.replies.load(Ordering::Relaxed),
            unhandled: self.unhandled.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

struct PendingEntry {
    tx: oneshot::Sender<Result<Payload>>,
    kind: PayloadKind,
    started: Instant,
}

struct CallTable {
    pending: HashMap<CorrelationId, PendingEntry>,
    settled: HashMap<CorrelationId, CallState>,
    order: VecDeque<CorrelationId>,
    capacity: usize,
}

impl CallTable {
    fn new(capacity: usize) -> Self {
        Self {
            pending: HashMap::new(),
            settled: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn settle(&mut self, id: CorrelationId, state: CallState) {
        if self.settled.insert(id, state).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.settled.remove(&evicted);
            }
        }
    }

    fn state(&self, id: &CorrelationId) -> Option<CallState> {
        if self.pending.contains_key(id) {
            return Some(CallState::Pending);
        }
        self.settled.get(id).copied()
    }
}

struct Inner {
    registry: PayloadRegistry,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn DiagnosticSink>,
    handlers: RwLock<HashMap<PayloadKind, Handler>>,
    calls: Mutex<CallTable>,
    counters: Counters,
    exporter: Option<MessagingMetricsExporter>,
}

/// Configures a [`Dispatcher`].
pub struct DispatcherBuilder {
    registry: PayloadRegistry,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn DiagnosticSink>,
    exporter: Option<MessagingMetricsExporter>,
    settled_history: usize,
}

impl DispatcherBuilder {
    /// Start from the standard registry and a tracing diagnostic sink.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            registry: PayloadRegistry::standard(),
            transport,
            sink: Arc::new(TracingSink),
            exporter: None,
            settled_history: DEFAULT_SETTLED_HISTORY,
        }
    }

    /// Use an explicit payload registry.
    pub fn registry(mut self, registry: PayloadRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Report protocol faults to `sink`.
    pub fn sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Mirror activity into prometheus metrics.
    pub fn metrics(mut self, exporter: MessagingMetricsExporter) -> Self {
        self.exporter = Some(exporter);
        self
    }

    /// Number of terminal call ids remembered. At least one is kept.
    pub fn settled_history(mut self, entries: usize) -> Self {
        self.settled_history = entries.max(1);
        self
    }

    /// Finish configuration.
    pub fn build(self) -> Dispatcher {
        Dispatcher {
            inner: Arc::new(Inner {
                registry: self.registry,
                transport: self.transport,
                sink: self.sink,
                handlers: RwLock::new(HashMap::new()),
                calls: Mutex::new(CallTable::new(self.settled_history)),
                counters: Counters::default(),
                exporter: self.exporter,
            }),
        }
    }
}

/// Routes outbound calls to replies and inbound envelopes to handlers.
///
/// Cheap to clone; clones share the same call table and handlers.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Dispatcher over `transport` with an explicit registry and sink.
    pub fn new(
        registry: PayloadRegistry,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn DiagnosticSink>,
    ) -> Self {
        DispatcherBuilder::new(transport)
            .registry(registry)
            .sink(sink)
            .build()
    }

    /// Start configuring a dispatcher over `transport`.
    pub fn builder(transport: Arc<dyn Transport>) -> DispatcherBuilder {
        DispatcherBuilder::new(transport)
    }

    /// Registry used to narrow inbound payloads.
    pub fn registry(&self) -> &PayloadRegistry {
        &self.inner.registry
    }

    /// Register the single handler for `kind`.
    ///
    /// Fails with [`MessagingError::DuplicateHandler`] when `kind` already has
    /// one. Response variants cannot take handlers; they are only ever matched
    /// against pending calls.
    pub fn register_handler<F>(&self, kind: PayloadKind, handler: F) -> Result<()>
    where
        F: Fn(&Payload) -> HandlerResult + Send + Sync + 'static,
    {
        self.install(kind, Handler::Immediate(Arc::new(handler)))
    }

    /// Register the single handler for `kind` as an async function.
    ///
    /// The receive path awaits the returned future before taking the next
    /// frame. Same registration rules as [`Dispatcher::register_handler`].
    pub fn register_async_handler<F, Fut>(&self, kind: PayloadKind, handler: F) -> Result<()>
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.install(
            kind,
            Handler::Deferred(Arc::new(move |payload: Payload| handler(payload).boxed())),
        )
    }

    fn install(&self, kind: PayloadKind, handler: Handler) -> Result<()> {
        if kind.style() == PayloadStyle::Response {
            return Err(MessagingError::StyleMismatch {
                tag: kind.tag(),
                expected: PayloadStyle::Request,
                actual: kind.style(),
            });
        }
        if self.inner.registry.descriptor(kind).is_none() {
            return Err(MessagingError::UnknownVariant(kind.tag()));
        }
        match self.inner.handlers.write().entry(kind) {
            Entry::Occupied(_) => return Err(MessagingError::DuplicateHandler(kind.tag())),
            Entry::Vacant(slot) => {
                slot.insert(handler);
            }
        }
        debug!(payload_type = kind.tag(), "handler registered");
        Ok(())
    }

    /// Whether a handler is registered for `kind`.
    pub fn has_handler(&self, kind: PayloadKind) -> bool {
        self.inner.handlers.read().contains_key(&kind)
    }

    /// Send a request and wait for its reply.
    ///
    /// Fails with [`MessagingError::Timeout`] once `timeout` elapses, with
    /// [`MessagingError::Cancelled`] if [`Dispatcher::cancel`] withdraws the
    /// call, and with [`MessagingError::Remote`] if the peer answered with an
    /// `error` payload.
    pub async fn send(&self, payload: Payload, timeout: Duration) -> Result<Payload> {
        self.start_call(payload, timeout)?.response().await
    }

    /// Transmit a request and return the parked call without awaiting it.
    pub fn start_call(&self, payload: Payload, timeout: Duration) -> Result<PendingCall> {
        expect_style(payload.kind(), PayloadStyle::Request)?;
        let kind = payload.kind();
        let envelope = Envelope::new(payload);
        let id = envelope.id();
        let (tx, rx) = oneshot::channel();
        self.inner.calls.lock().pending.insert(
            id,
            PendingEntry {
                tx,
                kind,
                started: Instant::now(),
            },
        );

        if let Err(err) = self.transmit(&envelope, MessageDirection::Outbound) {
            self.inner.calls.lock().pending.remove(&id);
            return Err(err);
        }

        Ok(PendingCall {
            id,
            timeout,
            rx,
            dispatcher: self.clone(),
            finished: false,
        })
    }

    /// Fire-and-forget a notification. No call is parked.
    pub fn notify(&self, payload: Payload) -> Result<CorrelationId> {
        expect_style(payload.kind(), PayloadStyle::Notification)?;
        let envelope = Envelope::new(payload);
        self.transmit(&envelope, MessageDirection::Outbound)?;
        Ok(envelope.id())
    }

    /// Withdraw a pending call. The peer is not told; a late reply is dropped.
    ///
    /// Returns false when `id` is not pending.
    pub fn cancel(&self, id: CorrelationId) -> bool {
        let entry = {
            let mut calls = self.inner.calls.lock();
            let entry = calls.pending.remove(&id);
            if entry.is_some() {
                calls.settle(id, CallState::Failed(CallFailure::Cancelled));
            }
            entry
        };
        let Some(entry) = entry else {
            return false;
        };
        Counters::bump(&self.inner.counters.cancelled);
        debug!(correlation_id = %id, request = entry.kind.tag(), "call cancelled");
        let _ = entry.tx.send(Err(MessagingError::Cancelled(id)));
        true
    }

    fn expire(&self, id: CorrelationId) -> bool {
        let entry = {
            let mut calls = self.inner.calls.lock();
            let entry = calls.pending.remove(&id);
            if entry.is_some() {
                calls.settle(id, CallState::Failed(CallFailure::Timeout));
            }
            entry
        };
        let Some(entry) = entry else {
            return false;
        };
        Counters::bump(&self.inner.counters.timeouts);
        if let Some(exporter) = &self.inner.exporter {
            exporter.observe_timeout();
        }
        debug!(correlation_id = %id, request = entry.kind.tag(), "call timed out");
        true
    }

    /// Inbound hook of the transport.
    ///
    /// Never fails: faults go to the diagnostic sink and processing continues
    /// with the next frame. Completes once the frame's handler, if any, has
    /// finished.
    pub async fn on_receive(&self, raw: JsonValue) {
        Counters::bump(&self.inner.counters.received);
        if let Some(exporter) = &self.inner.exporter {
            exporter.observe_received();
        }
        let id = wire_id(&raw).ok();
        if let Err(err) = self.ingest(raw).await {
            self.report(Diagnostic::from_error(id, &err));
        }
    }

    /// Feed every already queued frame through [`Dispatcher::on_receive`].
    ///
    /// Does not wait for new frames.
    pub async fn drain(&self, inbound: &mut InboundFrames) -> usize {
        let mut processed = 0;
        while let Some(frame) = inbound.try_recv() {
            self.on_receive(frame).await;
            processed += 1;
        }
        processed
    }

    /// Process inbound frames until the channel closes.
    pub async fn run(&self, mut inbound: InboundFrames) {
        debug!(transport = self.inner.transport.name(), "dispatcher loop started");
        while let Some(frame) = inbound.recv().await {
            self.on_receive(frame).await;
        }
        debug!(transport = self.inner.transport.name(), "inbound channel closed");
    }

    /// State of call `id`, if it is pending or still remembered.
    pub fn call_state(&self, id: CorrelationId) -> Option<CallState> {
        self.inner.calls.lock().state(&id)
    }

    /// Number of calls awaiting a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.calls.lock().pending.len()
    }

    /// Current counter snapshot.
    pub fn metrics(&self) -> DispatcherMetrics {
        self.inner.counters.snapshot()
    }

    async fn ingest(&self, raw: JsonValue) -> Result<()> {
        let envelope = Envelope::from_wire(raw, &self.inner.registry)?;
        log_envelope(MessageDirection::Inbound, &envelope);
        let id = envelope.id();

        let (entry, settled) = {
            let mut calls = self.inner.calls.lock();
            match calls.pending.remove(&id) {
                Some(entry) => {
                    calls.settle(id, CallState::Resolved);
                    (Some(entry), None)
                }
                None => (None, calls.settled.get(&id).copied()),
            }
        };
        if let Some(entry) = entry {
            self.resolve(entry, envelope);
            return Ok(());
        }

        match settled {
            Some(CallState::Resolved) => Err(MessagingError::DuplicateReply(id)),
            Some(CallState::Failed(failure)) => {
                debug!(correlation_id = %id, ?failure, "dropping late reply");
                Ok(())
            }
            // responses never have handlers: an unknown id is a reply whose
            // call has already left the settled history
            _ if envelope.kind().style() == PayloadStyle::Response => {
                debug!(
                    correlation_id = %id,
                    reply = envelope.kind().tag(),
                    "dropping reply to a forgotten call"
                );
                Ok(())
            }
            _ => self.dispatch(envelope).await,
        }
    }

    fn resolve(&self, entry: PendingEntry, envelope: Envelope) {
        let elapsed = entry.started.elapsed();
        Counters::bump(&self.inner.counters.replies);
        if let Some(exporter) = &self.inner.exporter {
            exporter.observe_latency(elapsed);
        }
        let (id, payload) = envelope.into_parts();
        debug!(
            correlation_id = %id,
            request = entry.kind.tag(),
            reply = payload.tag(),
            elapsed_us = elapsed.as_micros() as u64,
            "call resolved"
        );
        let outcome = match payload {
            Payload::Error { message, code } => Err(MessagingError::Remote { code, message }),
            other => Ok(other),
        };
        if entry.tx.send(outcome).is_err() {
            debug!(correlation_id = %id, "caller went away before the reply");
        }
    }

    async fn dispatch(&self, envelope: Envelope) -> Result<()> {
        let kind = envelope.kind();
        let handler = self.inner.handlers.read().get(&kind).cloned();
        let Some(handler) = handler else {
            return Err(MessagingError::UnhandledPayload(kind.tag()));
        };
        let id = envelope.id();
        let result = handler.call(envelope.payload()).await;

        if kind.style() != PayloadStyle::Request {
            if let Err(err) = result {
                self.handler_failed(id, kind, &err.message);
            }
            return Ok(());
        }

        let reply = match result {
            Ok(Some(reply)) if reply.kind().style() == PayloadStyle::Response => reply,
            Ok(Some(reply)) => {
                let message = format!("handler replied with non-response payload `{}`", reply.tag());
                self.handler_failed(id, kind, &message);
                Payload::Error {
                    message,
                    code: Some("invalid-reply".into()),
                }
            }
            Ok(None) => Payload::Done,
            Err(err) => {
                self.handler_failed(id, kind, &err.message);
                Payload::Error {
                    message: err.message,
                    code: err.code,
                }
            }
        };
        self.transmit(&Envelope::reply(id, reply), MessageDirection::Reply)
    }

    fn handler_failed(&self, id: CorrelationId, kind: PayloadKind, message: &str) {
        self.report(Diagnostic::new(
            DiagnosticKind::HandlerFailed,
            Some(id),
            format!("`{}` handler failed: {message}", kind.tag()),
        ));
    }

    fn transmit(&self, envelope: &Envelope, direction: MessageDirection) -> Result<()> {
        log_envelope(direction, envelope);
        self.inner.transport.transmit(envelope)?;
        Counters::bump(&self.inner.counters.sent);
        if let Some(exporter) = &self.inner.exporter {
            exporter.observe_sent();
        }
        Ok(())
    }

    fn report(&self, diagnostic: Diagnostic) {
        match diagnostic.kind {
            DiagnosticKind::UnhandledPayload => Counters::bump(&self.inner.counters.unhandled),
            DiagnosticKind::MalformedEnvelope => Counters::bump(&self.inner.counters.malformed),
            _ => {}
        }
        if let Some(exporter) = &self.inner.exporter {
            exporter.observe_diagnostic();
        }
        self.inner.sink.report(diagnostic);
    }
}

fn expect_style(kind: PayloadKind, expected: PayloadStyle) -> Result<()> {
    if kind.style() == expected {
        Ok(())
    } else {
        Err(MessagingError::StyleMismatch {
            tag: kind.tag(),
            expected,
            actual: kind.style(),
        })
    }
}

/// An outbound request awaiting its reply.
///
/// Dropping it before [`PendingCall::response`] completes cancels the call.
pub struct PendingCall {
    id: CorrelationId,
    timeout: Duration,
    rx: oneshot::Receiver<Result<Payload>>,
    dispatcher: Dispatcher,
    finished: bool,
}

impl PendingCall {
    /// Correlation id of the request.
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    /// Withdraw the call.
    pub fn cancel(mut self) -> bool {
        self.finished = true;
        self.dispatcher.cancel(self.id)
    }

    /// Wait for the reply, the deadline, or cancellation.
    pub async fn response(mut self) -> Result<Payload> {
        let outcome = match tokio::time::timeout(self.timeout, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_closed)) => Err(MessagingError::Cancelled(self.id)),
            Err(_elapsed) => {
                if self.dispatcher.expire(self.id) {
                    Err(MessagingError::Timeout {
                        id: self.id,
                        timeout: self.timeout,
                    })
                } else {
                    // settled between the deadline firing and the table lock
                    let id = self.id;
                    self.rx
                        .try_recv()
                        .unwrap_or_else(|_| Err(MessagingError::Cancelled(id)))
                }
            }
        };
        self.finished = true;
        outcome
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if !self.finished {
            self.dispatcher.cancel(self.id);
        }
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("id", &self.id)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
