//! ---
//! kless_section: "02-messaging-ipc"
//! kless_subsection: "module"
//! kless_type: "source"
//! kless_scope: "code"
//! kless_description: "Typed payloads, envelopes and dispatch between wallet contexts."
//! kless_version: "v0.0.0-prealpha"
//! kless_owner: "tbd"
//! ---
//! Non-fatal protocol faults. The dispatcher reports them here and keeps going.
use parking_lot::Mutex;
use tracing::warn;

use crate::envelope::CorrelationId;
use crate::MessagingError;

/// Classification of a reported fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum DiagnosticKind {
    /// Known payload type without a registered handler.
    UnhandledPayload,
    /// Inbound data that is not a valid envelope.
    MalformedEnvelope,
    /// Second reply for a call that already resolved.
    DuplicateReply,
    /// A handler returned an error.
    HandlerFailed,
    /// An envelope could not be handed to the transport.
    TransmitFailed,
}

/// A single reported fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Fault classification.
    pub kind: DiagnosticKind,
    /// Correlation id of the offending envelope, when one could be read.
    pub id: Option<CorrelationId>,
    /// Human readable detail.
    pub detail: String,
}

impl Diagnostic {
    /// Build a diagnostic.
    pub fn new(kind: DiagnosticKind, id: Option<CorrelationId>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            id,
            detail: detail.into(),
        }
    }

    /// Classify a messaging error raised while processing an inbound envelope.
    pub fn from_error(id: Option<CorrelationId>, error: &MessagingError) -> Self {
        let kind = match error {
            MessagingError::UnhandledPayload(_) => DiagnosticKind::UnhandledPayload,
            MessagingError::DuplicateReply(_) => DiagnosticKind::DuplicateReply,
            MessagingError::TransportClosed(_) => DiagnosticKind::TransmitFailed,
            MessagingError::Remote { .. } => DiagnosticKind::HandlerFailed,
            _ => DiagnosticKind::MalformedEnvelope,
        };
        Self::new(kind, id, error.to_string())
    }
}

/// Process-wide receiver of protocol faults.
pub trait DiagnosticSink: Send + Sync {
    /// Record a fault. Must not panic.
    fn report(&self, diagnostic: Diagnostic);
}

/// Sink that emits each fault as a structured `warn` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn report(&self, diagnostic: Diagnostic) {
        warn!(
            kind = diagnostic.kind.as_ref(),
            correlation_id = diagnostic.id.map(|id| id.to_string()).unwrap_or_default(),
            detail = %diagnostic.detail,
            "messaging diagnostic"
        );
    }
}

/// Sink that keeps every fault in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Mutex<Vec<Diagnostic>>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything reported so far.
    pub fn snapshot(&self) -> Vec<Diagnostic> {
        self.entries.lock().clone()
    }

    /// Kinds reported so far, in order.
    pub fn kinds(&self) -> Vec<DiagnosticKind> {
        self.entries.lock().iter().map(|d| d.kind).collect()
    }

    /// Number of faults reported.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing has been reported.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl DiagnosticSink for MemorySink {
    fn report(&self, diagnostic: Diagnostic) {
        self.entries.lock().push(diagnostic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_onto_diagnostic_kinds() {
        let id = CorrelationId::new();
        let unhandled = Diagnostic::from_error(
            Some(id),
            &MessagingError::UnhandledPayload("permission-response"),
        );
        assert_eq!(unhandled.kind, DiagnosticKind::UnhandledPayload);
        assert!(unhandled.detail.contains("permission-response"));

        let malformed =
            Diagnostic::from_error(None, &MessagingError::MalformedEnvelope("no id".into()));
        assert_eq!(malformed.kind, DiagnosticKind::MalformedEnvelope);
        assert_eq!(malformed.id, None);

        let duplicate = Diagnostic::from_error(Some(id), &MessagingError::DuplicateReply(id));
        assert_eq!(duplicate.kind, DiagnosticKind::DuplicateReply);
    }

    #[test]
    fn memory_sink_collects_in_order() {
        let sink = MemorySink::new();
        assert!(sink.is_empty());
        sink.report(Diagnostic::new(DiagnosticKind::TransmitFailed, None, "closed"));
        sink.report(Diagnostic::new(DiagnosticKind::HandlerFailed, None, "boom"));
        assert_eq!(
            sink.kinds(),
            vec![DiagnosticKind::TransmitFailed, DiagnosticKind::HandlerFailed]
        );
        assert_eq!(sink.len(), 2);
    }

    #[test]
    fn tracing_sink_does_not_panic() {
        TracingSink.report(Diagnostic::new(
            DiagnosticKind::UnhandledPayload,
            Some(CorrelationId::new()),
            "no handler",
        ));
    }
}
