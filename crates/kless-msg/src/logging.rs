//! ---
//! kless_section: "02-messaging-ipc"
//! kless_subsection: "module"
//! kless_type: "source"
//! kless_scope: "code"
//! kless_description: "Typed payloads, envelopes and dispatch between wallet contexts."
//! kless_version: "v0.0.0-prealpha"
//! kless_owner: "tbd"
//! ---
use std::time::Duration;

use prometheus::{Histogram, HistogramOpts, IntCounter, Opts, Registry};
use tracing::debug;

use crate::Envelope;

/// Direction of the envelope movement, used for consistent logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    /// Envelope handed to the transport.
    Outbound,
    /// Envelope received from the transport.
    Inbound,
    /// Reply sent back under a request's correlation id.
    Reply,
}

/// Emit a structured log entry for envelope activity.
pub fn log_envelope(direction: MessageDirection, envelope: &Envelope) {
    debug!(
        correlation_id = %envelope.id(),
        payload_type = envelope.kind().tag(),
        style = %envelope.kind().style(),
        direction = ?direction,
        "messaging activity"
    );
}

/// Prometheus metric handles for dispatcher activity.
#[derive(Clone)]
pub struct MessagingMetricsExporter {
    sent: IntCounter,
    received: IntCounter,
    timed_out: IntCounter,
    diagnostics: IntCounter,
    latency: Histogram,
}

impl MessagingMetricsExporter {
    /// Register messaging metrics with the provided registry.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let sent = IntCounter::with_opts(Opts::new(
            "envelopes_sent_total",
            "Envelopes handed to the transport",
        ))?;
        let received = IntCounter::with_opts(Opts::new(
            "envelopes_received_total",
            "Frames delivered by the transport",
        ))?;
        let timed_out = IntCounter::with_opts(Opts::new(
            "calls_timed_out_total",
            "Calls that failed without a reply",
        ))?;
        let diagnostics = IntCounter::with_opts(Opts::new(
            "diagnostics_reported_total",
            "Protocol faults reported to the diagnostic sink",
        ))?;
        let latency = Histogram::with_opts(HistogramOpts::new(
            "call_roundtrip_latency_seconds",
            "Observed latency between request and matching reply",
        ))?;

        registry.register(Box::new(sent.clone()))?;
        registry.register(Box::new(received.clone()))?;
        registry.register(Box::new(timed_out.clone()))?;
        registry.register(Box::new(diagnostics.clone()))?;
        registry.register(Box::new(latency.clone()))?;

        Ok(Self {
            sent,
            received,
            timed_out,
            diagnostics,
            latency,
        })
    }

    /// Record a transmitted envelope.
    pub fn observe_sent(&self) {
        self.sent.inc();
    }

    /// Record a received frame.
    pub fn observe_received(&self) {
        self.received.inc();
    }

    /// Record a timed out call.
    pub fn observe_timeout(&self) {
        self.timed_out.inc();
    }

    /// Record a reported diagnostic.
    pub fn observe_diagnostic(&self) {
        self.diagnostics.inc();
    }

    /// Record call latency.
    pub fn observe_latency(&self, duration: Duration) {
        self.latency.observe(duration.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Payload;

    #[test]
    fn metrics_exporter_records_counts() {
        let registry = Registry::new();
        let metrics = MessagingMetricsExporter::register(&registry).expect("register metrics");
        metrics.observe_sent();
        metrics.observe_received();
        metrics.observe_timeout();
        metrics.observe_diagnostic();
        metrics.observe_latency(Duration::from_millis(10));

        let families = registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "envelopes_sent_total"));
        assert!(families
            .iter()
            .any(|f| f.get_name() == "calls_timed_out_total"));
    }

    #[test]
    fn double_registration_is_rejected() {
        let registry = Registry::new();
        MessagingMetricsExporter::register(&registry).expect("first registration");
        assert!(MessagingMetricsExporter::register(&registry).is_err());
    }

    #[test]
    fn log_envelope_does_not_panic() {
        log_envelope(
            MessageDirection::Outbound,
            &Envelope::new(Payload::GetPermissionRequests),
        );
    }
}
