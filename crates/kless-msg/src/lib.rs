//! ---
//! kless_section: "02-messaging-ipc"
//! kless_subsection: "module"
//! kless_type: "source"
//! kless_scope: "code"
//! kless_description: "Typed payloads, envelopes and dispatch between wallet contexts."
//! kless_version: "v0.0.0-prealpha"
//! kless_owner: "tbd"
//! ---
//! Messaging core shared by the wallet UI and the background controller.
//!
//! A caller builds a [`Payload`], the [`Dispatcher`] wraps it in an
//! [`Envelope`] with a fresh [`CorrelationId`] and hands it to a
//! [`Transport`]. The peer dispatcher narrows the payload through its
//! [`PayloadRegistry`], runs the handler registered for the discriminant and
//! replies under the same correlation id.
#![warn(missing_docs)]

use std::time::Duration;

pub mod diagnostics;
pub mod dispatcher;
pub mod envelope;
pub mod logging;
pub mod permissions;
pub mod registry;
pub mod transport;
pub mod types;

/// Shared result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Error taxonomy of the messaging protocol.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// No reply arrived within the caller supplied deadline.
    #[error("no reply to call {id} within {timeout:?}")]
    Timeout {
        /// Correlation id of the abandoned call.
        id: CorrelationId,
        /// Deadline that elapsed.
        timeout: Duration,
    },
    /// The caller withdrew interest before a reply arrived.
    #[error("call {0} was cancelled")]
    Cancelled(CorrelationId),
    /// An inbound payload has no handler registered for its discriminant.
    #[error("no handler registered for payload type `{0}`")]
    UnhandledPayload(&'static str),
    /// A second handler was registered for an occupied discriminant.
    #[error("a handler is already registered for payload type `{0}`")]
    DuplicateHandler(&'static str),
    /// Inbound data is not a valid envelope or names an unknown variant.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    /// Two registry descriptors claim the same discriminant.
    #[error("payload type `{0}` is described more than once")]
    DuplicateVariant(&'static str),
    /// The payload type is not part of this dispatcher's registry.
    #[error("payload type `{0}` is not in the registry")]
    UnknownVariant(&'static str),
    /// A payload was used in a role its variant does not support.
    #[error("payload type `{tag}` is a {actual}, expected a {expected}")]
    StyleMismatch {
        /// Discriminant of the offending payload.
        tag: &'static str,
        /// Style the operation required.
        expected: types::PayloadStyle,
        /// Style the variant actually has.
        actual: types::PayloadStyle,
    },
    /// A reply arrived for a call that already resolved.
    #[error("duplicate reply for already resolved call {0}")]
    DuplicateReply(CorrelationId),
    /// The remote handler failed and answered with an error payload.
    #[error("remote handler failed: {message}")]
    Remote {
        /// Optional machine readable error code.
        code: Option<String>,
        /// Human readable failure description.
        message: String,
    },
    /// A reply carried a variant the caller did not ask for.
    #[error("unexpected reply `{actual}`, expected `{expected}`")]
    UnexpectedReply {
        /// Discriminant the caller expected.
        expected: &'static str,
        /// Discriminant that arrived.
        actual: &'static str,
    },
    /// The transport can no longer deliver envelopes.
    #[error("transport `{0}` is closed")]
    TransportClosed(&'static str),
    /// Wrapper for JSON serialization or deserialization problems.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub use diagnostics::{Diagnostic, DiagnosticKind, DiagnosticSink, MemorySink, TracingSink};
pub use dispatcher::{
    CallFailure, CallState, Dispatcher, DispatcherBuilder, DispatcherMetrics, HandlerError,
    HandlerResult, PendingCall,
};
pub use envelope::{CorrelationId, Envelope};
pub use logging::{log_envelope, MessageDirection, MessagingMetricsExporter};
pub use permissions::{
    broadcast_pending, register_permission_handlers, InMemoryPermissionStore, PermissionClient,
    PermissionError, PermissionStore,
};
pub use registry::{is_base_payload, PayloadRegistry, VariantDescriptor};
pub use transport::{ChannelEnd, InMemoryTransport, InboundFrames, Transport};
pub use types::{Payload, PayloadKind, PayloadStyle, PermissionRequest, PermissionType};
