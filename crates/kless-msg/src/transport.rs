//! ---
//! kless_section: "02-messaging-ipc"
//! kless_subsection: "module"
//! kless_type: "source"
//! kless_scope: "code"
//! kless_description: "Typed payloads, envelopes and dispatch between wallet contexts."
//! kless_version: "v0.0.0-prealpha"
//! kless_owner: "tbd"
//! ---
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

use crate::{Envelope, MessagingError, Result};

/// Send primitive of the channel linking two wallet contexts.
///
/// Implementations must deliver reliably and in order. Framing, encryption and
/// retries belong to the implementation, not to the dispatcher.
pub trait Transport: Send + Sync {
    /// Hand an envelope to the channel.
    fn transmit(&self, envelope: &Envelope) -> Result<()>;
    /// Human-readable transport name for logging/metrics.
    fn name(&self) -> &'static str;
}

/// Raw frames delivered to the local context, in transport order.
#[derive(Debug)]
pub struct InboundFrames {
    rx: mpsc::UnboundedReceiver<JsonValue>,
}

impl InboundFrames {
    /// Wrap a receiving half of a frame channel.
    pub fn new(rx: mpsc::UnboundedReceiver<JsonValue>) -> Self {
        Self { rx }
    }

    /// Wait for the next frame. `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<JsonValue> {
        self.rx.recv().await
    }

    /// Next frame if one is already queued.
    pub fn try_recv(&mut self) -> Option<JsonValue> {
        self.rx.try_recv().ok()
    }
}

/// One side of an in-memory channel: what it sends with and what it receives.
#[derive(Debug)]
pub struct ChannelEnd {
    /// Transmits into the peer's inbound queue.
    pub transport: InMemoryTransport,
    /// Frames the peer transmitted.
    pub inbound: InboundFrames,
}

/// In-memory transport that queues wire frames for the peer context.
#[derive(Debug, Clone)]
pub struct InMemoryTransport {
    peer: mpsc::UnboundedSender<JsonValue>,
}

impl InMemoryTransport {
    /// Create two linked channel ends.
    pub fn pair() -> (ChannelEnd, ChannelEnd) {
        let (to_left, left_rx) = mpsc::unbounded_channel();
        let (to_right, right_rx) = mpsc::unbounded_channel();
        let left = ChannelEnd {
            transport: Self { peer: to_right },
            inbound: InboundFrames::new(left_rx),
        };
        let right = ChannelEnd {
            transport: Self { peer: to_left },
            inbound: InboundFrames::new(right_rx),
        };
        (left, right)
    }
}

impl Transport for InMemoryTransport {
    fn transmit(&self, envelope: &Envelope) -> Result<()> {
        let frame = envelope.to_wire()?;
        self.peer
            .send(frame)
            .map_err(|_| MessagingError::TransportClosed(self.name()))
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Payload;

    #[test]
    fn frames_cross_to_the_peer_in_order() {
        let (mut left, mut right) = InMemoryTransport::pair();
        let first = Envelope::new(Payload::GetPermissionRequests);
        let second = Envelope::new(Payload::Done);

        left.transport.transmit(&first).expect("transmit first");
        left.transport.transmit(&second).expect("transmit second");

        assert!(left.inbound.try_recv().is_none());
        let received: Vec<_> = std::iter::from_fn(|| right.inbound.try_recv()).collect();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0]["id"], first.id().to_string());
        assert_eq!(received[1]["payload"]["type"], "done");
    }

    #[test]
    fn transmit_fails_once_peer_is_gone() {
        let (left, right) = InMemoryTransport::pair();
        drop(right);
        let envelope = Envelope::new(Payload::Done);
        assert!(matches!(
            left.transport.transmit(&envelope),
            Err(MessagingError::TransportClosed("in_memory"))
        ));
    }
}
