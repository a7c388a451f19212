//! ---
//! kless_section: "02-messaging-ipc"
//! kless_subsection: "module"
//! kless_type: "source"
//! kless_scope: "code"
//! kless_description: "Typed payloads, envelopes and dispatch between wallet contexts."
//! kless_version: "v0.0.0-prealpha"
//! kless_owner: "tbd"
//! ---
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::registry::PayloadRegistry;
use crate::types::{Payload, PayloadKind};
use crate::{MessagingError, Result};

/// Identifier pairing a request envelope with its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for CorrelationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Transport wrapper around exactly one payload.
///
/// Wire shape: `{ "id": string, "payload": { "type": string, ... } }`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    id: CorrelationId,
    payload: Payload,
}

impl Envelope {
    /// Wrap `payload` under a freshly generated correlation id.
    pub fn new(payload: Payload) -> Self {
        Self {
            id: CorrelationId::new(),
            payload,
        }
    }

    /// Wrap a reply under the id of the request it answers.
    pub fn reply(id: CorrelationId, payload: Payload) -> Self {
        Self { id, payload }
    }

    /// Correlation id.
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    /// Carried payload.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Discriminant of the carried payload.
    pub fn kind(&self) -> PayloadKind {
        self.payload.kind()
    }

    /// Consume the envelope, returning its parts.
    pub fn into_parts(self) -> (CorrelationId, Payload) {
        (self.id, self.payload)
    }

    /// Serialize into the JSON wire shape.
    pub fn to_wire(&self) -> Result<JsonValue> {
        Ok(serde_json::to_value(self)?)
    }

    /// Parse and validate raw wire data against `registry`.
    pub fn from_wire(raw: JsonValue, registry: &PayloadRegistry) -> Result<Self> {
        let id = wire_id(&raw)?;
        let payload = match raw {
            JsonValue::Object(mut fields) => fields.remove("payload"),
            _ => None,
        }
        .ok_or_else(|| MessagingError::MalformedEnvelope(format!("envelope {id} has no payload")))?;
        let payload = registry.decode(payload)?;
        Ok(Self { id, payload })
    }
}

/// Best-effort correlation id of raw wire data.
pub fn wire_id(raw: &JsonValue) -> Result<CorrelationId> {
    let Some(fields) = raw.as_object() else {
        return Err(MessagingError::MalformedEnvelope(
            "envelope is not an object".into(),
        ));
    };
    let id = fields.get("id").and_then(JsonValue::as_str).ok_or_else(|| {
        MessagingError::MalformedEnvelope("envelope is missing a string `id`".into())
    })?;
    id.parse().map_err(|err| {
        MessagingError::MalformedEnvelope(format!("invalid correlation id `{id}`: {err}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::is_get_permission_requests;
    use serde_json::json;

    #[test]
    fn fresh_envelopes_get_distinct_ids() {
        let first = Envelope::new(Payload::GetPermissionRequests);
        let second = Envelope::new(Payload::GetPermissionRequests);
        assert_ne!(first.id(), second.id());
    }

    #[test]
    fn wire_roundtrip_preserves_variant() {
        let registry = PayloadRegistry::standard();
        let envelope = Envelope::new(Payload::GetPermissionRequests);
        let wire = envelope.to_wire().expect("serialize");

        assert_eq!(wire["id"], envelope.id().to_string());
        assert!(is_get_permission_requests(&wire["payload"]));

        let text = serde_json::to_string(&wire).expect("encode");
        let parsed: JsonValue = serde_json::from_str(&text).expect("decode");
        let back = Envelope::from_wire(parsed, &registry).expect("valid envelope");
        assert_eq!(back, envelope);
    }

    #[test]
    fn replies_keep_the_request_id() {
        let request = Envelope::new(Payload::GetPermissionRequests);
        let reply = Envelope::reply(request.id(), Payload::Done);
        assert_eq!(reply.id(), request.id());
        assert_eq!(reply.kind(), PayloadKind::Done);
    }

    #[test]
    fn from_wire_rejects_bad_shapes() {
        let registry = PayloadRegistry::standard();
        let id = CorrelationId::new().to_string();
        let cases = [
            json!(null),
            json!({ "payload": { "type": "done" } }),
            json!({ "id": "not-a-uuid", "payload": { "type": "done" } }),
            json!({ "id": id }),
            json!({ "id": id, "payload": { "kind": "done" } }),
            json!({ "id": id, "payload": { "type": "mystery" } }),
        ];
        for case in cases {
            assert!(
                matches!(
                    Envelope::from_wire(case.clone(), &registry),
                    Err(MessagingError::MalformedEnvelope(_))
                ),
                "accepted {case}"
            );
        }
    }
}
