//! ---
//! kless_section: "02-messaging-ipc"
//! kless_subsection: "module"
//! kless_type: "source"
//! kless_scope: "code"
//! kless_description: "Typed payloads, envelopes and dispatch between wallet contexts."
//! kless_version: "v0.0.0-prealpha"
//! kless_owner: "tbd"
//! ---
//! Payload variant registry and the narrowing predicates behind it.
//!
//! Predicates only look at the `type` discriminant. Structural decoding of the
//! remaining fields happens afterwards in [`PayloadRegistry::decode`].
use std::collections::HashSet;

use serde_json::Value;

use crate::types::{Payload, PayloadKind, PayloadStyle};
use crate::{MessagingError, Result};

/// Narrowing predicate over raw wire data.
pub type Predicate = fn(&Value) -> bool;

/// Returns true iff `value` is an object carrying a non-empty string `type`.
pub fn is_base_payload(value: &Value) -> bool {
    discriminant(value).is_some()
}

fn discriminant(value: &Value) -> Option<&str> {
    value
        .as_object()?
        .get("type")?
        .as_str()
        .filter(|tag| !tag.is_empty())
}

fn has_tag(value: &Value, kind: PayloadKind) -> bool {
    discriminant(value) == Some(kind.tag())
}

/// Narrows to `get-permission-requests`.
pub fn is_get_permission_requests(value: &Value) -> bool {
    has_tag(value, PayloadKind::GetPermissionRequests)
}

/// Narrows to `permission-requests`.
pub fn is_permission_requests(value: &Value) -> bool {
    has_tag(value, PayloadKind::PermissionRequests)
}

/// Narrows to `permission-response`.
pub fn is_permission_response(value: &Value) -> bool {
    has_tag(value, PayloadKind::PermissionResponse)
}

/// Narrows to `permission-requests-updated`.
pub fn is_permission_requests_updated(value: &Value) -> bool {
    has_tag(value, PayloadKind::PermissionRequestsUpdated)
}

/// Narrows to `done`.
pub fn is_done(value: &Value) -> bool {
    has_tag(value, PayloadKind::Done)
}

/// Narrows to `error`.
pub fn is_error(value: &Value) -> bool {
    has_tag(value, PayloadKind::Error)
}

/// Predicate for a given kind. Exhaustive so a new variant cannot be left out.
pub fn predicate_for(kind: PayloadKind) -> Predicate {
    match kind {
        PayloadKind::GetPermissionRequests => is_get_permission_requests,
        PayloadKind::PermissionRequests => is_permission_requests,
        PayloadKind::PermissionResponse => is_permission_response,
        PayloadKind::PermissionRequestsUpdated => is_permission_requests_updated,
        PayloadKind::Done => is_done,
        PayloadKind::Error => is_error,
    }
}

/// Everything the dispatcher needs to know about one variant.
#[derive(Debug, Clone, Copy)]
pub struct VariantDescriptor {
    /// Discriminant.
    pub kind: PayloadKind,
    /// Wire literal.
    pub tag: &'static str,
    /// Request, response or notification.
    pub style: PayloadStyle,
    /// Narrowing predicate over raw wire data.
    pub predicate: Predicate,
}

impl VariantDescriptor {
    /// Descriptor derived from the kind's own metadata.
    pub fn of(kind: PayloadKind) -> Self {
        Self {
            kind,
            tag: kind.tag(),
            style: kind.style(),
            predicate: predicate_for(kind),
        }
    }
}

/// Explicit registry of payload variants, built once and owned by a dispatcher.
#[derive(Debug, Clone)]
pub struct PayloadRegistry {
    variants: Vec<VariantDescriptor>,
}

impl PayloadRegistry {
    /// Build a registry from the provided descriptors, rejecting repeated tags.
    pub fn new(variants: impl IntoIterator<Item = VariantDescriptor>) -> Result<Self> {
        let variants: Vec<_> = variants.into_iter().collect();
        let mut seen = HashSet::new();
        for descriptor in &variants {
            if !seen.insert(descriptor.tag) {
                return Err(MessagingError::DuplicateVariant(descriptor.tag));
            }
        }
        Ok(Self { variants })
    }

    /// Registry holding every variant of [`Payload`].
    pub fn standard() -> Self {
        Self {
            variants: PayloadKind::ALL.into_iter().map(VariantDescriptor::of).collect(),
        }
    }

    /// Registered descriptors in registration order.
    pub fn variants(&self) -> &[VariantDescriptor] {
        &self.variants
    }

    /// Descriptor for `kind`, if registered.
    pub fn descriptor(&self, kind: PayloadKind) -> Option<&VariantDescriptor> {
        self.variants.iter().find(|d| d.kind == kind)
    }

    /// Try every predicate and return the kind whose discriminant matches.
    pub fn narrow(&self, value: &Value) -> Result<PayloadKind> {
        let Some(tag) = discriminant(value) else {
            return Err(MessagingError::MalformedEnvelope(
                "payload is missing a string `type` discriminant".into(),
            ));
        };
        self.variants
            .iter()
            .find(|descriptor| (descriptor.predicate)(value))
            .map(|descriptor| descriptor.kind)
            .ok_or_else(|| MessagingError::MalformedEnvelope(format!("unknown payload type `{tag}`")))
    }

    /// Narrow `value` and decode the variant's fields.
    pub fn decode(&self, value: Value) -> Result<Payload> {
        let kind = self.narrow(&value)?;
        let payload: Payload = serde_json::from_value(value).map_err(|err| {
            MessagingError::MalformedEnvelope(format!("invalid `{}` payload: {err}", kind.tag()))
        })?;
        debug_assert_eq!(payload.kind(), kind);
        Ok(payload)
    }
}

impl Default for PayloadRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shapeless_values() -> Vec<Value> {
        vec![
            Value::Null,
            json!(true),
            json!(42),
            json!("get-permission-requests"),
            json!(["get-permission-requests"]),
            json!({}),
            json!({ "type": "" }),
            json!({ "type": 7 }),
            json!({ "type": null }),
            json!({ "kind": "get-permission-requests" }),
        ]
    }

    #[test]
    fn base_payload_requires_non_empty_string_type() {
        assert!(is_base_payload(&json!({ "type": "anything" })));
        for value in shapeless_values() {
            assert!(!is_base_payload(&value), "accepted {value}");
        }
    }

    #[test]
    fn variant_predicates_reject_shapeless_values() {
        for value in shapeless_values() {
            for kind in PayloadKind::ALL {
                assert!(!predicate_for(kind)(&value), "{kind} accepted {value}");
            }
        }
    }

    #[test]
    fn each_predicate_accepts_only_its_own_tag() {
        for kind in PayloadKind::ALL {
            for other in PayloadKind::ALL {
                let value = json!({ "type": other.tag() });
                assert_eq!(predicate_for(kind)(&value), kind == other);
            }
            assert!(!predicate_for(kind)(&json!({ "type": "get-permission-request" })));
        }
    }

    #[test]
    fn narrow_reports_unknown_tags() {
        let registry = PayloadRegistry::standard();
        assert_eq!(
            registry
                .narrow(&json!({ "type": "get-permission-requests" }))
                .expect("known tag"),
            PayloadKind::GetPermissionRequests
        );
        assert!(matches!(
            registry.narrow(&json!({ "type": "sign-transaction" })),
            Err(MessagingError::MalformedEnvelope(reason)) if reason.contains("sign-transaction")
        ));
        assert!(matches!(
            registry.narrow(&Value::Null),
            Err(MessagingError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn narrowing_respects_the_registered_subset() {
        let registry = PayloadRegistry::new([VariantDescriptor::of(PayloadKind::Done)])
            .expect("single variant");
        assert!(registry.narrow(&json!({ "type": "done" })).is_ok());
        assert!(registry.narrow(&json!({ "type": "get-permission-requests" })).is_err());
    }

    #[test]
    fn duplicate_descriptors_are_rejected() {
        let result = PayloadRegistry::new([
            VariantDescriptor::of(PayloadKind::Done),
            VariantDescriptor::of(PayloadKind::Done),
        ]);
        assert!(matches!(result, Err(MessagingError::DuplicateVariant("done"))));
    }

    #[test]
    fn decode_checks_variant_fields() {
        let registry = PayloadRegistry::standard();
        let payload = registry
            .decode(json!({ "type": "error", "message": "boom" }))
            .expect("valid error payload");
        assert_eq!(
            payload,
            Payload::Error {
                message: "boom".into(),
                code: None
            }
        );

        let missing = registry.decode(json!({ "type": "permission-requests" }));
        assert!(matches!(missing, Err(MessagingError::MalformedEnvelope(_))));
    }
}
