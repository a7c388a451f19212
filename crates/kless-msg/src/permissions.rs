//! ---
//! kless_section: "02-messaging-ipc"
//! kless_subsection: "module"
//! kless_type: "source"
//! kless_scope: "code"
//! kless_description: "Typed payloads, envelopes and dispatch between wallet contexts."
//! kless_version: "v0.0.0-prealpha"
//! kless_owner: "tbd"
//! ---
//! Permission request flow between the UI and the background controller.
//!
//! The background context owns a [`PermissionStore`] and serves it through
//! [`register_permission_handlers`]; the UI talks to it with a
//! [`PermissionClient`].
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::dispatcher::{Dispatcher, HandlerError};
use crate::envelope::CorrelationId;
use crate::types::{Payload, PayloadKind, PermissionRequest};
use crate::{MessagingError, Result};

/// Failure answering a permission request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PermissionError {
    /// No request with this id exists.
    #[error("permission request {0} does not exist")]
    NotFound(Uuid),
    /// The request was answered before.
    #[error("permission request {0} was already answered")]
    AlreadyResolved(Uuid),
}

impl PermissionError {
    /// Machine readable code carried in `error` replies.
    pub fn code(&self) -> &'static str {
        match self {
            PermissionError::NotFound(_) => "permission-not-found",
            PermissionError::AlreadyResolved(_) => "permission-already-resolved",
        }
    }
}

impl From<PermissionError> for HandlerError {
    fn from(err: PermissionError) -> Self {
        HandlerError::with_code(err.code(), err.to_string())
    }
}

/// Storage of permission requests, owned by the background controller.
pub trait PermissionStore: Send + Sync {
    /// Requests still awaiting a decision, oldest first. Must not mutate.
    fn pending(&self) -> Vec<PermissionRequest>;

    /// Record the user's decision on request `id`.
    fn respond(
        &self,
        id: Uuid,
        accounts: Vec<String>,
        allowed: bool,
        responded_at: DateTime<Utc>,
    ) -> std::result::Result<PermissionRequest, PermissionError>;
}

/// Insertion-ordered in-memory store.
#[derive(Debug, Default)]
pub struct InMemoryPermissionStore {
    requests: RwLock<IndexMap<Uuid, PermissionRequest>>,
}

impl InMemoryPermissionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a request, returning its id.
    pub fn insert(&self, request: PermissionRequest) -> Uuid {
        let id = request.id;
        info!(permission_id = %id, origin = %request.origin, "permission request raised");
        self.requests.write().insert(id, request);
        id
    }

    /// Look up a request regardless of its state.
    pub fn get(&self, id: Uuid) -> Option<PermissionRequest> {
        self.requests.read().get(&id).cloned()
    }

    /// Number of stored requests, answered or not.
    pub fn len(&self) -> usize {
        self.requests.read().len()
    }

    /// Whether the store holds no requests.
    pub fn is_empty(&self) -> bool {
        self.requests.read().is_empty()
    }
}

impl PermissionStore for InMemoryPermissionStore {
    fn pending(&self) -> Vec<PermissionRequest> {
        self.requests
            .read()
            .values()
            .filter(|request| request.is_pending())
            .cloned()
            .collect()
    }

    fn respond(
        &self,
        id: Uuid,
        accounts: Vec<String>,
        allowed: bool,
        responded_at: DateTime<Utc>,
    ) -> std::result::Result<PermissionRequest, PermissionError> {
        let mut requests = self.requests.write();
        let request = requests
            .get_mut(&id)
            .ok_or(PermissionError::NotFound(id))?;
        if !request.is_pending() {
            return Err(PermissionError::AlreadyResolved(id));
        }
        request.accounts = if allowed { accounts } else { Vec::new() };
        request.allowed = Some(allowed);
        request.response_date = Some(responded_at);
        info!(permission_id = %id, allowed, "permission request answered");
        Ok(request.clone())
    }
}

/// Serve `store` on `dispatcher`.
///
/// `get-permission-requests` only reports the pending set, so repeated
/// queries are safe to retry. `permission-response` records a decision and
/// answers `done`.
pub fn register_permission_handlers(
    dispatcher: &Dispatcher,
    store: Arc<dyn PermissionStore>,
) -> Result<()> {
    let reader = Arc::clone(&store);
    dispatcher.register_handler(PayloadKind::GetPermissionRequests, move |_: &Payload| {
        Ok(Some(Payload::PermissionRequests {
            requests: reader.pending(),
        }))
    })?;

    dispatcher.register_handler(PayloadKind::PermissionResponse, move |payload: &Payload| {
        let Payload::PermissionResponse {
            id,
            accounts,
            allowed,
            response_date,
        } = payload
        else {
            return Err(HandlerError::unexpected(payload.kind()));
        };
        store.respond(*id, accounts.clone(), *allowed, *response_date)?;
        Ok(Some(Payload::Done))
    })?;
    Ok(())
}

/// Tell the peer context that the pending set changed.
pub fn broadcast_pending(
    dispatcher: &Dispatcher,
    store: &dyn PermissionStore,
) -> Result<CorrelationId> {
    dispatcher.notify(Payload::PermissionRequestsUpdated {
        requests: store.pending(),
    })
}

/// UI-side view of the permission flow.
#[derive(Clone)]
pub struct PermissionClient {
    dispatcher: Dispatcher,
    timeout: Duration,
}

impl PermissionClient {
    /// Client issuing calls through `dispatcher` with a per-call `timeout`.
    pub fn new(dispatcher: Dispatcher, timeout: Duration) -> Self {
        Self {
            dispatcher,
            timeout,
        }
    }

    /// Ask the background controller for every pending request.
    pub async fn pending_requests(&self) -> Result<Vec<PermissionRequest>> {
        match self
            .dispatcher
            .send(Payload::GetPermissionRequests, self.timeout)
            .await?
        {
            Payload::PermissionRequests { requests } => Ok(requests),
            other => Err(unexpected(PayloadKind::PermissionRequests, &other)),
        }
    }

    /// Answer pending request `id`.
    pub async fn respond(&self, id: Uuid, accounts: Vec<String>, allowed: bool) -> Result<()> {
        let payload = Payload::PermissionResponse {
            id,
            accounts,
            allowed,
            response_date: Utc::now(),
        };
        match self.dispatcher.send(payload, self.timeout).await? {
            Payload::Done => Ok(()),
            other => Err(unexpected(PayloadKind::Done, &other)),
        }
    }
}

fn unexpected(expected: PayloadKind, actual: &Payload) -> MessagingError {
    MessagingError::UnexpectedReply {
        expected: expected.tag(),
        actual: actual.tag(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PermissionType;

    fn store_with(origins: &[&str]) -> InMemoryPermissionStore {
        let store = InMemoryPermissionStore::new();
        for origin in origins {
            store.insert(PermissionRequest::new(
                *origin,
                vec![PermissionType::ViewAccount],
            ));
        }
        store
    }

    #[test]
    fn pending_keeps_insertion_order_and_does_not_consume() {
        let store = store_with(&["https://a.example", "https://b.example"]);
        let first = store.pending();
        let second = store.pending();
        assert_eq!(first, second);
        let origins: Vec<_> = first.iter().map(|r| r.origin.as_str()).collect();
        assert_eq!(origins, ["https://a.example", "https://b.example"]);
    }

    #[test]
    fn responding_removes_from_pending() {
        let store = store_with(&["https://a.example"]);
        let id = store.pending()[0].id;
        let answered = store
            .respond(id, vec!["0xabc".into()], true, Utc::now())
            .expect("respond");
        assert_eq!(answered.allowed, Some(true));
        assert_eq!(answered.accounts, vec!["0xabc".to_string()]);
        assert!(store.pending().is_empty());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn rejected_requests_expose_no_accounts() {
        let store = store_with(&["https://a.example"]);
        let id = store.pending()[0].id;
        let answered = store
            .respond(id, vec!["0xabc".into()], false, Utc::now())
            .expect("respond");
        assert!(answered.accounts.is_empty());
    }

    #[test]
    fn respond_rejects_unknown_and_answered_requests() {
        let store = store_with(&["https://a.example"]);
        let missing = Uuid::new_v4();
        assert_eq!(
            store.respond(missing, vec![], true, Utc::now()),
            Err(PermissionError::NotFound(missing))
        );

        let id = store.pending()[0].id;
        store.respond(id, vec![], false, Utc::now()).expect("first answer");
        let again = store.respond(id, vec![], true, Utc::now());
        assert_eq!(again, Err(PermissionError::AlreadyResolved(id)));
        assert_eq!(again.unwrap_err().code(), "permission-already-resolved");
    }

    #[test]
    fn permission_errors_carry_codes_into_handler_errors() {
        let id = Uuid::new_v4();
        let handler_error = HandlerError::from(PermissionError::NotFound(id));
        assert_eq!(handler_error.code.as_deref(), Some("permission-not-found"));
        assert!(handler_error.message.contains(&id.to_string()));
    }
}
