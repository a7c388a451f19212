//! ---
//! kless_section: "02-messaging-ipc"
//! kless_subsection: "module"
//! kless_type: "source"
//! kless_scope: "code"
//! kless_description: "Typed payloads, envelopes and dispatch between wallet contexts."
//! kless_version: "v0.0.0-prealpha"
//! kless_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Closed set of payloads exchanged between wallet contexts.
///
/// The `type` field is the sole discriminant on the wire. Every variant has a
/// matching [`PayloadKind`]; the exhaustive match in [`PayloadKind::of`] keeps
/// the two in lockstep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Payload {
    /// Ask the background controller for every outstanding permission request.
    GetPermissionRequests,
    /// Outstanding permission requests, answering [`Payload::GetPermissionRequests`].
    PermissionRequests {
        /// Requests still awaiting a user decision.
        requests: Vec<PermissionRequest>,
    },
    /// The user's decision on one pending permission request.
    PermissionResponse {
        /// Identifier of the permission request being answered.
        id: Uuid,
        /// Accounts the user chose to expose to the origin.
        #[serde(default)]
        accounts: Vec<String>,
        /// Whether the request was approved.
        allowed: bool,
        /// When the user answered.
        response_date: DateTime<Utc>,
    },
    /// Broadcast whenever the pending permission set changes.
    PermissionRequestsUpdated {
        /// The pending set after the change.
        requests: Vec<PermissionRequest>,
    },
    /// Acknowledges a request that produces no data.
    Done,
    /// A handler failed while serving a request.
    Error {
        /// Human readable failure description.
        message: String,
        /// Optional machine readable error code.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl Payload {
    /// Discriminant of this payload.
    pub fn kind(&self) -> PayloadKind {
        PayloadKind::of(self)
    }

    /// Wire tag of this payload.
    pub fn tag(&self) -> &'static str {
        self.kind().tag()
    }
}

/// Role a payload variant plays in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum PayloadStyle {
    /// Expects a reply carrying the same correlation id.
    Request,
    /// Answers a request; only ever matched against a pending call.
    Response,
    /// Fire-and-forget; never answered.
    Notification,
}

/// Field-less discriminant of [`Payload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PayloadKind {
    /// `get-permission-requests`
    GetPermissionRequests,
    /// `permission-requests`
    PermissionRequests,
    /// `permission-response`
    PermissionResponse,
    /// `permission-requests-updated`
    PermissionRequestsUpdated,
    /// `done`
    Done,
    /// `error`
    Error,
}

impl PayloadKind {
    /// Every known variant, in registry order.
    pub const ALL: [PayloadKind; 6] = [
        PayloadKind::GetPermissionRequests,
        PayloadKind::PermissionRequests,
        PayloadKind::PermissionResponse,
        PayloadKind::PermissionRequestsUpdated,
        PayloadKind::Done,
        PayloadKind::Error,
    ];

    /// Discriminant of the provided payload.
    pub fn of(payload: &Payload) -> Self {
        match payload {
            Payload::GetPermissionRequests => PayloadKind::GetPermissionRequests,
            Payload::PermissionRequests { .. } => PayloadKind::PermissionRequests,
            Payload::PermissionResponse { .. } => PayloadKind::PermissionResponse,
            Payload::PermissionRequestsUpdated { .. } => PayloadKind::PermissionRequestsUpdated,
            Payload::Done => PayloadKind::Done,
            Payload::Error { .. } => PayloadKind::Error,
        }
    }

    /// Literal carried in the `type` field on the wire.
    pub const fn tag(self) -> &'static str {
        match self {
            PayloadKind::GetPermissionRequests => "get-permission-requests",
            PayloadKind::PermissionRequests => "permission-requests",
            PayloadKind::PermissionResponse => "permission-response",
            PayloadKind::PermissionRequestsUpdated => "permission-requests-updated",
            PayloadKind::Done => "done",
            PayloadKind::Error => "error",
        }
    }

    /// Role of the variant.
    pub const fn style(self) -> PayloadStyle {
        match self {
            PayloadKind::GetPermissionRequests | PayloadKind::PermissionResponse => {
                PayloadStyle::Request
            }
            PayloadKind::PermissionRequests | PayloadKind::Done | PayloadKind::Error => {
                PayloadStyle::Response
            }
            PayloadKind::PermissionRequestsUpdated => PayloadStyle::Notification,
        }
    }

    /// Reverse lookup of [`PayloadKind::tag`].
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }
}

impl std::fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Capability a dapp origin asks the wallet to grant.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum PermissionType {
    /// Read the addresses of connected accounts.
    ViewAccount,
    /// Propose transactions for the user to sign.
    SuggestTransactions,
    /// Propose arbitrary messages for the user to sign.
    SuggestSignMessages,
}

/// Permission request raised by a dapp origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    /// Identifier of the request.
    pub id: Uuid,
    /// Origin (scheme + host) of the requesting dapp.
    pub origin: String,
    /// Favicon advertised by the origin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fav_icon: Option<String>,
    /// Accounts granted once the request is answered.
    #[serde(default)]
    pub accounts: Vec<String>,
    /// `None` while pending, the user's decision afterwards.
    #[serde(default)]
    pub allowed: Option<bool>,
    /// Capabilities being requested.
    pub permissions: Vec<PermissionType>,
    /// When the request was raised.
    pub created_date: DateTime<Utc>,
    /// When the user answered.
    #[serde(default)]
    pub response_date: Option<DateTime<Utc>>,
}

impl PermissionRequest {
    /// Raise a new pending request for `origin`.
    pub fn new(origin: impl Into<String>, permissions: Vec<PermissionType>) -> Self {
        Self {
            id: Uuid::new_v4(),
            origin: origin.into(),
            fav_icon: None,
            accounts: Vec::new(),
            allowed: None,
            permissions,
            created_date: Utc::now(),
            response_date: None,
        }
    }

    /// Attach a favicon url.
    pub fn with_fav_icon(mut self, fav_icon: impl Into<String>) -> Self {
        self.fav_icon = Some(fav_icon.into());
        self
    }

    /// Whether the user has not decided yet.
    pub fn is_pending(&self) -> bool {
        self.allowed.is_none()
    }
}
