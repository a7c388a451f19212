//! ---
//! kless_section: "02-messaging-ipc"
//! kless_subsection: "tests"
//! kless_type: "source"
//! kless_scope: "code"
//! kless_description: "Permission flow between two contexts over the in-memory channel."
//! kless_version: "v0.0.0-prealpha"
//! kless_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use kless_msg::types::{PermissionRequest, PermissionType};
use kless_msg::{
    broadcast_pending, register_permission_handlers, Dispatcher, InMemoryPermissionStore,
    InMemoryTransport, MemorySink, MessagingError, Payload, PayloadKind, PayloadRegistry,
    PermissionClient, PermissionStore,
};
use tokio::sync::mpsc;

const CALL_TIMEOUT: Duration = Duration::from_secs(5);

struct Contexts {
    ui: Dispatcher,
    background: Dispatcher,
    store: Arc<InMemoryPermissionStore>,
    ui_sink: Arc<MemorySink>,
    background_sink: Arc<MemorySink>,
}

fn seeded_store() -> Arc<InMemoryPermissionStore> {
    let store = Arc::new(InMemoryPermissionStore::new());
    store.insert(
        PermissionRequest::new(
            "https://swap.example",
            vec![PermissionType::ViewAccount, PermissionType::SuggestTransactions],
        )
        .with_fav_icon("https://swap.example/favicon.ico"),
    );
    store.insert(PermissionRequest::new(
        "https://nft.example",
        vec![PermissionType::ViewAccount],
    ));
    store
}

/// UI and background dispatchers linked in memory, both loops running.
fn spawn_contexts() -> Contexts {
    let (ui_end, background_end) = InMemoryTransport::pair();
    let ui_sink = Arc::new(MemorySink::new());
    let background_sink = Arc::new(MemorySink::new());

    let ui = Dispatcher::new(
        PayloadRegistry::standard(),
        Arc::new(ui_end.transport),
        ui_sink.clone(),
    );
    let background = Dispatcher::new(
        PayloadRegistry::standard(),
        Arc::new(background_end.transport),
        background_sink.clone(),
    );

    let store = seeded_store();
    register_permission_handlers(&background, store.clone()).expect("register handlers");

    let ui_loop = ui.clone();
    tokio::spawn(async move { ui_loop.run(ui_end.inbound).await });
    let background_loop = background.clone();
    tokio::spawn(async move { background_loop.run(background_end.inbound).await });

    Contexts {
        ui,
        background,
        store,
        ui_sink,
        background_sink,
    }
}

#[tokio::test]
async fn ui_reads_pending_requests_from_background() {
    let contexts = spawn_contexts();
    let client = PermissionClient::new(contexts.ui.clone(), CALL_TIMEOUT);

    let requests = client.pending_requests().await.expect("pending requests");
    let origins: Vec<_> = requests.iter().map(|r| r.origin.as_str()).collect();
    assert_eq!(origins, ["https://swap.example", "https://nft.example"]);
    assert_eq!(
        requests[0].fav_icon.as_deref(),
        Some("https://swap.example/favicon.ico")
    );
    assert!(contexts.ui_sink.is_empty());
    assert!(contexts.background_sink.is_empty());
}

#[tokio::test]
async fn repeated_queries_return_identical_payloads() {
    let contexts = spawn_contexts();

    let first = contexts
        .ui
        .send(Payload::GetPermissionRequests, CALL_TIMEOUT)
        .await
        .expect("first query");
    let second = contexts
        .ui
        .send(Payload::GetPermissionRequests, CALL_TIMEOUT)
        .await
        .expect("second query");

    assert_eq!(first, second);
    assert_eq!(contexts.store.pending().len(), 2, "queries must not consume");
}

#[tokio::test]
async fn answering_a_request_shrinks_the_pending_set() {
    let contexts = spawn_contexts();
    let client = PermissionClient::new(contexts.ui.clone(), CALL_TIMEOUT);

    let pending = client.pending_requests().await.expect("pending");
    let target = pending[0].id;
    client
        .respond(target, vec!["0x5ca1ab1e".into()], true)
        .await
        .expect("respond");

    let remaining = client.pending_requests().await.expect("pending after answer");
    assert_eq!(remaining.len(), 1);
    assert_ne!(remaining[0].id, target);

    let stored = contexts.store.get(target).expect("stored request");
    assert_eq!(stored.allowed, Some(true));
    assert_eq!(stored.accounts, vec!["0x5ca1ab1e".to_string()]);
}

#[tokio::test]
async fn answering_twice_is_a_remote_error() {
    let contexts = spawn_contexts();
    let client = PermissionClient::new(contexts.ui.clone(), CALL_TIMEOUT);
    let target = client.pending_requests().await.expect("pending")[0].id;

    client.respond(target, vec![], false).await.expect("first answer");
    let second = client.respond(target, vec![], true).await;
    assert!(matches!(
        second,
        Err(MessagingError::Remote { code: Some(ref code), .. }) if code == "permission-already-resolved"
    ));
    assert_eq!(contexts.background_sink.len(), 1);
}

#[tokio::test]
async fn background_broadcasts_reach_the_ui_handler() {
    let contexts = spawn_contexts();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    contexts
        .ui
        .register_handler(PayloadKind::PermissionRequestsUpdated, move |payload: &Payload| {
            if let Payload::PermissionRequestsUpdated { requests } = payload {
                let _ = seen_tx.send(requests.len());
            }
            Ok(None)
        })
        .expect("register ui handler");

    broadcast_pending(&contexts.background, contexts.store.as_ref()).expect("broadcast");
    let count = seen_rx.recv().await.expect("notification delivered");
    assert_eq!(count, 2);
    assert_eq!(contexts.background.pending_calls(), 0);
}

#[tokio::test]
async fn ui_without_update_handler_reports_unhandled_payload() {
    let contexts = spawn_contexts();
    broadcast_pending(&contexts.background, contexts.store.as_ref()).expect("broadcast");

    // a round trip through the same ordered channel guarantees the broadcast was processed
    contexts
        .ui
        .send(Payload::GetPermissionRequests, CALL_TIMEOUT)
        .await
        .expect("query");
    assert_eq!(
        contexts.ui_sink.kinds(),
        vec![kless_msg::DiagnosticKind::UnhandledPayload]
    );
}
