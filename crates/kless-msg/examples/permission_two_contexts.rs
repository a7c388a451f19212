//! ---
//! kless_section: "02-messaging-ipc"
//! kless_subsection: "example"
//! kless_type: "source"
//! kless_scope: "code"
//! kless_description: "UI and background contexts exchanging permission requests."
//! kless_version: "v0.0.0-prealpha"
//! kless_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use kless_msg::types::{PermissionRequest, PermissionType};
use kless_msg::{
    register_permission_handlers, Dispatcher, InMemoryPermissionStore, InMemoryTransport,
    PermissionClient,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let (ui_end, background_end) = InMemoryTransport::pair();

    // Background context owns the store and serves it.
    let background = Dispatcher::builder(Arc::new(background_end.transport)).build();
    let store = Arc::new(InMemoryPermissionStore::new());
    store.insert(PermissionRequest::new(
        "https://swap.example",
        vec![PermissionType::ViewAccount, PermissionType::SuggestTransactions],
    ));
    register_permission_handlers(&background, store)?;

    // UI context only issues calls.
    let ui = Dispatcher::builder(Arc::new(ui_end.transport)).build();

    let background_loop = background.clone();
    tokio::spawn(async move { background_loop.run(background_end.inbound).await });
    let ui_loop = ui.clone();
    tokio::spawn(async move { ui_loop.run(ui_end.inbound).await });

    let client = PermissionClient::new(ui, Duration::from_secs(1));
    let pending = client.pending_requests().await?;
    println!("UI sees {} pending request(s)", pending.len());
    for request in &pending {
        println!("  origin={} id={}", request.origin, request.id);
    }
    Ok(())
}
