//! ---
//! kless_section: "05-networking-external-interfaces"
//! kless_subsection: "binary"
//! kless_type: "source"
//! kless_scope: "code"
//! kless_description: "Control CLI exercising the messaging core."
//! kless_version: "v0.0.0-prealpha"
//! kless_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use kless_common::{AppConfig, PermissionSeed, TransportKind};
use kless_msg::types::{PermissionRequest, PermissionType};
use kless_msg::{
    broadcast_pending, register_permission_handlers, Dispatcher, InMemoryPermissionStore,
    InMemoryTransport, Payload, PayloadKind, PermissionClient,
};
use tracing::info;

#[derive(Debug, Default, Args)]
pub struct DemoArgs {
    #[arg(
        long,
        help = "Per-call timeout in milliseconds (overrides messaging.default_timeout_ms)"
    )]
    pub timeout_ms: Option<u64>,
    #[arg(long, help = "Approve the oldest pending request after listing")]
    pub approve_first: bool,
    #[arg(long, default_value = "0x0", help = "Account exposed when approving")]
    pub account: String,
}

pub(crate) fn seed_request(seed: &PermissionSeed) -> Result<PermissionRequest> {
    let permissions = seed
        .permissions
        .iter()
        .map(|name| {
            name.parse::<PermissionType>()
                .with_context(|| format!("unknown permission `{name}` for {}", seed.origin))
        })
        .collect::<Result<Vec<_>>>()?;
    let mut request = PermissionRequest::new(&seed.origin, permissions);
    if let Some(icon) = &seed.fav_icon {
        request = request.with_fav_icon(icon);
    }
    Ok(request)
}

fn seeded_store(config: &AppConfig) -> Result<Arc<InMemoryPermissionStore>> {
    let store = Arc::new(InMemoryPermissionStore::new());
    for seed in &config.permissions.seed {
        store.insert(seed_request(seed)?);
    }
    if store.is_empty() {
        store.insert(PermissionRequest::new(
            "https://demo.kless.invalid",
            vec![PermissionType::ViewAccount, PermissionType::SuggestTransactions],
        ));
    }
    Ok(store)
}

pub async fn run(config: &AppConfig, args: DemoArgs) -> Result<()> {
    let timeout = args
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(config.messaging.default_timeout);
    let (ui_end, background_end) = match config.messaging.transport {
        TransportKind::InMemory => InMemoryTransport::pair(),
    };

    let store = seeded_store(config)?;
    let background = Dispatcher::builder(Arc::new(background_end.transport))
        .settled_history(config.messaging.settled_history)
        .build();
    register_permission_handlers(&background, store.clone())?;

    let ui = Dispatcher::builder(Arc::new(ui_end.transport))
        .settled_history(config.messaging.settled_history)
        .build();
    ui.register_handler(PayloadKind::PermissionRequestsUpdated, |payload: &Payload| {
        if let Payload::PermissionRequestsUpdated { requests } = payload {
            info!(pending = requests.len(), "pending permission set changed");
        }
        Ok(None)
    })?;

    let background_loop = background.clone();
    tokio::spawn(async move { background_loop.run(background_end.inbound).await });
    let ui_loop = ui.clone();
    tokio::spawn(async move { ui_loop.run(ui_end.inbound).await });

    let client = PermissionClient::new(ui.clone(), timeout);
    let first = client.pending_requests().await?;
    let second = client.pending_requests().await?;
    println!("{}", serde_json::to_string_pretty(&first)?);
    println!("identical on retry: {}", first == second);

    if args.approve_first {
        if let Some(request) = first.first() {
            client
                .respond(request.id, vec![args.account.clone()], true)
                .await
                .with_context(|| format!("approving {}", request.origin))?;
            broadcast_pending(&background, store.as_ref())?;
            let remaining = client.pending_requests().await?;
            println!("approved {}; {} still pending", request.origin, remaining.len());
        }
    }

    let metrics = ui.metrics();
    info!(
        sent = metrics.sent,
        received = metrics.received,
        replies = metrics.replies,
        timeouts = metrics.timeouts,
        "ui context finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeds_become_pending_requests() {
        let seed = PermissionSeed {
            origin: "https://a.example".into(),
            fav_icon: Some("https://a.example/icon.png".into()),
            permissions: vec!["viewAccount".into(), "suggestSignMessages".into()],
        };
        let request = seed_request(&seed).expect("valid seed");
        assert_eq!(request.origin, "https://a.example");
        assert_eq!(
            request.permissions,
            vec![PermissionType::ViewAccount, PermissionType::SuggestSignMessages]
        );
        assert!(request.is_pending());
    }

    #[test]
    fn unknown_permission_names_are_rejected() {
        let seed = PermissionSeed {
            origin: "https://a.example".into(),
            fav_icon: None,
            permissions: vec!["drainWallet".into()],
        };
        let err = seed_request(&seed).expect_err("unknown permission");
        assert!(format!("{err:#}").contains("drainWallet"));
    }

    #[tokio::test]
    async fn demo_runs_end_to_end_with_defaults() {
        let args = DemoArgs {
            approve_first: true,
            account: "0xfeed".into(),
            ..DemoArgs::default()
        };
        run(&AppConfig::default(), args).await.expect("demo succeeds");
    }
}
