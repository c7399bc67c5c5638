//! Subcommand implementations.

use std::time::Duration;

use metabind_core::{
    BindTarget, BoundField, FieldKind, MetadataManager, MetadataSignal, SubscriberId,
};
use miette::{IntoDiagnostic, Result};
use serde_json::Value;
use tokio::sync::watch;
use tracing::info;

use crate::store::DirectoryStore;

/// Interpret a command-line value: JSON if it parses, a plain string otherwise.
pub fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Print the value bound to `declaration` in `document`.
pub async fn get(manager: &MetadataManager, document: &str, declaration: &str) -> Result<()> {
    let target = BindTarget::parse(declaration, document).into_diagnostic()?;
    let value = manager.read(&target).await.into_diagnostic()?;
    println!("{}", value.unwrap_or(Value::Null));
    Ok(())
}

/// Write a value and flush it to disk.
pub async fn set(
    manager: &MetadataManager,
    document: &str,
    declaration: &str,
    raw_value: &str,
    kind: Option<&str>,
) -> Result<()> {
    let target = BindTarget::parse(declaration, document).into_diagnostic()?;
    let value = parse_value(raw_value);

    match kind {
        Some(kind) => {
            let kind: FieldKind = kind.parse().into_diagnostic()?;
            let field = BoundField::mount(manager, kind, target.clone())
                .await
                .into_diagnostic()?;
            field.set_value(value).await.into_diagnostic()?;
            field.unmount();
        }
        None => manager.write(value, &target).await.into_diagnostic()?,
    }

    let written = manager.flush().await.into_diagnostic()?;
    info!(bind = %target, written, "value stored");
    Ok(())
}

/// Print every change to the bound properties until interrupted.
pub async fn watch(
    manager: &MetadataManager,
    store: &std::sync::Arc<DirectoryStore>,
    document: &str,
    declarations: &[String],
    poll_interval: Duration,
) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = store.spawn_poller(poll_interval, shutdown_rx);

    let mut bindings = Vec::with_capacity(declarations.len());
    for declaration in declarations {
        let mut target = BindTarget::parse(declaration, document).into_diagnostic()?;
        target.listen_to_children = true;

        let signal = MetadataSignal::new(None);
        let label = target.to_string();
        signal.register_listener(move |value: &Option<Value>| {
            println!("{label} = {}", value.clone().unwrap_or(Value::Null));
        });

        let subscription = manager
            .subscribe(SubscriberId::new(), &signal, &target, || {})
            .await
            .into_diagnostic()?;
        bindings.push((signal, subscription));
    }
    info!(document, bindings = bindings.len(), "watching for changes");

    tokio::signal::ctrl_c().await.into_diagnostic()?;
    info!("received shutdown signal");

    shutdown_tx.send_replace(true);
    poller.await.into_diagnostic()?;
    drop(bindings);
    Ok(())
}
