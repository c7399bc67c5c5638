//! metabind: bind document metadata from the command line.
//!
//! Documents are JSON files under a root directory. Subcommands:
//! - `get`: print a bound property
//! - `set`: write a bound property and flush it to disk
//! - `watch`: print changes to bound properties as they happen

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use metabind_core::{ManagerConfig, MetadataManager};
use miette::{IntoDiagnostic, Result};
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod store;

use store::DirectoryStore;

#[derive(Parser)]
#[command(name = "metabind")]
#[command(
    about = "Reactive metadata bindings over a directory of JSON documents",
    long_about = None
)]
struct Cli {
    /// Directory holding the documents
    #[arg(long, env = "METABIND_DIR", default_value = ".")]
    dir: PathBuf,

    /// Write-back interval in milliseconds
    #[arg(long, env = "METABIND_TICK_MS", default_value = "200")]
    tick_ms: u64,

    /// Ticks after a local edit during which external edits are ignored
    #[arg(long, env = "METABIND_THRESHOLD", default_value = "5")]
    threshold: u32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the value of a property
    Get {
        /// Document the property belongs to, relative to the directory
        document: String,

        /// Bind target, `[type^][document#]property`
        target: String,
    },

    /// Set the value of a property
    Set {
        /// Document the property belongs to, relative to the directory
        document: String,

        /// Bind target, `[type^][document#]property`
        target: String,

        /// New value, parsed as JSON when possible
        value: String,

        /// Field type used to coerce the value (toggle, text, number, date, list, ...)
        #[arg(long)]
        kind: Option<String>,
    },

    /// Print changes to properties until interrupted
    Watch {
        /// Document the properties belong to, relative to the directory
        document: String,

        /// Bind targets to watch
        #[arg(required = true)]
        targets: Vec<String>,

        /// Interval for checking documents for outside edits, in milliseconds
        #[arg(long, env = "METABIND_POLL_MS", default_value = "500")]
        poll_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "metabind=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = ManagerConfig::default()
        .with_update_cycle_threshold(cli.threshold)
        .with_tick_interval(Duration::from_millis(cli.tick_ms));
    let store = DirectoryStore::new(&cli.dir);
    let manager = MetadataManager::new(store.clone(), config).into_diagnostic()?;

    let result = match cli.command {
        Commands::Get { document, target } => commands::get(&manager, &document, &target).await,

        Commands::Set {
            document,
            target,
            value,
            kind,
        } => commands::set(&manager, &document, &target, &value, kind.as_deref()).await,

        Commands::Watch {
            document,
            targets,
            poll_ms,
        } => {
            commands::watch(
                &manager,
                &store,
                &document,
                &targets,
                Duration::from_millis(poll_ms),
            )
            .await
        }
    };

    let flushed = manager.flush().await.into_diagnostic();
    manager.shutdown().await;
    exit_status(result, flushed)
}

/// The command's own error wins over a failed final flush.
fn exit_status(command: Result<()>, flushed: Result<usize>) -> Result<()> {
    match (command, flushed) {
        (Err(e), Err(flush_error)) => {
            warn!(error = %flush_error, "final flush failed");
            Err(e)
        }
        (command, flushed) => command.and(flushed.map(|_| ())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_error_is_kept_when_flush_also_fails() {
        let err = exit_status(
            Err(miette::miette!("bad target")),
            Err(miette::miette!("disk full")),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "bad target");
    }

    #[test]
    fn test_flush_error_is_reported_after_successful_command() {
        let err = exit_status(Ok(()), Err(miette::miette!("disk full"))).unwrap_err();
        assert_eq!(err.to_string(), "disk full");
        assert!(exit_status(Ok(()), Ok(2)).is_ok());
    }
}
