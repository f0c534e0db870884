//! Cairn Server: application entry point.
//!
//! Opens the migrated document store, wires the engines, and
//! makes sure the certificate authority hierarchy exists. Request routing
//! is provided by collaborators that call into the engines.

mod args;
mod services;

use std::sync::Arc;

use anyhow::{Context, Result};
use cairn_core::clock::{Clock, SystemClock};
use cairn_core::context::RequestContext;
use cairn_core::memory::{MemoryBlobStore, MemoryKeyVault};
use cairn_db::{SurrealDocumentStore, open_in_memory, open_remote};
use clap::Parser;
use surrealdb::{Connection, Surreal};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::args::Args;
use crate::services::Services;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cairn=info")),
        )
        .json()
        .init();

    info!("Starting Cairn server...");

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    if args.ephemeral {
        warn!("Ephemeral mode: documents are lost on exit");
        let db = open_in_memory(&args.db_config())
            .await
            .context("starting in-process SurrealDB")?;
        run(db, &args, shutdown).await?;
    } else {
        let db = open_remote(&args.db_config())
            .await
            .context("connecting to SurrealDB")?;
        run(db, &args, shutdown).await?;
    }

    info!("Cairn server stopped.");
    Ok(())
}

async fn run<C: Connection>(
    db: Surreal<C>,
    args: &Args,
    shutdown: CancellationToken,
) -> Result<()> {
    // TODO: replace with the remote vault and object store clients once
    // their endpoints are configurable.
    warn!("Using the in-process key vault and blob store; keys do not survive a restart");
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let services = Services::new(
        Arc::new(SurrealDocumentStore::new(db).with_clock(Arc::clone(&clock))),
        Arc::new(MemoryBlobStore::new()),
        Arc::new(MemoryKeyVault::new()),
        clock,
        args,
    )?;

    let ctx = RequestContext::system().with_cancellation(shutdown.child_token());
    services
        .bootstrap(&ctx, &args.intermediates)
        .await
        .context("bootstrapping certificate authorities")?;

    info!(
        intermediates = args.intermediates.len(),
        pool_capacity = services.agents.capacity(),
        "Cairn server ready"
    );
    shutdown.cancelled().await;
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => error!(error = %err, "Failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
