//! `latticed` — a dispatcher daemon for the mesh.
//!
//! A dispatcher accepts peer sessions, registers the services they declare,
//! and forwards requests between them, sharding federated services by their
//! declared key field. It runs the same engine as every other entity; its
//! role comes entirely from configuration.

use anyhow::Result;
use clap::Parser;
use lattice::{
    config::{CliOverrides, CONFIG_FILE},
    Client, NodeConfig, Topology,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "latticed", about = "Mesh dispatcher daemon")]
struct Cli {
    /// Configuration file path.
    #[arg(long, default_value = CONFIG_FILE)]
    config: String,
    #[command(flatten)]
    overrides: CliOverrides,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = NodeConfig::load_from(&cli.config)?.apply(cli.overrides);
    let topology = Topology {
        spn: cfg.spn.clone(),
        ..Topology::default()
    };

    let client = Client::new(cfg);
    client.dial(topology).await?;
    info!(eid = client.eid(), "latticed running");

    wait_for_stop_request().await;
    // The node broadcasts Die to every peer and drains its background
    // tasks before the process exits.
    client.shutdown().await;
    Ok(())
}

/// Block until the operator asks the daemon to stop.
///
/// SIGTERM is honoured where it exists; Ctrl-C works everywhere.
async fn wait_for_stop_request() {
    let interrupt = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        if let Ok(mut term) = signal(SignalKind::terminate()) {
            tokio::select! {
                _ = interrupt => {}
                _ = term.recv() => {}
            }
            return;
        }
    }
    if let Err(err) = interrupt.await {
        tracing::error!(error = %err, "signal listener failed; stopping");
    }
}
