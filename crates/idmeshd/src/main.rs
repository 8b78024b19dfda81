//! idmeshd - identity registry node
//!
//! Runs one node over the in-memory transport until ctrl-c. The production
//! transport plugs in through `idmesh_net::Transport`.

use clap::Parser;
use idmeshd::config::Config;
use idmeshd::node::{load_or_create_keypair, Node, NodeOptions};
use idmeshd::storage::{Persistence, SledStore};
use idmesh_net::MemoryNetwork;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_logging(config: &Config) {
    let directive = if config.verbose { "idmeshd=debug" } else { "idmeshd=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    let registry = tracing_subscriber::registry().with(filter);
    if config.log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;

    let store = Arc::new(SledStore::open(&config.data_dir)?);
    let keypair = load_or_create_keypair(store.as_ref(), config.seed()?)?;

    let network = MemoryNetwork::new();
    let (transport, inbound) = network.join(keypair.peer_id(), config.listen.clone());

    let node = Node::new(
        NodeOptions::from_config(&config),
        keypair,
        Arc::new(transport),
        store.clone(),
    )?;
    info!(peer = %node.peer_id(), data_dir = %config.data_dir.display(), "node initialized");

    let handle = tokio::spawn(node.clone().run(inbound));

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal");
    node.shutdown();

    handle.await??;
    store.flush()?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();
    init_logging(&config);

    info!(
        "idmeshd v{} - identity registry node",
        env!("CARGO_PKG_VERSION")
    );

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("node error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
