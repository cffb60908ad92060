use anyhow::{Context, Result};
use clap::{Arg, Command};
use lipchain_chain::{Chain, ChainService, SledChainStore};
use lipchain_consensus::{BlsSigner, ConsensusEngine};
use lipchain_trie::SledNodeStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod keystore;
mod node;
mod transport;

use config::NodeConfig;
use keystore::Keystore;
use node::Node;
use transport::ChannelTransport;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("lipchain-node")
        .about("Permissioned IP-ownership ledger node")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .value_name("FILE")
                .default_value("config/node.toml"),
        )
        .arg(
            Arg::new("data-dir")
                .long("data-dir")
                .value_name("DIR")
                .help("Override the configured data directory"),
        )
        .get_matches();

    let config_path = matches
        .get_one::<String>("config")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config/node.toml"));
    let mut config = NodeConfig::load(&config_path)?;
    if let Some(dir) = matches.get_one::<String>("data-dir") {
        config.node.data_dir = PathBuf::from(dir);
    }

    init_tracing(&config.log.level);
    info!(config = %config_path.display(), data_dir = %config.node.data_dir.display(), "starting node");

    let passphrase = std::env::var(&config.node.passphrase_env)
        .with_context(|| format!("missing passphrase env {}", config.node.passphrase_env))?;
    let identity = Keystore::load_or_create(&config.node.key_file, &passphrase)?;
    info!(address = %identity.address, "identity loaded");

    let db = sled::open(config.node.data_dir.join("chain.db"))?;
    let store = Arc::new(SledChainStore::open(&db)?);
    let nodes = Arc::new(SledNodeStore::new(db.open_tree("trie")?));
    let chain = Chain::new(store, nodes, config.chain_config(), &config.genesis_allocs()?)?;
    let service = ChainService::new(chain);
    let engine = ConsensusEngine::new(Arc::new(BlsSigner::new()));
    let transport = ChannelTransport::new();

    let mut node = Node::new(
        identity,
        config.consensus.clone(),
        service,
        engine,
        transport,
    );
    node.bootstrap(unix_now())?;

    let poll = Duration::from_millis(config.node.poll_interval_ms.max(1));
    loop {
        tokio::select! {
            _ = tokio::time::sleep(poll) => {
                node.run_cycle(unix_now());
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }
    Ok(())
}
