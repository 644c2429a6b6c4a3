//! Granite finality node.
//!
//! Hosts the finality engine: loads identity configuration, wires the
//! in/out channels a transport and block-production bus attach to, and runs
//! the engine worker until stdin closes. Block production, peer transport
//! and process supervision belong to the embedding host.
//!
//! # Usage
//!
//! ```bash
//! # full node (observe and relay only)
//! granite-node
//!
//! # block producer with a configuration file
//! granite-node --config node.toml --producer-name alpha
//! ```
//!
//! # Configuration
//!
//! ```toml
//! [[producers]]
//! name = "alpha"
//! key_file = "/etc/granite/alpha.key"   # hex-encoded 32-byte secret
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use granite_core::{EventChannel, FinalityChannel, NetChannel};
use granite_engine::{Engine, EngineWorker, IdentityMode};
use granite_tree::PrefixTree;
use granite_types::{BlockId, KeyPair};
use serde::Deserialize;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Granite finality node.
///
/// Observes the host chain and votes blocks irreversible.
#[derive(Parser, Debug)]
#[command(name = "granite-node")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Act as the named block producer (repeatable); requires a matching
    /// entry in the configuration file
    #[arg(long = "producer-name")]
    producer_names: Vec<String>,

    /// Log filter, e.g. "info" or "granite_engine=debug"
    #[arg(long, default_value = "info")]
    log_filter: String,
}

#[derive(Debug, Default, Deserialize)]
struct NodeConfig {
    #[serde(default)]
    producers: Vec<ProducerConfig>,
}

#[derive(Debug, Deserialize)]
struct ProducerConfig {
    name: String,
    key_file: PathBuf,
}

fn load_config(path: Option<&Path>) -> Result<NodeConfig> {
    let Some(path) = path else {
        return Ok(NodeConfig::default());
    };
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
}

fn load_keypair(path: &Path) -> Result<KeyPair> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading key file {}", path.display()))?;
    let bytes = hex::decode(raw.trim())
        .with_context(|| format!("decoding key file {}", path.display()))?;
    let bytes: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("key file {} is not 32 bytes", path.display()))?;
    KeyPair::from_bytes(&bytes).with_context(|| format!("invalid key in {}", path.display()))
}

fn identity_mode(cli: &Cli, config: &NodeConfig) -> Result<IdentityMode> {
    if cli.producer_names.is_empty() {
        return Ok(IdentityMode::FullNode);
    }

    let mut keypairs = Vec::with_capacity(cli.producer_names.len());
    for name in &cli.producer_names {
        let Some(producer) = config.producers.iter().find(|p| &p.name == name) else {
            bail!("producer {name} is not present in the configuration file");
        };
        keypairs.push(load_keypair(&producer.key_file)?);
    }
    Ok(IdentityMode::producer_from_keypairs(&keypairs))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_filter)),
        )
        .init();

    let config = load_config(cli.config.as_deref())?;
    let mode = identity_mode(&cli, &config)?;
    match &mode {
        IdentityMode::FullNode => info!("starting as a full node"),
        IdentityMode::BlockProducer { public_keys, .. } => {
            info!(producers = public_keys.len(), "starting as a block producer");
        }
    }

    // the host chain attaches its transport to in_net/out_net, its event
    // bus to in_event, and consumes finality notifications
    let in_net = NetChannel::new();
    let in_event = EventChannel::new();
    let out_net = Arc::new(NetChannel::new());
    let finality = Arc::new(FinalityChannel::new());
    finality.subscribe(|block_id| info!(block = %block_id, "block finalized"));

    let tree = PrefixTree::new(BlockId::ZERO);
    let engine = Engine::new(mode, tree, out_net, finality.clone())
        .context("constructing the engine")?;
    let worker = EngineWorker::spawn(engine, &in_net, &in_event);
    info!("engine worker running; close stdin to stop");

    // lifecycle belongs to the host; standing alone we just wait for EOF
    let mut sink = Vec::new();
    let _ = std::io::stdin().read_to_end(&mut sink);

    info!("shutting down");
    let engine = worker.stop();
    info!(lib = %engine.lib(), "stopped");
    Ok(())
}
